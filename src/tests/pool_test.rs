use test_env_log::test;

use crate::tests::common::*;
use crate::sluicedb::config::{Settings, StaticStatus};
use crate::sluicedb::mysql::client::ClientState;
use crate::sluicedb::mysql::protocol::packet_builder::command_packet;
use crate::sluicedb::router::EndpointState;

/// db2 is the only replica and takes a single routing connection.
fn one_slot(s: &mut Settings) {
    s.service.servers[1].max_routing_connections = 1;
    s.service.servers[2].status = Some(StaticStatus::Down);
}

fn pooled(s: &mut Settings) {
    for server in s.service.servers.iter_mut() {
        server.persist_pool_max = 1;
    }
    s.service.pool.idle_session_pool_time = 10;
}

fn endpoint_states(client: &TestClient) -> Vec<EndpointState> {
    client.conn.router().expect("router session").endpoints().iter().map(|ep| ep.state()).collect()
}

#[test]
fn test_lazy_connect() {
    let proxy = Proxy::new(settings_with(|s| s.service.router.lazy_connect = true));
    let mut client = proxy.logged_in();
    assert!(proxy.backends.connects().is_empty());

    assert!(is_ok(&client.query("SELECT 1")));
    let servers: Vec<String> = proxy.backends.connects().into_iter().map(|(s, _)| s).collect();
    assert_eq!(servers.len(), 1);
    assert_ne!(servers[0], "db1");

    assert!(is_ok(&client.query("INSERT INTO orders VALUES (1)")));
    assert_eq!(proxy.backends.connects().len(), 2);
    assert_eq!(proxy.backends.statements("db1"), vec!["INSERT INTO orders VALUES (1)"]);
}

#[test]
fn test_read_falls_back_to_master_at_slot_limit() {
    let proxy = Proxy::new(settings_with(one_slot));
    let _a = proxy.logged_in();
    let mut b = proxy.logged_in();
    assert_eq!(proxy.service().targets()[1].routing_connections(), 1);
    assert_eq!(endpoint_states(&b)[1], EndpointState::NoConn);

    assert!(is_ok(&b.query("SELECT 1")));
    assert_eq!(proxy.backends.statements("db1"), vec!["SELECT 1"]);
    assert!(proxy.backends.statements("db2").is_empty());
}

#[test]
fn test_wait_for_connection_slot() {
    let proxy = Proxy::new(settings_with(|s| {
        one_slot(s);
        s.service.pool.wait_for_connection = true;
    }));
    let mut a = proxy.logged_in();
    let mut b = proxy.logged_in();
    assert_eq!(endpoint_states(&b)[1], EndpointState::WaitingForConn);

    // the read is buffered until db2 has a free slot
    assert!(b.query("SELECT 1").is_empty());
    assert!(proxy.backends.statements("db2").is_empty());

    a.send(&command_packet(&[0x01]));
    a.finish();
    let out = b.output();
    assert!(is_ok(&out), "{:?}", out);
    assert_eq!(proxy.backends.statements("db2"), vec!["SELECT 1"]);
    assert_eq!(endpoint_states(&b)[1], EndpointState::Connected);
    assert_eq!(proxy.service().targets()[1].routing_connections(), 1);
}

#[test]
fn test_connection_slot_wait_times_out() {
    let proxy = Proxy::new(settings_with(|s| {
        one_slot(s);
        s.service.pool.wait_for_connection = true;
        s.service.pool.multiplex_timeout = 5;
    }));
    let _a = proxy.logged_in();
    let mut b = proxy.logged_in();
    assert!(b.query("SELECT 1").is_empty());

    assert!(b.tick(4).is_empty());
    assert_eq!(b.conn.state(), ClientState::Ready);
    let out = b.tick(5);
    assert_eq!(out.len(), 1);
    assert_eq!(err_code(&out[0]), Some(1927));
    assert_eq!(b.conn.state(), ClientState::Failed);
}

#[test]
fn test_idle_session_reuses_pooled_connection() {
    let proxy = Proxy::new(settings_with(pooled));
    let mut client = proxy.logged_in();
    assert!(is_ok(&client.query("SET NAMES utf8mb4")));

    assert!(client.tick(9).is_empty());
    assert!(endpoint_states(&client).iter().all(|s| *s == EndpointState::Connected));
    assert!(client.tick(10).is_empty());
    assert!(endpoint_states(&client).iter().all(|s| *s == EndpointState::IdlePooled));
    assert!(proxy.backends.closed().is_empty());
    proxy.backends.take_writes();

    // the pooled connection is reset for the user and brought back to the session's state
    let out = client.query("SELECT 1");
    assert!(is_ok(&out), "{:?}", out);
    assert_eq!(proxy.backends.connects().len(), 3);
    assert_eq!(proxy.backends.resets().len(), 1);
    assert_eq!(proxy.backends.resets()[0].1, TEST_USER);
    let writes = proxy.backends.take_writes();
    let sql: Vec<&str> = writes.iter().filter_map(|w| w.sql()).collect();
    assert_eq!(sql, vec!["SET NAMES utf8mb4", "SELECT 1"]);
    assert_ne!(writes[0].server, "db1");
}

#[test]
fn test_pooled_connection_used_by_other_session() {
    let proxy = Proxy::new(settings_with(pooled));
    let mut a = proxy.logged_in();
    let master_conn = a.conn.router().and_then(|r| r.endpoints()[0].conn_id()).expect("master connected");
    a.send(&command_packet(&[0x01]));
    a.finish();
    assert!(proxy.backends.closed().is_empty());

    let mut b = proxy.client();
    let out = b.login(OTHER_USER, OTHER_PASSWORD, "");
    assert!(is_ok(&out), "{:?}", out);
    // every connection came from the pool, reset for the new user
    assert_eq!(proxy.backends.connects().len(), 3);
    let resets = proxy.backends.resets();
    assert_eq!(resets.len(), 3);
    assert!(resets.iter().all(|(_, u)| u == OTHER_USER));
    assert_eq!(b.conn.router().and_then(|r| r.endpoints()[0].conn_id()), Some(master_conn));
    assert!(is_ok(&b.query("INSERT INTO orders VALUES (1)")));
}
