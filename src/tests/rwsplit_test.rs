use test_env_log::test;

use crate::tests::common::*;
use crate::sluicedb::ErrorType;
use crate::sluicedb::config::{MasterFailureMode, StaticStatus};
use crate::sluicedb::mysql::backend::{BackendEvent, BackendEventKind};
use crate::sluicedb::mysql::client::{ClientState, RoutingState};
use crate::sluicedb::mysql::protocol::packet::sequence;
use crate::sluicedb::mysql::protocol::packet_builder::query_packet;
use crate::sluicedb::router::EndpointState;

/// The server that received sql last.
fn target_of(proxy: &Proxy, sql: &str) -> String {
    proxy.backends.take_writes().into_iter()
        .filter(|w| w.sql() == Some(sql))
        .map(|w| w.server)
        .last()
        .unwrap_or_default()
}

#[test]
fn test_reads_and_writes() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();

    let out = client.query("SELECT id FROM orders");
    assert!(is_ok(&out));
    let reader = target_of(&proxy, "SELECT id FROM orders");
    assert!(reader == "db2" || reader == "db3", "read went to {}", reader);

    let out = client.query("INSERT INTO orders VALUES (1)");
    assert!(is_ok(&out));
    assert_eq!(target_of(&proxy, "INSERT INTO orders VALUES (1)"), "db1");
}

#[test]
fn test_session_command_goes_everywhere() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();

    let out = client.query("SET NAMES utf8mb4");
    // one reply for the client, the others are only compared with it
    assert!(is_ok(&out), "{:?}", out);
    let mut servers: Vec<String> = proxy.backends.take_writes().into_iter().map(|w| w.server).collect();
    servers.sort();
    assert_eq!(servers, vec!["db1", "db2", "db3"]);
    let router = client.conn.router().expect("router session");
    assert_eq!(router.history().len(), 1);
    assert!(router.endpoints().iter().all(|ep| ep.state() == EndpointState::Connected));
}

#[test]
fn test_transaction_stays_on_master() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();

    assert!(is_ok(&client.query("BEGIN")));
    assert!(client.conn.router().map(|r| r.trx().is_trx_active()).unwrap_or(false));
    assert!(is_ok(&client.query("SELECT balance FROM accounts")));
    assert!(is_ok(&client.query("COMMIT")));
    assert_eq!(proxy.backends.statements("db1"), vec!["BEGIN", "SELECT balance FROM accounts", "COMMIT"]);
    assert!(proxy.backends.statements("db2").is_empty());
    assert!(proxy.backends.statements("db3").is_empty());
    assert!(!client.conn.router().map(|r| r.trx().is_trx_active()).unwrap_or(true));

    proxy.backends.take_writes();
    assert!(is_ok(&client.query("SELECT balance FROM accounts")));
    assert_ne!(target_of(&proxy, "SELECT balance FROM accounts"), "db1");
}

#[test]
fn test_use_and_set_role() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();

    assert!(is_ok(&client.query("USE shop")));
    assert_eq!(client.conn.db(), "shop");
    assert!(is_ok(&client.query("SET ROLE admin")));
    assert_eq!(client.conn.role(), Some("admin"));
    assert!(is_ok(&client.query("SET ROLE NONE")));
    assert_eq!(client.conn.role(), None);

    for server in &["db1", "db2", "db3"] {
        proxy.backends.fail_next(server, 1049, "Unknown database 'nope'");
    }
    let out = client.query("USE nope");
    assert_eq!(out.len(), 1);
    assert_eq!(err_code(&out[0]), Some(1049));
    assert_eq!(client.conn.db(), "shop");
    assert_eq!(client.conn.state(), ClientState::Ready);
}

#[test]
fn test_commands_wait_for_state_change() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();
    proxy.backends.hold(true);

    let mut data = query_packet("USE shop").to_vec();
    data.extend_from_slice(&query_packet("SELECT 1"));
    let out = client.send(&data);
    assert!(out.is_empty());
    assert_eq!(client.conn.routing_state(), RoutingState::ChangingState);
    // the SELECT is held back until the USE is answered
    assert!(proxy.backends.take_writes().iter().all(|w| w.sql() == Some("USE shop")));

    proxy.backends.hold(false);
    proxy.backends.release();
    let out = client.output();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|p| is_ok(std::slice::from_ref(p))));
    assert_eq!(client.conn.db(), "shop");
    assert_eq!(client.conn.routing_state(), RoutingState::PacketStart);
    assert!(proxy.backends.take_writes().iter().any(|w| w.sql() == Some("SELECT 1")));
}

#[test]
fn test_error_on_write_without_master() {
    let proxy = Proxy::new(settings_with(|s| {
        s.service.servers[0].status = Some(StaticStatus::Down);
        s.service.router.master_failure_mode = MasterFailureMode::ErrorOnWrite;
    }));
    let mut client = proxy.logged_in();

    let out = client.query("INSERT INTO orders VALUES (1)");
    assert_eq!(out.len(), 1);
    assert_eq!(err_code(&out[0]), Some(1290));
    assert_eq!(client.conn.state(), ClientState::Ready);
    assert!(proxy.backends.statements("db1").is_empty());

    assert!(is_ok(&client.query("SELECT 1")));
}

#[test]
fn test_no_master_fails_session() {
    let proxy = Proxy::new(settings_with(|s| s.service.servers[0].status = Some(StaticStatus::Down)));
    let mut client = proxy.client();
    let out = client.login(TEST_USER, TEST_PASSWORD, "");
    assert_eq!(out.len(), 1);
    assert!(err_code(&out[0]).is_some());
    assert_eq!(client.conn.state(), ClientState::Failed);
}

#[test]
fn test_failed_read_is_retried() {
    let proxy = Proxy::new(settings_with(|s| s.service.servers[2].status = Some(StaticStatus::Down)));
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();
    proxy.backends.hold(true);

    assert!(client.query("SELECT 1").is_empty());
    let write = proxy.backends.take_writes().pop().expect("select was written");
    assert_eq!(write.server, "db2");
    client.inject(BackendEvent { conn_id: write.conn_id, kind: BackendEventKind::Error(ErrorType::Permanent, "connection reset".to_string()) });
    assert!(client.output().is_empty());
    assert_eq!(target_of(&proxy, "SELECT 1"), "db1");

    proxy.backends.hold(false);
    proxy.backends.release();
    let out = client.output();
    assert!(is_ok(&out), "{:?}", out);
    assert!(proxy.backends.closed().contains(&write.conn_id));
    let router = client.conn.router().expect("router session");
    assert_eq!(router.endpoints()[1].state(), EndpointState::ConnectedFailed);
}

#[test]
fn test_lost_write_fails_session() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.take_writes();
    proxy.backends.hold(true);

    assert!(client.query("INSERT INTO orders VALUES (1)").is_empty());
    let write = proxy.backends.take_writes().pop().expect("insert was written");
    assert_eq!(write.server, "db1");
    client.inject(BackendEvent { conn_id: write.conn_id, kind: BackendEventKind::Closed });
    let out = client.output();
    assert_eq!(out.len(), 1);
    assert_eq!(err_code(&out[0]), Some(1927));
    assert_eq!(client.conn.state(), ClientState::Failed);
}

#[test]
fn test_read_without_servers_keeps_session() {
    let proxy = Proxy::new(settings_with(|s| {
        s.service.servers[0].status = Some(StaticStatus::Down);
        s.service.servers[2].status = Some(StaticStatus::Down);
        s.service.router.master_failure_mode = MasterFailureMode::ErrorOnWrite;
    }));
    let mut client = proxy.logged_in();
    assert!(is_ok(&client.query("SELECT 1")));

    // the only replica goes away while idle and can't be reached again
    let conn_id = client.conn.router().and_then(|r| r.endpoints()[1].conn_id()).expect("db2 connected");
    proxy.backends.refuse("db2");
    client.inject(BackendEvent { conn_id, kind: BackendEventKind::Error(ErrorType::Permanent, "connection reset".to_string()) });
    assert!(client.output().is_empty());
    assert_eq!(client.conn.state(), ClientState::Ready);

    let out = client.query("SELECT 2");
    assert_eq!(out.len(), 1);
    assert_eq!(sequence(&out[0]), 1);
    assert_eq!(err_code(&out[0]), Some(1105));
    assert_eq!(client.conn.state(), ClientState::Ready);
}

#[test]
fn test_lost_master_fails_instantly() {
    let proxy = Proxy::new(settings_with(|s| {
        s.service.servers[2].status = Some(StaticStatus::Down);
        s.service.router.master_failure_mode = MasterFailureMode::FailInstantly;
    }));
    let mut client = proxy.logged_in();
    let router = client.conn.router().expect("router session");
    let ids: Vec<u64> = router.endpoints()[..2].iter().filter_map(|ep| ep.conn_id()).collect();
    assert_eq!(ids.len(), 2);

    // losing a replica is fine, losing the master isn't
    client.inject(BackendEvent { conn_id: ids[1], kind: BackendEventKind::Error(ErrorType::Permanent, "connection reset".to_string()) });
    assert!(client.output().is_empty());
    assert_eq!(client.conn.state(), ClientState::Ready);
    client.inject(BackendEvent { conn_id: ids[0], kind: BackendEventKind::Error(ErrorType::Permanent, "connection reset".to_string()) });
    let out = client.output();
    assert_eq!(out.len(), 1);
    assert_eq!(err_code(&out[0]), Some(1927));
    assert_eq!(client.conn.state(), ClientState::Failed);
}
