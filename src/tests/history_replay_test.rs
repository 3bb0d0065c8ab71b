use test_env_log::test;

use crate::tests::common::*;
use crate::sluicedb::config::{Settings, StaticStatus};
use crate::sluicedb::mysql::backend::{BackendEvent, BackendEventKind};
use crate::sluicedb::router::EndpointState;

/// Only the master is connected at first, db3 is down so new reads go to db2.
fn one_replica(s: &mut Settings) {
    s.service.servers[2].status = Some(StaticStatus::Down);
    s.service.router.slave_connections = 0;
}

#[test]
fn test_history_replayed_on_new_connection() {
    let proxy = Proxy::new(settings_with(one_replica));
    let mut client = proxy.logged_in();
    let connected: Vec<String> = proxy.backends.connects().into_iter().map(|(s, _)| s).collect();
    assert_eq!(connected, vec!["db1"]);

    assert!(is_ok(&client.query("SET NAMES utf8mb4")));
    assert!(is_ok(&client.query("SET sql_mode = 'ANSI'")));
    let out = client.query("SELECT 1");
    assert!(is_ok(&out), "{:?}", out);

    assert_eq!(proxy.backends.statements("db2"), vec!["SET NAMES utf8mb4", "SET sql_mode = 'ANSI'", "SELECT 1"]);
    let router = client.conn.router().expect("router session");
    assert_eq!(router.history().len(), 2);
    assert_eq!(router.endpoints()[1].state(), EndpointState::Connected);
}

#[test]
fn test_replay_mismatch_closes_connection() {
    let proxy = Proxy::new(settings_with(one_replica));
    let mut client = proxy.logged_in();
    assert!(is_ok(&client.query("SET NAMES utf8mb4")));

    proxy.backends.fail_next("db2", 1115, "Unknown character set: 'utf8mb4'");
    let out = client.query("SELECT 1");
    // the read moves to the master, the client never sees the failed replay
    assert!(is_ok(&out), "{:?}", out);
    assert_eq!(proxy.backends.statements("db1"), vec!["SET NAMES utf8mb4", "SELECT 1"]);
    let router = client.conn.router().expect("router session");
    assert_eq!(router.endpoints()[1].state(), EndpointState::ConnectedFailed);

    // a failed endpoint isn't used again
    let out = client.query("SELECT 2");
    assert!(is_ok(&out));
    assert!(!proxy.backends.statements("db2").iter().any(|s| s == "SELECT 2"));
}

#[test]
fn test_secondary_mismatch_closes_connection() {
    let proxy = Proxy::new(settings());
    let mut client = proxy.logged_in();
    proxy.backends.fail_next("db3", 1193, "Unknown system variable 'foo'");
    let out = client.query("SET foo = 1");
    assert!(is_ok(&out), "{:?}", out);
    let router = client.conn.router().expect("router session");
    assert_eq!(router.endpoints()[2].state(), EndpointState::ConnectedFailed);
    assert_eq!(router.endpoints()[1].state(), EndpointState::Connected);
    assert_eq!(client.conn.state(), crate::sluicedb::mysql::client::ClientState::Ready);
}

#[test]
fn test_disabled_history_blocks_new_connections() {
    let proxy = Proxy::new(settings_with(|s| {
        one_replica(s);
        s.service.router.disable_sescmd_history = true;
    }));
    let mut client = proxy.logged_in();
    assert!(is_ok(&client.query("SET NAMES utf8mb4")));
    assert!(client.conn.router().map(|r| r.history().is_empty()).unwrap_or(false));

    // a new connection couldn't be brought to the same state
    assert!(is_ok(&client.query("SELECT 1")));
    assert!(proxy.backends.statements("db2").is_empty());
    assert_eq!(proxy.backends.statements("db1"), vec!["SET NAMES utf8mb4", "SELECT 1"]);
}

#[test]
fn test_history_limit_without_pruning() {
    let proxy = Proxy::new(settings_with(|s| {
        one_replica(s);
        s.service.router.max_sescmd_history = 2;
        s.service.router.prune_sescmd_history = false;
    }));
    let mut client = proxy.logged_in();
    for sql in &["SET NAMES utf8mb4", "SET sql_mode = 'ANSI'", "SET time_zone = '+00:00'"] {
        assert!(is_ok(&client.query(sql)));
    }
    // the history overflowed and was disabled, the reads stay on the master
    assert!(is_ok(&client.query("SELECT 1")));
    assert!(proxy.backends.statements("db2").is_empty());
}

/// The statements and the executed statement id a connection received, in order.
fn connection_log(proxy: &Proxy, conn_id: u64) -> (Vec<String>, Option<u32>) {
    let writes: Vec<Write> = proxy.backends.take_writes().into_iter().filter(|w| w.conn_id == conn_id).collect();
    let sql = writes.iter().filter_map(|w| w.sql().map(|s| s.to_string())).collect();
    (sql, writes.iter().filter_map(|w| w.executed_stmt()).last())
}

#[test]
fn test_replayed_connection_has_same_state() {
    let proxy = Proxy::new(settings_with(one_replica));
    let mut client = proxy.logged_in();
    assert!(is_ok(&client.query("USE shop")));
    assert!(is_ok(&client.query("PREPARE s1 FROM 'SELECT 1'")));
    let stmt = client.prepare("SELECT id FROM orders WHERE id = 1");
    assert!(is_ok(&client.query("SET ROLE admin")));
    let expected = vec![
        "USE shop".to_string(),
        "PREPARE s1 FROM 'SELECT 1'".to_string(),
        "SELECT id FROM orders WHERE id = 1".to_string(),
        "SET ROLE admin".to_string(),
    ];
    assert_eq!(proxy.backends.statements("db1"), expected);
    proxy.backends.take_writes();

    // the read opens db2, which gets the whole history first
    let out = client.execute(stmt);
    assert!(is_ok(&out), "{:?}", out);
    let conn_id = client.conn.router().and_then(|r| r.endpoints()[1].conn_id()).expect("db2 connected");
    let (sql, executed) = connection_log(&proxy, conn_id);
    assert_eq!(sql, expected);
    let (_, _, first_id) = proxy.backends.prepared().into_iter().find(|(_, c, _)| *c == conn_id).expect("prepare replayed");
    assert_ne!(first_id, stmt);
    assert_eq!(executed, Some(first_id));

    // lose the connection and do it again on a fresh one
    client.inject(BackendEvent { conn_id, kind: BackendEventKind::Closed });
    assert!(client.output().is_empty());
    assert_eq!(client.conn.router().map(|r| r.endpoints()[1].state()), Some(EndpointState::NoConn));

    let out = client.execute(stmt);
    assert!(is_ok(&out), "{:?}", out);
    let new_conn = client.conn.router().and_then(|r| r.endpoints()[1].conn_id()).expect("db2 reconnected");
    assert_ne!(new_conn, conn_id);
    let (sql, executed) = connection_log(&proxy, new_conn);
    assert_eq!(sql, expected);
    let (_, _, second_id) = proxy.backends.prepared().into_iter().find(|(_, c, _)| *c == new_conn).expect("prepare replayed");
    assert_ne!(second_id, first_id);
    assert_eq!(executed, Some(second_id));

    assert_eq!(client.conn.db(), "shop");
    assert_eq!(client.conn.role(), Some("admin"));
}
