use test_env_log::test;

use crate::tests::common::*;
use crate::sluicedb::mysql::client::{execute_kill, Action, ClientState, RoutingState};
use crate::sluicedb::mysql::protocol::packet::sequence;
use crate::sluicedb::mysql::sql::KillRequest;

/// Sends sql and returns the KILL the session handed to its driver.
fn kill_request(client: &mut TestClient, sql: &str) -> KillRequest {
    let out = client.query(sql);
    assert!(out.is_empty(), "{:?}", out);
    assert_eq!(client.conn.routing_state(), RoutingState::Killing);
    match client.conn.take_action() {
        Some(Action::Kill(req)) => req,
        other => panic!("expected a kill action, got {:?}", other),
    }
}

#[test(tokio::test)]
#[serial_test::serial]
async fn test_kill_connection() {
    let proxy = Proxy::new(settings());
    proxy.side.fail_on("db3");
    let mut a = proxy.logged_in();
    let mut b = proxy.client();
    assert!(is_ok(&b.login(OTHER_USER, OTHER_PASSWORD, "")));
    let mut thread_ids: Vec<(String, u32)> = b.conn.router().expect("router session").endpoints().iter()
        .map(|ep| (ep.server().name().to_string(), ep.thread_id()))
        .collect();
    thread_ids.sort();

    let req = kill_request(&mut a, &format!("KILL {}", b.id()));
    execute_kill(proxy.ctx.clone(), a.id(), req).await;

    let mut executed = proxy.side.executed();
    executed.sort();
    let expected: Vec<(String, String)> = thread_ids.into_iter()
        .map(|(server, tid)| (server, format!("KILL CONNECTION {}", tid)))
        .collect();
    // the failed side connection to db3 doesn't fail the KILL
    assert_eq!(executed, expected);

    let out = a.output();
    assert!(is_ok(&out), "{:?}", out);
    assert_eq!(sequence(&out[0]), 1);
    assert_eq!(a.conn.routing_state(), RoutingState::PacketStart);

    let out = b.output();
    assert_eq!(out.len(), 1);
    assert_eq!(sequence(&out[0]), 0);
    assert_eq!(err_code(&out[0]), Some(1927));
    assert_eq!(b.conn.state(), ClientState::Failed);
    b.finish();

    // the killer carries on
    assert!(is_ok(&a.query("SELECT 1")));
}

#[test(tokio::test)]
#[serial_test::serial]
async fn test_kill_query_keeps_session() {
    let proxy = Proxy::new(settings());
    let mut a = proxy.logged_in();
    let mut b = proxy.logged_in();

    let req = kill_request(&mut a, &format!("KILL QUERY {}", b.id()));
    execute_kill(proxy.ctx.clone(), a.id(), req).await;

    assert_eq!(proxy.side.executed().len(), 3);
    assert!(proxy.side.executed().iter().all(|(_, sql)| sql.starts_with("KILL QUERY ")));
    assert!(is_ok(&a.output()));
    assert!(b.output().is_empty());
    assert_eq!(b.conn.state(), ClientState::Ready);
}

#[test(tokio::test)]
#[serial_test::serial]
async fn test_kill_unknown_id() {
    let proxy = Proxy::new(settings());
    let mut a = proxy.logged_in();

    let req = kill_request(&mut a, "KILL 987654321");
    execute_kill(proxy.ctx.clone(), a.id(), req).await;

    assert!(proxy.side.executed().is_empty());
    let out = a.output();
    assert_eq!(out.len(), 1);
    assert_eq!(sequence(&out[0]), 1);
    assert_eq!(err_code(&out[0]), Some(1094));
    assert_eq!(err_message(&out[0]), "Unknown thread id: 987654321");
}

#[test(tokio::test)]
#[serial_test::serial]
async fn test_kill_user() {
    let proxy = Proxy::new(settings());
    let mut a = proxy.logged_in();
    let mut b1 = proxy.client();
    assert!(is_ok(&b1.login(OTHER_USER, OTHER_PASSWORD, "")));
    let mut b2 = proxy.client();
    assert!(is_ok(&b2.login(OTHER_USER, OTHER_PASSWORD, "")));

    let req = kill_request(&mut a, &format!("KILL USER {}", OTHER_USER));
    execute_kill(proxy.ctx.clone(), a.id(), req).await;

    // one statement per server, not per connection
    let mut executed = proxy.side.executed();
    executed.sort();
    assert_eq!(executed, vec![
        ("db1".to_string(), "KILL CONNECTION USER bob".to_string()),
        ("db2".to_string(), "KILL CONNECTION USER bob".to_string()),
        ("db3".to_string(), "KILL CONNECTION USER bob".to_string()),
    ]);
    assert!(is_ok(&a.output()));
    for b in &mut [b1, b2] {
        assert_eq!(b.output().first().and_then(|p| err_code(p)), Some(1927));
        assert_eq!(b.conn.state(), ClientState::Failed);
    }
    assert_eq!(a.conn.state(), ClientState::Ready);
}

#[test(tokio::test)]
#[serial_test::serial]
async fn test_commands_wait_for_kill() {
    let proxy = Proxy::new(settings());
    let mut a = proxy.logged_in();
    let b = proxy.logged_in();

    let req = kill_request(&mut a, &format!("KILL QUERY {}", b.id()));
    // sent before the KILL finished, answered after it
    assert!(a.query("SELECT 1").is_empty());
    execute_kill(proxy.ctx.clone(), a.id(), req).await;
    let out = a.output();
    assert_eq!(out.len(), 2);
    assert_eq!(sequence(&out[0]), 1);
    assert!(out.iter().all(|p| is_ok(std::slice::from_ref(p))));
}
