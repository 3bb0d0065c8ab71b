use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::sluicedb::mysql::sql::{KillRequest, KillTarget, KillType};
use crate::sluicedb::router::Server;
use crate::sluicedb::worker::{SessionInfo, Wakeup, WorkerRef};

/// The statements a KILL runs on the servers: one per backend connection of the
/// killed sessions, or one KILL USER per server for a user.
pub fn kill_statements(req: &KillRequest, victims: &[SessionInfo]) -> Vec<(Arc<Server>, String)> {
    let mut out: Vec<(Arc<Server>, String)> = Vec::new();
    for v in victims {
        for (server, thread_id) in &v.connections {
            match req.target {
                KillTarget::Id(_) => out.push((server.clone(), req.backend_statement(*thread_id as u64))),
                KillTarget::User(_) => {
                    if !out.iter().any(|(s, _)| s.index() == server.index()) {
                        out.push((server.clone(), req.backend_statement(0)));
                    }
                },
            }
        }
    }
    out
}

/// Runs a KILL for session_id: finds the sessions it applies to on every worker, kills
/// their backend connections over side connections, and with KILL CONNECTION closes
/// the sessions too. The session is woken with KillDone once every side connection
/// finished or failed.
pub async fn execute_kill(ctx: WorkerRef, session_id: u64, req: KillRequest) {
    let (mut victims, remote) = {
        let c = ctx.borrow();
        let local = c.sessions.find_kill_targets(&req.target);
        let mut remote = Vec::new();
        for handle in c.other_workers() {
            let (tx, rx) = oneshot::channel();
            let target = req.target.clone();
            let sent = handle.execute(move |wc| {
                let _ = tx.send(wc.sessions.find_kill_targets(&target));
            });
            if sent {
                remote.push((handle.clone(), rx));
            }
        }
        (local, remote)
    };
    let local_count = victims.len();
    let mut remote_victims = Vec::new();
    for (handle, rx) in remote {
        if let Ok(found) = rx.await {
            if !found.is_empty() {
                remote_victims.push((handle, found.iter().map(|v| v.id).collect::<Vec<u64>>()));
                victims.extend(found);
            }
        }
    }

    let statements = kill_statements(&req, &victims);
    debug!(session_id, sessions = victims.len(), statements = statements.len(), "running kill");
    let side = ctx.borrow().side_connector.clone();
    let results = join_all(statements.into_iter().map(|(server, sql)| {
        let name = server.name().to_string();
        let fut = side.execute(server, sql.clone());
        async move { (name, sql, fut.await) }
    })).await;
    for (server, sql, result) in results {
        if let Err(e) = result {
            warn!(session_id, server = server.as_str(), sql = sql.as_str(), %e, "kill statement failed");
        }
    }

    if req.kill_type == KillType::Connection {
        {
            let c = ctx.borrow();
            for v in &victims[..local_count] {
                info!(session_id, killed = v.id, "killing session");
                c.sessions.wake(v.id, Wakeup::Killed);
            }
        }
        for (handle, ids) in remote_victims {
            handle.execute(move |wc| {
                for id in ids {
                    wc.sessions.wake(id, Wakeup::Killed);
                }
            });
        }
    }

    let found = match req.target {
        KillTarget::Id(_) => !victims.is_empty(),
        KillTarget::User(_) => true,
    };
    ctx.borrow().sessions.wake(session_id, Wakeup::KillDone { found });
}
