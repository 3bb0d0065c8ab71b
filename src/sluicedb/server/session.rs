use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::{interval, Duration};
use tracing::debug;

use crate::sluicedb::{Error, Result, coarse_monotonic_now};
use crate::sluicedb::config::SESSION_TICK_MILLIS;
use crate::sluicedb::mysql::client::{Action, ClientConnection, execute_kill};
use crate::sluicedb::mysql::protocol::error_codes::{ER_CON_COUNT_ERROR, TOO_MANY_CONNECTIONS_MESSAGE};
use crate::sluicedb::mysql::protocol::packet_builder::error_code_packet;
use crate::sluicedb::server::TlsSession;
use crate::sluicedb::users::reverse_lookup;
use crate::sluicedb::worker::{Wakeup, WorkerRef};

/// Drives one client connection until the client or the session closes it.
/// Socket reads, backend events, wakeups and the session tick are fed to the
/// ClientConnection one at a time, the worker context is never borrowed across an await.
pub async fn run_client_session(ctx: WorkerRef, mut sock: TcpStream, remote_addr: SocketAddr, session_id: u64) -> Result<()> {
    let (events_tx, mut events) = unbounded_channel();
    let (wakeup_tx, mut wakeups) = unbounded_channel();
    let (settings, tls_config) = {
        let c = ctx.borrow();
        (c.settings, c.tls.clone())
    };
    let mut client = ClientConnection::new(session_id, settings, remote_addr, events_tx);
    {
        let mut c = ctx.borrow_mut();
        c.sessions.register(session_id, wakeup_tx.clone());
        client.start(&c);
    }

    let mut tls: Option<TlsSession> = None;
    let mut buf = vec![0u8; settings.recv_buffer_size as usize];
    let mut plain = BytesMut::new();
    let mut tick = interval(Duration::from_millis(SESSION_TICK_MILLIS));

    let result: Result<()> = 'session: loop {
        while let Some(action) = client.take_action() {
            match action {
                Action::StartTls => {
                    let mut session = match start_tls(tls_config.clone()) {
                        Ok(session) => session,
                        Err(e) => break 'session Err(e),
                    };
                    let pending = client.take_pending_input();
                    if !pending.is_empty() {
                        plain.clear();
                        if let Err(e) = session.read_tls(&pending, &mut plain) {
                            break 'session Err(e);
                        }
                        if !plain.is_empty() {
                            client.on_data(&mut ctx.borrow_mut(), &plain);
                        }
                    }
                    tls = Some(session);
                },
                Action::ReverseLookup(addr) => {
                    let tx = wakeup_tx.clone();
                    tokio::task::spawn_local(async move {
                        let name = match reverse_lookup(addr).await {
                            Ok(name) => name,
                            Err(e) => {
                                debug!(%addr, %e, "reverse lookup failed");
                                None
                            },
                        };
                        let _ = tx.send(Wakeup::Hostname(name));
                    });
                },
                Action::Kill(req) => {
                    tokio::task::spawn_local(execute_kill(ctx.clone(), session_id, req));
                },
            }
        }

        if let Err(e) = flush(&mut sock, &mut client, tls.as_mut()).await {
            break Err(e);
        }
        if client.is_closed() {
            break Ok(());
        }

        tokio::select! {
            r = sock.read(&mut buf) => match r {
                Ok(0) => break Ok(()),
                Ok(n) => match tls.as_mut() {
                    Some(session) => {
                        plain.clear();
                        if let Err(e) = session.read_tls(&buf[..n], &mut plain) {
                            break Err(e);
                        }
                        if !plain.is_empty() {
                            client.on_data(&mut ctx.borrow_mut(), &plain);
                        }
                    },
                    None => client.on_data(&mut ctx.borrow_mut(), &buf[..n]),
                },
                Err(e) => break Err(Error::from(e)),
            },
            Some(event) = events.recv() => client.on_backend_event(&mut ctx.borrow_mut(), event),
            Some(wakeup) = wakeups.recv() => client.on_wakeup(&mut ctx.borrow_mut(), wakeup),
            _ = tick.tick() => client.tick(&mut ctx.borrow_mut(), coarse_monotonic_now()),
        }
    };

    if let Some(session) = tls.as_mut() {
        session.close();
        let _ = flush(&mut sock, &mut client, Some(session)).await;
    }
    {
        let mut c = ctx.borrow_mut();
        client.finish(&mut c);
        c.sessions.unregister(session_id);
    }
    let _ = sock.shutdown().await;
    result
}

fn start_tls(config: Option<Arc<rustls::ServerConfig>>) -> Result<TlsSession> {
    match config {
        Some(config) => TlsSession::new(config),
        None => Err(Error::new("client requested tls but it is not configured")),
    }
}

/// Writes the client's pending packets to the socket, through TLS once it's started.
async fn flush(sock: &mut TcpStream, client: &mut ClientConnection, tls: Option<&mut TlsSession>) -> Result<()> {
    let packets = client.take_output();
    match tls {
        Some(session) => {
            for packet in &packets {
                session.write_plain(packet)?;
            }
            let mut out = Vec::new();
            session.take_output(&mut out)?;
            if !out.is_empty() {
                sock.write_all(&out).await?;
            }
        },
        None => {
            if packets.is_empty() {
                return Ok(());
            }
            let mut out = BytesMut::with_capacity(packets.iter().map(|p| p.len()).sum());
            for packet in &packets {
                out.extend_from_slice(packet);
            }
            sock.write_all(&out).await?;
        },
    }
    Ok(())
}

/// Refuses a client above max_connections: the server greeting is replaced by an ERR.
pub async fn reject_connection(mut sock: TcpStream) {
    let packet = error_code_packet(0, &ER_CON_COUNT_ERROR, TOO_MANY_CONNECTIONS_MESSAGE);
    if let Err(e) = sock.write_all(&packet).await {
        debug!(%e, "could not send too many connections error");
    }
    let _ = sock.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reject_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            reject_connection(sock).await;
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        server.await.unwrap();
        assert_eq!(reply[3], 0);
        assert_eq!(reply[4], 0xff);
        assert_eq!(u16::from_le_bytes([reply[5], reply[6]]), 1040);
        assert!(String::from_utf8_lossy(&reply).ends_with("Too many connections"));
    }
}
