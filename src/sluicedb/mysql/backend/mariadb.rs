use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info_span, warn, Instrument};

use crate::sluicedb::{Error, ErrorKind, ErrorType, Result};
use crate::sluicedb::mysql::backend::connection::{BackendConnection, BackendEvent, BackendEventKind, BackendAuth, Connector, SideConnector, EventSink};
use crate::sluicedb::mysql::backend::login::{PacketStream, LoginOptions, Credentials, login, login_error, auth_switch_response};
use crate::sluicedb::mysql::backend::local_client::LocalClient;
use crate::sluicedb::mysql::protocol::ChangeUserRequest;
use crate::sluicedb::mysql::protocol::packet::payload;
use crate::sluicedb::mysql::protocol::packet_builder::command_packet;
use crate::sluicedb::mysql::protocol::scramble::{scramble_phase2, NATIVE_PASSWORD_PLUGIN, Scramble};
use crate::sluicedb::router::Server;

enum BackendCommand {
    Write(Bytes),
    Reset(BackendAuth),
    Close,
}

/// Handle to a backend connection running as a task on the worker's LocalSet.
pub struct MariaDbConnection {
    id: u64,
    server: Arc<Server>,
    commands: UnboundedSender<BackendCommand>,
    sink: Rc<RefCell<EventSink>>,
}

impl BackendConnection for MariaDbConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn server(&self) -> &Arc<Server> {
        &self.server
    }

    fn write(&self, packet: Bytes) -> Result<()> {
        self.commands.send(BackendCommand::Write(packet)).map_err(|_| Error::closed())
    }

    fn reset(&self, auth: &BackendAuth) -> Result<()> {
        self.commands.send(BackendCommand::Reset(auth.clone())).map_err(|_| Error::closed())
    }

    fn set_sink(&self, sink: EventSink) {
        *self.sink.borrow_mut() = sink;
    }

    fn close(&self) {
        let _ = self.commands.send(BackendCommand::Close);
    }
}

/// Opens real connections to MariaDB servers.
#[derive(Default)]
pub struct MariaDbConnector;

impl MariaDbConnector {
    pub fn new() -> Self {
        MariaDbConnector
    }
}

impl Connector for MariaDbConnector {
    fn connect(&self, server: &Arc<Server>, auth: &BackendAuth, conn_id: u64, sink: EventSink) -> Result<Box<dyn BackendConnection>> {
        let (tx, rx) = unbounded_channel();
        let sink = Rc::new(RefCell::new(sink));
        let task = ConnectionTask {
            id: conn_id,
            server: server.clone(),
            sink: sink.clone(),
        };
        let span = info_span!("backend", conn_id, server = server.name());
        tokio::task::spawn_local(task.run(auth.clone(), rx).instrument(span));
        Ok(Box::new(MariaDbConnection {
            id: conn_id,
            server: server.clone(),
            commands: tx,
            sink,
        }))
    }
}

struct ConnectionTask {
    id: u64,
    server: Arc<Server>,
    sink: Rc<RefCell<EventSink>>,
}

struct Reset {
    auth: BackendAuth,
    held: VecDeque<Bytes>,
}

impl ConnectionTask {
    fn emit(&self, kind: BackendEventKind) {
        // the owner may be gone, nobody to tell then
        let _ = self.sink.borrow().send(BackendEvent { conn_id: self.id, kind });
    }

    async fn run(self, auth: BackendAuth, mut commands: UnboundedReceiver<BackendCommand>) {
        let stats = &self.server.stats;
        stats.intended_connections.fetch_add(1, Relaxed);
        let connected = PacketStream::connect(self.server.address()).await;
        let mut established = false;
        let result = match connected {
            Ok(mut stream) => {
                let opts = LoginOptions {
                    user: &auth.user,
                    credentials: Credentials::Phase2(auth.phase2.as_ref()),
                    db: &auth.db,
                    charset: auth.charset,
                    capabilities: auth.client_caps,
                    extended_capabilities: auth.client_ext_caps,
                    attributes: auth.attrs.clone(),
                };
                match login(&mut stream, &opts).await {
                    Ok(session) => {
                        stats.intended_connections.fetch_sub(1, Relaxed);
                        stats.current_connections.fetch_add(1, Relaxed);
                        stats.total_connections.fetch_add(1, Relaxed);
                        established = true;
                        self.emit(BackendEventKind::Established {
                            thread_id: session.greeting.thread_id,
                            capabilities: session.capabilities,
                        });
                        self.serve(stream, session.greeting.scramble, session.capabilities, &mut commands).await
                    },
                    Err(e) => Err(e),
                }
            },
            Err(e) => Err(e),
        };
        if established {
            stats.current_connections.fetch_sub(1, Relaxed);
        } else {
            stats.intended_connections.fetch_sub(1, Relaxed);
        }
        match result {
            Ok(()) => debug!("backend connection closed"),
            Err(e) => {
                if let ErrorKind::ClosedError = e.kind() {
                    debug!("server closed the connection");
                    self.emit(BackendEventKind::Closed);
                } else {
                    warn!(%e, "backend connection failed");
                    self.emit(BackendEventKind::Error(e.error_type(), e.to_string()));
                }
            },
        }
    }

    async fn serve(&self, mut stream: PacketStream, scramble: Scramble, capabilities: u32, commands: &mut UnboundedReceiver<BackendCommand>) -> Result<()> {
        let mut reset: Option<Reset> = None;
        loop {
            while let Some(packet) = stream.next_buffered()? {
                match reset.take() {
                    None => {
                        self.server.stats.packets.fetch_add(1, Relaxed);
                        self.emit(BackendEventKind::Packet(packet));
                    },
                    Some(mut r) => match payload(&packet).first() {
                        Some(0x00) => {
                            self.emit(BackendEventKind::Established { thread_id: 0, capabilities });
                            while let Some(p) = r.held.pop_front() {
                                stream.write_all(&p).await?;
                            }
                        },
                        Some(0xff) => return Err(login_error(&packet)),
                        Some(0xfe) => {
                            let reply = auth_switch_response(&packet, Credentials::Phase2(r.auth.phase2.as_ref()))?;
                            stream.write_all(&reply).await?;
                            reset = Some(r);
                        },
                        _ => return Err(Error::backend(ErrorType::Transient, "unexpected packet while resetting the connection")),
                    },
                }
            }

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(BackendCommand::Write(packet)) => match reset.as_mut() {
                        Some(r) => r.held.push_back(packet),
                        None => stream.write_all(&packet).await?,
                    },
                    Some(BackendCommand::Reset(auth)) => {
                        let req = ChangeUserRequest {
                            user: auth.user.clone(),
                            auth_token: auth.phase2.as_ref().map(|p| scramble_phase2(&scramble, p).to_vec()).unwrap_or_default(),
                            database: auth.db.clone(),
                            charset: auth.charset as u16,
                            auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
                            attributes: auth.attrs.clone(),
                        };
                        stream.write_all(&req.build(capabilities)).await?;
                        reset = Some(Reset { auth, held: VecDeque::new() });
                    },
                    Some(BackendCommand::Close) | None => {
                        let _ = stream.write_all(&command_packet(&[0x01])).await;
                        return Ok(());
                    },
                },
                filled = stream.fill() => filled?,
            }
        }
    }
}

/// Runs statements on servers with the service credentials.
pub struct MariaDbSideConnector {
    user: String,
    password: String,
}

impl MariaDbSideConnector {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }
}

impl SideConnector for MariaDbSideConnector {
    fn execute(&self, server: Arc<Server>, sql: String) -> LocalBoxFuture<'static, Result<()>> {
        let user = self.user.clone();
        let password = self.password.clone();
        Box::pin(async move {
            let mut client = LocalClient::connect(server.address(), &user, &password, "").await?;
            let result = client.execute(&sql).await;
            client.close().await;
            result
        })
    }
}
