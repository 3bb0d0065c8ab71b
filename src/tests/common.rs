use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use futures::future::{self, FutureExt, LocalBoxFuture};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::sluicedb::{Error, ErrorType, Result};
use crate::sluicedb::config::{parse_config, Settings};
use crate::sluicedb::mysql::backend::{BackendAuth, BackendConnection, BackendEvent, BackendEventKind, Connector, EventSink, SideConnector};
use crate::sluicedb::mysql::client::ClientConnection;
use crate::sluicedb::mysql::protocol::{ChangeUserRequest, Command, HandshakeResponse, InitialHandshake, PacketBuilder};
use crate::sluicedb::mysql::protocol::capabilities::*;
use crate::sluicedb::mysql::protocol::packet::{payload, sequence, with_sequence};
use crate::sluicedb::mysql::protocol::packet_builder::{command_packet, err_packet, ok_packet, query_packet};
use crate::sluicedb::mysql::protocol::scramble::{password_hash, scramble_password, Scramble, NATIVE_PASSWORD_PLUGIN};
use crate::sluicedb::mysql::sql::get_sql;
use crate::sluicedb::router::{Server, Service};
use crate::sluicedb::users::{UserDatabase, UserEntry, UserLoader, UserManager};
use crate::sluicedb::worker::{next_session_id, worker_channels, Shared, Wakeup, WorkerContext, WorkerRef};

pub const TEST_USER: &str = "app";
pub const TEST_PASSWORD: &str = "app-secret";
pub const OTHER_USER: &str = "bob";
pub const OTHER_PASSWORD: &str = "openseasame";
pub const TEST_DATABASE: &str = "shop";
pub const CLIENT_ADDRESS: &str = "10.0.0.5:40000";

/// What a typical connector library sends
pub const CLIENT_CAPS: u32 = CLIENT_MYSQL
    | CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_TRANSACTIONS
    | CLIENT_MULTI_RESULTS
    | CLIENT_SESSION_TRACK
    | CLIENT_DEPRECATE_EOF;

/// One master and two replicas with static status, the monitor is off.
pub const CONFIG: &str = r#"
port: 4100
num_workers: 1
service:
  user: maxuser
  password: maxpwd
  servers:
    - name: db1
      status: master
    - name: db2
      status: slave
    - name: db3
      status: slave
  monitor:
    enabled: false
"#;

pub fn settings() -> &'static Settings {
    settings_with(|_| ())
}

/// Parses CONFIG, lets f adjust it and leaks it, like load_config does.
pub fn settings_with<F: FnOnce(&mut Settings)>(f: F) -> &'static Settings {
    let mut settings = parse_config(CONFIG, PathBuf::from("sluicedb.yaml")).expect("invalid config");
    f(&mut settings);
    Box::leak(Box::new(settings))
}

pub fn test_accounts() -> UserDatabase {
    let mut db = UserDatabase::new();
    db.add_entry(UserEntry::new(TEST_USER, "%", &password_hash(TEST_PASSWORD)));
    db.add_entry(UserEntry::new(OTHER_USER, "%", &password_hash(OTHER_PASSWORD)));
    db.add_database_name(TEST_DATABASE);
    db.add_db_grant(TEST_USER, "%", TEST_DATABASE);
    db
}

/// Serves whatever the test put in the shared database.
pub struct SharedLoader(pub Arc<Mutex<UserDatabase>>);

impl UserLoader for SharedLoader {
    fn load(&self) -> Result<UserDatabase> {
        Ok(self.0.lock()?.clone())
    }
}

/// A packet written to a mock backend.
#[derive(Debug, Clone)]
pub struct Write {
    pub server: String,
    pub conn_id: u64,
    pub packet: Bytes,
}

impl Write {
    pub fn sql(&self) -> Option<&str> {
        get_sql(&self.packet)
    }

    /// The statement id of a COM_STMT_EXECUTE
    pub fn executed_stmt(&self) -> Option<u32> {
        let data = payload(&self.packet);
        match data.first().and_then(|b| Command::from_u8(*b)) {
            Some(Command::StmtExecute) if data.len() >= 5 => Some(u32::from_le_bytes([data[1], data[2], data[3], data[4]])),
            _ => None,
        }
    }
}

/// The servers behind the mock connections. Every command gets an OK unless a reply
/// was scripted for the server, COM_STMT_PREPARE gets a PREPARE_OK with a statement id
/// of the connection's own. With hold set, replies wait for release().
#[derive(Default)]
pub struct MockBackends {
    next_thread_id: Cell<u32>,
    writes: RefCell<Vec<Write>>,
    connects: RefCell<Vec<(String, String)>>,
    resets: RefCell<Vec<(String, String)>>,
    prepared: RefCell<Vec<(String, u64, u32)>>,
    closed: RefCell<Vec<u64>>,
    scripted: RefCell<FnvHashMap<String, VecDeque<Bytes>>>,
    refused: RefCell<FnvHashSet<String>>,
    hold: Cell<bool>,
    held: RefCell<Vec<(EventSink, BackendEvent)>>,
}

impl MockBackends {
    fn thread_id(&self) -> u32 {
        let id = self.next_thread_id.get() + 100;
        self.next_thread_id.set(self.next_thread_id.get() + 1);
        id
    }

    /// The next command sent to server is answered with this ERR.
    pub fn fail_next(&self, server: &str, code: u16, message: &str) {
        self.scripted.borrow_mut()
            .entry(server.to_string())
            .or_default()
            .push_back(err_packet(1, code, "HY000", message));
    }

    pub fn refuse(&self, server: &str) {
        self.refused.borrow_mut().insert(server.to_string());
    }

    pub fn hold(&self, hold: bool) {
        self.hold.set(hold);
    }

    /// Sends the replies held back so far.
    pub fn release(&self) {
        for (sink, event) in self.held.borrow_mut().drain(..) {
            let _ = sink.send(event);
        }
    }

    pub fn take_writes(&self) -> Vec<Write> {
        self.writes.borrow_mut().drain(..).collect()
    }

    /// SQL statements written to server, in order.
    pub fn statements(&self, server: &str) -> Vec<String> {
        self.writes.borrow().iter()
            .filter(|w| w.server == server)
            .filter_map(|w| w.sql().map(|s| s.to_string()))
            .collect()
    }

    /// (server, user) of every connection opened
    pub fn connects(&self) -> Vec<(String, String)> {
        self.connects.borrow().clone()
    }

    /// (server, user) of every COM_CHANGE_USER reset
    pub fn resets(&self) -> Vec<(String, String)> {
        self.resets.borrow().clone()
    }

    /// (server, conn_id, statement id) of every statement prepared
    pub fn prepared(&self) -> Vec<(String, u64, u32)> {
        self.prepared.borrow().clone()
    }

    pub fn closed(&self) -> Vec<u64> {
        self.closed.borrow().clone()
    }

    fn on_write(&self, conn: &MockConnection, packet: Bytes) {
        let command = payload(&packet).first().and_then(|b| Command::from_u8(*b));
        self.writes.borrow_mut().push(Write {
            server: conn.server.name().to_string(),
            conn_id: conn.id,
            packet: packet.clone(),
        });
        if !command.map(|c| c.will_respond()).unwrap_or(false) {
            return;
        }
        if command == Some(Command::Query) {
            if let Some(sql) = get_sql(&packet) {
                let sql = sql.trim().to_ascii_uppercase();
                if sql.starts_with("BEGIN") || sql.starts_with("START TRANSACTION") {
                    conn.in_trx.set(true);
                } else if sql.starts_with("COMMIT") || sql.starts_with("ROLLBACK") {
                    conn.in_trx.set(false);
                }
            }
        }

        let seq = sequence(&packet).wrapping_add(1);
        let scripted = self.scripted.borrow_mut().get_mut(conn.server.name()).and_then(|q| q.pop_front());
        let reply = match scripted {
            Some(reply) => with_sequence(&reply, seq),
            None if command == Some(Command::StmtPrepare) => {
                let stmt_id = conn.thread_id * 100 + conn.statements.get() + 1;
                conn.statements.set(conn.statements.get() + 1);
                self.prepared.borrow_mut().push((conn.server.name().to_string(), conn.id, stmt_id));
                prepare_ok_packet(seq, stmt_id)
            },
            None => {
                let mut status = SERVER_STATUS_AUTOCOMMIT;
                if conn.in_trx.get() {
                    status |= SERVER_STATUS_IN_TRANS;
                }
                ok_packet(seq, 0, 0, status, 0, None)
            },
        };
        let event = BackendEvent { conn_id: conn.id, kind: BackendEventKind::Packet(reply) };
        let sink = conn.sink.borrow().clone();
        if self.hold.get() {
            self.held.borrow_mut().push((sink, event));
        } else {
            let _ = sink.send(event);
        }
    }
}

/// A PREPARE_OK for a statement without parameters or result columns.
fn prepare_ok_packet(seq: u8, stmt_id: u32) -> Bytes {
    let mut b = PacketBuilder::new(seq);
    b.write_u8(0).write_u32(stmt_id).write_u16(0).write_u16(0).write_u8(0).write_u16(0);
    b.finish()
}

fn established(conn_id: u64, thread_id: u32) -> BackendEvent {
    BackendEvent {
        conn_id,
        kind: BackendEventKind::Established { thread_id, capabilities: SERVER_CAPABILITIES },
    }
}

pub struct MockConnection {
    id: u64,
    thread_id: u32,
    server: Arc<Server>,
    sink: RefCell<EventSink>,
    in_trx: Cell<bool>,
    statements: Cell<u32>,
    backends: Rc<MockBackends>,
}

impl BackendConnection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn server(&self) -> &Arc<Server> {
        &self.server
    }

    fn write(&self, packet: Bytes) -> Result<()> {
        self.backends.on_write(self, packet);
        Ok(())
    }

    fn reset(&self, auth: &BackendAuth) -> Result<()> {
        self.backends.resets.borrow_mut().push((self.server.name().to_string(), auth.user.clone()));
        self.in_trx.set(false);
        let _ = self.sink.borrow().send(established(self.id, self.thread_id));
        Ok(())
    }

    fn set_sink(&self, sink: EventSink) {
        *self.sink.borrow_mut() = sink;
    }

    fn close(&self) {
        self.backends.closed.borrow_mut().push(self.id);
    }
}

/// Connections log in at once: Established is queued before any reply.
pub struct MockConnector(pub Rc<MockBackends>);

impl Connector for MockConnector {
    fn connect(&self, server: &Arc<Server>, auth: &BackendAuth, conn_id: u64, sink: EventSink) -> Result<Box<dyn BackendConnection>> {
        let backends = &self.0;
        if backends.refused.borrow().contains(server.name()) {
            return Err(Error::backend(ErrorType::Transient, format!("connection to {} refused", server.name())));
        }
        backends.connects.borrow_mut().push((server.name().to_string(), auth.user.clone()));
        let thread_id = backends.thread_id();
        let _ = sink.send(established(conn_id, thread_id));
        Ok(Box::new(MockConnection {
            id: conn_id,
            thread_id,
            server: server.clone(),
            sink: RefCell::new(sink),
            in_trx: Cell::new(false),
            statements: Cell::new(0),
            backends: backends.clone(),
        }))
    }
}

/// Records the statements run over side connections, failing for the servers in failing.
#[derive(Default)]
pub struct MockSideConnector {
    executed: RefCell<Vec<(String, String)>>,
    failing: RefCell<FnvHashSet<String>>,
}

impl MockSideConnector {
    pub fn fail_on(&self, server: &str) {
        self.failing.borrow_mut().insert(server.to_string());
    }

    /// (server, sql) in the order they ran
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.borrow().clone()
    }
}

impl SideConnector for MockSideConnector {
    fn execute(&self, server: Arc<Server>, sql: String) -> LocalBoxFuture<'static, Result<()>> {
        self.executed.borrow_mut().push((server.name().to_string(), sql));
        let result = if self.failing.borrow().contains(server.name()) {
            Err(Error::backend(ErrorType::Transient, format!("could not connect to {}", server.name())))
        } else {
            Ok(())
        };
        future::ready(result).boxed_local()
    }
}

/// A worker context wired to mock backends, with test_accounts loaded.
pub struct Proxy {
    pub ctx: WorkerRef,
    pub backends: Rc<MockBackends>,
    pub side: Rc<MockSideConnector>,
    /// What the user loader returns on the next reload
    pub accounts: Arc<Mutex<UserDatabase>>,
    pub users: Arc<UserManager>,
    _pool_events: UnboundedReceiver<BackendEvent>,
}

impl Proxy {
    pub fn new(settings: &'static Settings) -> Self {
        let service = Arc::new(Service::new(&settings.service).expect("invalid service"));
        let accounts = Arc::new(Mutex::new(test_accounts()));
        let users = Arc::new(UserManager::new(settings.service.users.clone(), Box::new(SharedLoader(accounts.clone()))));
        users.run_update().expect("loading users failed");
        let (handles, _) = worker_channels(1);
        let shared = Shared {
            settings,
            service,
            users: users.clone(),
            tls: None,
            handles: Arc::new(handles),
        };
        let backends = Rc::new(MockBackends::default());
        let side = Rc::new(MockSideConnector::default());
        let connector: Rc<dyn Connector> = Rc::new(MockConnector(backends.clone()));
        let side_connector: Rc<dyn SideConnector> = side.clone();
        let (ctx, pool_events) = WorkerContext::new(0, &shared, connector, side_connector);
        Self {
            ctx: Rc::new(RefCell::new(ctx)),
            backends,
            side,
            accounts,
            users,
            _pool_events: pool_events,
        }
    }

    pub fn service(&self) -> Arc<Service> {
        self.ctx.borrow().service.clone()
    }

    pub fn client(&self) -> TestClient {
        TestClient::connect(&self.ctx, CLIENT_ADDRESS)
    }

    /// A client that logged in as TEST_USER, with the greeting and OK consumed.
    pub fn logged_in(&self) -> TestClient {
        let mut client = self.client();
        let out = client.login(TEST_USER, TEST_PASSWORD, "");
        assert!(is_ok(&out), "login failed: {:?}", out);
        client
    }

    /// Reloads the accounts and wakes the sessions waiting for it, like the updater thread does.
    pub fn reload_users(&self) {
        self.users.run_update().expect("loading users failed");
        self.ctx.borrow_mut().sessions.notify_users_updated();
    }
}

/// Plays the client side of a session against a ClientConnection, delivering the
/// backend events and wakeups the session produces until it goes quiet.
pub struct TestClient {
    pub conn: ClientConnection,
    pub handshake: InitialHandshake,
    events_tx: EventSink,
    events: UnboundedReceiver<BackendEvent>,
    wakeups: UnboundedReceiver<Wakeup>,
    ctx: WorkerRef,
}

impl TestClient {
    pub fn connect(ctx: &WorkerRef, peer: &str) -> Self {
        let id = next_session_id();
        let (events_tx, events) = unbounded_channel();
        let (wakeup_tx, wakeups) = unbounded_channel();
        let settings = ctx.borrow().settings;
        let mut conn = ClientConnection::new(id, settings, peer.parse().expect("bad peer address"), events_tx.clone());
        {
            let mut c = ctx.borrow_mut();
            c.sessions.register(id, wakeup_tx);
            conn.start(&c);
        }
        let greeting = conn.take_output();
        assert_eq!(greeting.len(), 1);
        assert_eq!(sequence(&greeting[0]), 0);
        let handshake = InitialHandshake::parse(payload(&greeting[0])).expect("bad handshake");
        Self { conn, handshake, events_tx, events, wakeups, ctx: ctx.clone() }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn scramble(&self) -> Scramble {
        self.handshake.scramble
    }

    pub fn handshake_response(&self, user: &str, password: &str, db: &str, seq: u8) -> Bytes {
        let token = if password.is_empty() { Vec::new() } else { scramble_password(&self.handshake.scramble, password) };
        HandshakeResponse {
            capabilities: CLIENT_CAPS,
            max_packet_size: 16 * 1024 * 1024,
            charset: DEFAULT_CHARSET,
            user: user.to_string(),
            auth_token: token,
            database: db.to_string(),
            auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
            ..Default::default()
        }.build(seq)
    }

    pub fn login(&mut self, user: &str, password: &str, db: &str) -> Vec<Bytes> {
        let packet = self.handshake_response(user, password, db, 1);
        self.send(&packet)
    }

    pub fn change_user(&mut self, user: &str, password: &str, db: &str) -> Vec<Bytes> {
        let req = ChangeUserRequest {
            user: user.to_string(),
            auth_token: scramble_password(&self.handshake.scramble, password),
            database: db.to_string(),
            charset: DEFAULT_CHARSET as u16,
            auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
            attributes: Bytes::new(),
        };
        let packet = req.build(CLIENT_CAPS);
        self.send(&packet)
    }

    pub fn query(&mut self, sql: &str) -> Vec<Bytes> {
        self.send(&query_packet(sql))
    }

    /// Prepares sql with COM_STMT_PREPARE and returns the statement id the client got.
    pub fn prepare(&mut self, sql: &str) -> u32 {
        let mut data = vec![Command::StmtPrepare as u8];
        data.extend_from_slice(sql.as_bytes());
        let out = self.send(&command_packet(&data));
        assert_eq!(out.len(), 1, "{:?}", out);
        let reply = payload(&out[0]);
        assert_eq!(reply[0], 0, "prepare failed: {:?}", out);
        u32::from_le_bytes([reply[1], reply[2], reply[3], reply[4]])
    }

    /// Runs a prepared statement that has no parameters.
    pub fn execute(&mut self, stmt_id: u32) -> Vec<Bytes> {
        let mut data = vec![Command::StmtExecute as u8];
        data.extend_from_slice(&stmt_id.to_le_bytes());
        data.push(0);
        data.extend_from_slice(&1u32.to_le_bytes());
        self.send(&command_packet(&data))
    }

    /// Feeds data to the session and returns what it sent back once things settled.
    pub fn send(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.conn.on_data(&mut self.ctx.borrow_mut(), data);
        self.output()
    }

    pub fn output(&mut self) -> Vec<Bytes> {
        self.pump();
        self.conn.take_output()
    }

    /// Delivers event as if a backend connection of the session sent it.
    pub fn inject(&mut self, event: BackendEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn pump(&mut self) {
        loop {
            if let Ok(event) = self.events.try_recv() {
                self.conn.on_backend_event(&mut self.ctx.borrow_mut(), event);
                continue;
            }
            if let Ok(wakeup) = self.wakeups.try_recv() {
                self.conn.on_wakeup(&mut self.ctx.borrow_mut(), wakeup);
                continue;
            }
            break;
        }
    }

    /// Runs the session's periodic housekeeping as if the coarse clock read now.
    pub fn tick(&mut self, now: u32) -> Vec<Bytes> {
        self.conn.tick(&mut self.ctx.borrow_mut(), now);
        self.output()
    }

    pub fn finish(&mut self) {
        let mut c = self.ctx.borrow_mut();
        self.conn.finish(&mut c);
        c.sessions.unregister(self.conn.id());
    }
}

/// True if packets is a single OK packet.
pub fn is_ok(packets: &[Bytes]) -> bool {
    packets.len() == 1 && payload(&packets[0]).first() == Some(&0)
}

/// The error code of an ERR packet.
pub fn err_code(packet: &[u8]) -> Option<u16> {
    let data = payload(packet);
    if data.len() >= 3 && data[0] == 0xff {
        Some(u16::from_le_bytes([data[1], data[2]]))
    } else {
        None
    }
}

/// The message of an ERR packet, after the SQL state.
pub fn err_message(packet: &[u8]) -> String {
    let data = payload(packet);
    String::from_utf8_lossy(data.get(9..).unwrap_or(&[])).into_owned()
}
