use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::atomic::Ordering::{Relaxed, AcqRel};

use fnv::FnvHashMap;
use tokio::runtime::{Runtime, Builder};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::LocalSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::sluicedb::{Result, coarse_monotonic_now};
use crate::sluicedb::config::{Settings, SESSION_TICK_MILLIS};
use crate::sluicedb::mysql::backend::{BackendEvent, BackendEventKind, Connector, SideConnector, MariaDbConnector, MariaDbSideConnector};
use crate::sluicedb::mysql::sql::{KillTarget, SimpleClassifier};
use crate::sluicedb::router::{ConnectionPools, Server, Service};
use crate::sluicedb::server::{Listener, run_client_session, reject_connection};
use crate::sluicedb::users::{UserCache, UserManager};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static CLIENT_CONNECTIONS: AtomicU32 = AtomicU32::new(0);

/// Session ids are unique across workers, clients see them as their connection id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Relaxed)
}

/// Counts a client connection against max_connections. Returns false if over the limit.
pub fn try_add_client_connection(max: u32) -> bool {
    let prev = CLIENT_CONNECTIONS.fetch_add(1, AcqRel);
    if prev >= max {
        CLIENT_CONNECTIONS.fetch_sub(1, AcqRel);
        return false;
    }
    true
}

pub fn remove_client_connection() {
    CLIENT_CONNECTIONS.fetch_sub(1, AcqRel);
}

/// Resumes a session parked on something that finished elsewhere.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Wakeup {
    /// Reverse name lookup result
    Hostname(Option<String>),
    /// The user accounts were reloaded
    UsersUpdated,
    /// A server the session waits on released a connection slot
    ConnectionSlotFree,
    /// The session's KILL fan-out finished, found is false if nothing matched the id
    KillDone { found: bool },
    /// Another session killed this one
    Killed,
}

/// What other sessions may know about a session, for KILL.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub id: u64,
    pub user: String,
    pub host: String,
    /// (server, backend thread id) of the established connections
    pub connections: Vec<(Arc<Server>, u32)>,
}

struct SessionEntry {
    info: SessionInfo,
    wakeup: UnboundedSender<Wakeup>,
}

/// The sessions of one worker, and which of them wait for what.
///
/// Waiters are only ids, a wakeup for a session that is gone is dropped.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: FnvHashMap<u64, SessionEntry>,
    user_waiters: Vec<u64>,
    slot_waiters: FnvHashMap<usize, VecDeque<u64>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u64, wakeup: UnboundedSender<Wakeup>) {
        let info = SessionInfo { id, ..Default::default() };
        self.sessions.insert(id, SessionEntry { info, wakeup });
    }

    pub fn unregister(&mut self, id: u64) {
        self.sessions.remove(&id);
        self.user_waiters.retain(|&w| w != id);
        self.remove_slot_waiter(id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn update_info(&mut self, id: u64, user: &str, host: &str, connections: Vec<(Arc<Server>, u32)>) {
        if let Some(entry) = self.sessions.get_mut(&id) {
            if entry.info.user != user {
                entry.info.user = user.to_string();
            }
            if entry.info.host != host {
                entry.info.host = host.to_string();
            }
            entry.info.connections = connections;
        }
    }

    pub fn info(&self, id: u64) -> Option<&SessionInfo> {
        self.sessions.get(&id).map(|e| &e.info)
    }

    /// Sends w to the session. Returns false if the session is gone.
    pub fn wake(&self, id: u64, w: Wakeup) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => entry.wakeup.send(w).is_ok(),
            None => {
                debug!(session_id = id, wakeup = ?w, "dropping wakeup for a closed session");
                false
            },
        }
    }

    /// The session waits for the next user account reload (TRY_AGAIN).
    pub fn add_user_waiter(&mut self, id: u64) {
        if !self.user_waiters.contains(&id) {
            self.user_waiters.push(id);
        }
    }

    pub fn notify_users_updated(&mut self) {
        for id in std::mem::take(&mut self.user_waiters) {
            self.wake(id, Wakeup::UsersUpdated);
        }
    }

    pub fn add_slot_waiter(&mut self, server_index: usize, id: u64) {
        let waiters = self.slot_waiters.entry(server_index).or_default();
        if !waiters.contains(&id) {
            waiters.push_back(id);
        }
    }

    pub fn remove_slot_waiter(&mut self, id: u64) {
        for waiters in self.slot_waiters.values_mut() {
            waiters.retain(|&w| w != id);
        }
    }

    /// Wakes the longest waiting live session for the server.
    pub fn notify_slot_free(&mut self, server_index: usize) {
        let waiters = match self.slot_waiters.get_mut(&server_index) {
            Some(w) => w,
            None => return,
        };
        while let Some(id) = waiters.pop_front() {
            if let Some(entry) = self.sessions.get(&id) {
                if entry.wakeup.send(Wakeup::ConnectionSlotFree).is_ok() {
                    return;
                }
            }
        }
    }

    /// The sessions a KILL statement applies to.
    pub fn find_kill_targets(&self, target: &KillTarget) -> Vec<SessionInfo> {
        match target {
            KillTarget::Id(id) => self.sessions.get(id).map(|e| vec![e.info.clone()]).unwrap_or_default(),
            KillTarget::User(user) => self.sessions.values()
                .filter(|e| &e.info.user == user)
                .map(|e| e.info.clone())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Work sent to a worker thread from elsewhere.
pub enum WorkerCommand {
    /// Run a closure on the worker, with its context
    Execute(Box<dyn FnOnce(&mut WorkerContext) + Send>),
    UsersUpdated,
}

#[derive(Clone)]
pub struct WorkerHandle {
    pub id: u32,
    sender: UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn new(id: u32, sender: UnboundedSender<WorkerCommand>) -> Self {
        Self { id, sender }
    }

    /// Returns false if the worker is gone.
    pub fn send(&self, cmd: WorkerCommand) -> bool {
        self.sender.send(cmd).is_ok()
    }

    pub fn execute<F: FnOnce(&mut WorkerContext) + Send + 'static>(&self, f: F) -> bool {
        self.send(WorkerCommand::Execute(Box::new(f)))
    }
}

/// Everything the workers share.
pub struct Shared {
    pub settings: &'static Settings,
    pub service: Arc<Service>,
    pub users: Arc<UserManager>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub handles: Arc<Vec<WorkerHandle>>,
}

/// The per-thread state of a worker. Sessions reach it through a WorkerRef and
/// never hold the borrow across an await.
pub struct WorkerContext {
    pub worker_id: u32,
    pub settings: &'static Settings,
    pub service: Arc<Service>,
    pub users: UserCache,
    pub connector: Rc<dyn Connector>,
    pub side_connector: Rc<dyn SideConnector>,
    pub pools: ConnectionPools,
    pub sessions: SessionRegistry,
    pub classifier: SimpleClassifier,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Every worker including this one
    pub handles: Arc<Vec<WorkerHandle>>,
    conn_counter: u64,
}

pub type WorkerRef = Rc<RefCell<WorkerContext>>;

impl WorkerContext {
    /// Creates the context and the receiver of its pooled connections' events.
    pub fn new(worker_id: u32, shared: &Shared, connector: Rc<dyn Connector>, side_connector: Rc<dyn SideConnector>) -> (Self, UnboundedReceiver<BackendEvent>) {
        let (pool_tx, pool_rx) = unbounded_channel();
        let ctx = Self {
            worker_id,
            settings: shared.settings,
            service: shared.service.clone(),
            users: UserCache::new(shared.users.clone()),
            connector,
            side_connector,
            pools: ConnectionPools::new(shared.service.servers().len(), pool_tx),
            sessions: SessionRegistry::new(),
            classifier: SimpleClassifier::new(),
            tls: shared.tls.clone(),
            handles: shared.handles.clone(),
            conn_counter: 0,
        };
        (ctx, pool_rx)
    }

    /// Backend connection ids carry the worker id in the top bits.
    pub fn next_conn_id(&mut self) -> u64 {
        self.conn_counter += 1;
        ((self.worker_id as u64) << 48) | self.conn_counter
    }

    /// Gives a connection slot back to server and lets a waiting session have it.
    pub fn release_slot(&mut self, server: &Arc<Server>) {
        server.release_connection();
        self.sessions.notify_slot_free(server.index());
    }

    /// The handles of the other workers.
    pub fn other_workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        let id = self.worker_id;
        self.handles.iter().filter(move |h| h.id != id)
    }
}

/// A worker thread: a current-thread tokio runtime and a LocalSet. Sessions,
/// their backend connections and the pools never leave the thread.
pub struct Worker {
    tokio: Runtime,
    worker_id: u32,
}

impl Worker {
    pub fn new(worker_id: u32) -> Result<Worker> {
        let tokio = Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Worker {
            tokio,
            worker_id,
        })
    }

    pub fn run_forever(mut self, shared: Arc<Shared>, mut commands: UnboundedReceiver<WorkerCommand>, listener: Option<&'static std::net::TcpListener>) {
        // If run fails, create a new Worker and call run again
        loop {
            self.run(&shared, &mut commands, listener);
            self = match Worker::new(self.worker_id) {
                Ok(worker) => worker,
                Err(e) => {
                    error!(%e, worker_id = self.worker_id, "cannot create worker");
                    std::process::exit(-1);
                },
            };
        }
    }

    fn run(&mut self, shared: &Shared, commands: &mut UnboundedReceiver<WorkerCommand>, shared_listener: Option<&'static std::net::TcpListener>) {
        let worker_id = self.worker_id;
        let _guard = self.tokio.enter();
        // If we didn't get passed a listener, create a sharded listener using SO_REUSEPORT
        let address = shared.settings.listen_address();
        let listener = match shared_listener {
            Some(l) => l.try_clone().map_err(Into::into).and_then(|l| Listener::from_std(address, l)),
            None => Listener::new(address, true),
        };
        let listener = match listener {
            Ok(l) => l,
            Err(e) => {
                error!(%e, worker_id, "could not create tcp listener");
                std::process::exit(-1);
            },
        };

        let connector: Rc<dyn Connector> = Rc::new(MariaDbConnector::new());
        let config = shared.service.config;
        let side_connector: Rc<dyn SideConnector> = Rc::new(MariaDbSideConnector::new(config.user.clone(), config.password.clone()));
        let (ctx, pool_events) = WorkerContext::new(worker_id, shared, connector, side_connector);
        let ctx = Rc::new(RefCell::new(ctx));

        let local = LocalSet::new();
        local.spawn_local(pool_event_loop(ctx.clone(), pool_events));
        local.spawn_local(maintenance_loop(ctx.clone()));
        let result = self.tokio.block_on(local.run_until(async move {
            tokio::select! {
                r = accept_loop(ctx.clone(), &listener).instrument(info_span!("accept_loop", worker_id)) => r,
                _ = command_loop(ctx.clone(), commands) => Ok(()),
            }
        }));
        if let Err(e) = result {
            error!(%e, worker_id, "fatal error in accept_loop");
        }
    }
}

async fn accept_loop(ctx: WorkerRef, listener: &Listener) -> Result<()> {
    let (worker_id, settings) = {
        let c = ctx.borrow();
        (c.worker_id, c.settings)
    };
    info!(address = %listener.address, "accepting client connections");
    loop {
        let (sock, remote_addr): (tokio::net::TcpStream, SocketAddr) = match listener.accept().await {
            Some(accepted) => accepted,
            None => return Ok(()),
        };
        if !try_add_client_connection(settings.max_connections) {
            warn!(%remote_addr, max_connections = settings.max_connections, "too many connections, rejecting client");
            tokio::task::spawn_local(reject_connection(sock));
            continue;
        }
        let session_id = next_session_id();
        let span = info_span!("session", session_id, worker_id);
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = run_client_session(ctx, sock, remote_addr, session_id).await {
                debug!(%e, "client session ended with an error");
            }
            remove_client_connection();
        }.instrument(span));
    }
}

async fn command_loop(ctx: WorkerRef, commands: &mut UnboundedReceiver<WorkerCommand>) {
    while let Some(cmd) = commands.recv().await {
        let mut c = ctx.borrow_mut();
        match cmd {
            WorkerCommand::Execute(f) => f(&mut c),
            WorkerCommand::UsersUpdated => {
                c.users.update_from_master();
                c.sessions.notify_users_updated();
            },
        }
    }
}

/// Pooled connections report here. One that fails or talks out of turn is dropped.
async fn pool_event_loop(ctx: WorkerRef, mut events: UnboundedReceiver<BackendEvent>) {
    while let Some(ev) = events.recv().await {
        let mut c = ctx.borrow_mut();
        match ev.kind {
            BackendEventKind::Established { .. } => (),
            BackendEventKind::Packet(_) | BackendEventKind::Error(..) | BackendEventKind::Closed => {
                if let Some(p) = c.pools.remove(ev.conn_id) {
                    debug!(conn_id = ev.conn_id, server = p.conn.server().name(), "dropping pooled connection");
                    p.conn.close();
                }
            },
        }
    }
}

async fn maintenance_loop(ctx: WorkerRef) {
    let mut tick = interval(Duration::from_millis(SESSION_TICK_MILLIS));
    loop {
        tick.tick().await;
        let mut c = ctx.borrow_mut();
        let evicted = c.pools.evict_expired(coarse_monotonic_now());
        if evicted > 0 {
            debug!(worker_id = c.worker_id, evicted, "closed expired pooled connections");
        }
        c.users.update_from_master();
    }
}

/// Creates the command channels of num_workers workers.
pub fn worker_channels(num_workers: u32) -> (Vec<WorkerHandle>, Vec<UnboundedReceiver<WorkerCommand>>) {
    let mut handles = Vec::with_capacity(num_workers as usize);
    let mut receivers = Vec::with_capacity(num_workers as usize);
    for id in 0..num_workers {
        let (tx, rx) = unbounded_channel();
        handles.push(WorkerHandle::new(id, tx));
        receivers.push(rx);
    }
    (handles, receivers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_waiters_skip_closed_sessions() {
        let mut reg = SessionRegistry::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        reg.register(1, tx1);
        reg.register(2, tx2);
        reg.add_slot_waiter(0, 1);
        reg.add_slot_waiter(0, 2);
        reg.add_slot_waiter(0, 2);
        reg.unregister(1);
        reg.notify_slot_free(0);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().ok(), Some(Wakeup::ConnectionSlotFree));
        reg.notify_slot_free(0);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_user_waiters_are_woken_once() {
        let mut reg = SessionRegistry::new();
        let (tx, mut rx) = unbounded_channel();
        reg.register(7, tx);
        reg.add_user_waiter(7);
        reg.add_user_waiter(7);
        reg.notify_users_updated();
        assert_eq!(rx.try_recv().ok(), Some(Wakeup::UsersUpdated));
        assert!(rx.try_recv().is_err());
        reg.notify_users_updated();
        assert!(rx.try_recv().is_err());
        assert!(!reg.wake(8, Wakeup::Killed));
    }

    #[test]
    fn test_find_kill_targets() {
        let mut reg = SessionRegistry::new();
        for id in 1..=3 {
            let (tx, _rx) = unbounded_channel();
            reg.register(id, tx);
        }
        reg.update_info(1, "alice", "10.0.0.1", Vec::new());
        reg.update_info(2, "bob", "10.0.0.2", Vec::new());
        reg.update_info(3, "alice", "10.0.0.3", Vec::new());
        let mut ids: Vec<u64> = reg.find_kill_targets(&KillTarget::User("alice".to_string())).iter().map(|i| i.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(reg.find_kill_targets(&KillTarget::Id(2))[0].user, "bob");
        assert!(reg.find_kill_targets(&KillTarget::Id(9)).is_empty());
    }

    #[test]
    fn test_client_connection_limit() {
        assert!(try_add_client_connection(u32::MAX));
        remove_client_connection();
        assert!(!try_add_client_connection(0));
    }
}
