use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use tracing::{debug, info, trace, warn};

use crate::sluicedb::{Error, ErrorType, Result, coarse_monotonic_now};
use crate::sluicedb::config::{CausalReads, MasterFailureMode, PoolConfig, RouterConfig, ServiceConfig, SqlVariablesIn};
use crate::sluicedb::mysql::backend::{BackendAuth, BackendEvent, BackendEventKind, EventSink};
use crate::sluicedb::mysql::protocol::{Command, Header, Reply};
use crate::sluicedb::mysql::protocol::error_codes::{ER_OPTION_PREVENTS_STATEMENT, ER_UNKNOWN_ERROR, READ_ONLY_MESSAGE};
use crate::sluicedb::mysql::protocol::packet::{is_large_payload, payload};
use crate::sluicedb::mysql::protocol::packet_builder::query_packet;
use crate::sluicedb::mysql::sql::*;
use crate::sluicedb::router::{Candidate, GtidPosition, Gtid, History, PooledConn, Server, Service, TrxTracker};
use crate::sluicedb::router::component::{RouterSession, Upstream};
use crate::sluicedb::router::endpoint::{Endpoint, EndpointState, ReplyTo};
use crate::sluicedb::router::selection::{select_master, select_reader, ReadConstraints};
use crate::sluicedb::worker::WorkerContext;

/// Makes the servers report the GTID of each write in the OK packet.
pub const CAUSAL_READS_SETUP: &str = "SET @@session.session_track_system_variables = CONCAT(@@global.session_track_system_variables, ',last_gtid')";
const NO_READ_TARGET_MESSAGE: &str = "No valid servers available for a read";

/// Where a statement goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Route {
    Master,
    Reader,
    /// A session command, every connection executes it
    All,
}

const SESSION_STATE_TYPES: u32 = QUERY_TYPE_SESSION_WRITE | QUERY_TYPE_PREPARE_NAMED_STMT | QUERY_TYPE_DEALLOC_PREPARE
    | QUERY_TYPE_ENABLE_AUTOCOMMIT | QUERY_TYPE_DISABLE_AUTOCOMMIT;
const MASTER_TYPES: u32 = QUERY_TYPE_WRITE | QUERY_TYPE_MASTER_READ | QUERY_TYPE_GSYSVAR_WRITE
    | QUERY_TYPE_CREATE_TMP_TABLE | QUERY_TYPE_READ_TMP_TABLE;
const READ_TYPES: u32 = QUERY_TYPE_READ | QUERY_TYPE_SHOW_DATABASES | QUERY_TYPE_SHOW_TABLES
    | QUERY_TYPE_SYSVAR_READ | QUERY_TYPE_GSYSVAR_READ | QUERY_TYPE_USERVAR_READ;

/// Decides where a statement of the given type goes. trx must already include the statement.
pub fn route_for(type_mask: u32, trx: &TrxTracker, locked_to_master: bool, variables_in: SqlVariablesIn) -> Route {
    let mut session_types = SESSION_STATE_TYPES;
    if variables_in == SqlVariablesIn::All {
        session_types |= QUERY_TYPE_USERVAR_WRITE;
    }
    if type_mask & session_types != 0 && type_mask & MASTER_TYPES == 0 {
        return Route::All;
    }
    if locked_to_master {
        return Route::Master;
    }
    if trx.is_trx_active() {
        return if trx.is_trx_read_only() { Route::Reader } else { Route::Master };
    }
    if type_mask & MASTER_TYPES != 0 || type_mask & QUERY_TYPE_USERVAR_WRITE != 0 {
        return Route::Master;
    }
    if type_mask & QUERY_TYPE_USERVAR_READ != 0 && variables_in == SqlVariablesIn::Master {
        return Route::Master;
    }
    if type_mask & READ_TYPES != 0 {
        return Route::Reader;
    }
    Route::Master
}

fn is_large(packet: &[u8]) -> bool {
    Header::parse(packet).map(|h| is_large_payload(&h)).unwrap_or(false)
}

fn statement_id(packet: &[u8]) -> Option<u32> {
    let data = payload(packet);
    if data.len() < 5 {
        return None;
    }
    Some(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))
}

/// Replies of one session command that are still coming in.
struct SescmdResult {
    outstanding: usize,
    primary: Option<Reply>,
    /// Secondaries that completed before the primary
    early: Vec<(usize, Reply)>,
}

/// The read/write splitting session: routes each client command to the master,
/// a replica, or every connection, and keeps the connections' session state in sync.
pub struct RWSplitSession {
    id: u64,
    service: Arc<Service>,
    config: &'static RouterConfig,
    pool_config: &'static PoolConfig,
    auth: BackendAuth,
    sink: EventSink,
    endpoints: Vec<Endpoint>,
    master: Option<usize>,
    /// The master connection failed, a new one needs master_reconnection
    lost_master: bool,
    history: History,
    sescmds: FnvHashMap<u32, SescmdResult>,
    sescmd_count: u64,
    trx: TrxTracker,
    gtid: GtidPosition,
    use_counter: u64,
    queue: VecDeque<Bytes>,
    large_targets: Vec<usize>,
    trx_target: Option<usize>,
    /// The client command in flight is a read that may go to another server if its own fails
    retryable: bool,
    locked_to_master: bool,
    db: String,
    tmp_tables: FnvHashSet<String>,
    ps_types: FnvHashMap<u32, u32>,
    text_ps_types: FnvHashMap<String, u32>,
    exec_targets: FnvHashMap<u32, usize>,
    connections_version: u64,
    last_activity: u32,
}

impl RWSplitSession {
    pub fn new(service: Arc<Service>, id: u64, auth: BackendAuth, sink: EventSink) -> Self {
        let service_config: &'static ServiceConfig = service.config;
        let config = &service_config.router;
        let endpoints = service.targets().iter().map(|s| Endpoint::new(s.clone())).collect();
        Self {
            id,
            config,
            pool_config: &service_config.pool,
            history: History::new(config.max_sescmd_history, config.prune_sescmd_history, config.disable_sescmd_history),
            db: auth.db.clone(),
            service,
            auth,
            sink,
            endpoints,
            master: None,
            lost_master: false,
            sescmds: FnvHashMap::default(),
            sescmd_count: 0,
            trx: TrxTracker::new(),
            gtid: GtidPosition::new(),
            use_counter: 0,
            queue: VecDeque::new(),
            large_targets: Vec::new(),
            trx_target: None,
            retryable: false,
            locked_to_master: false,
            tmp_tables: FnvHashSet::default(),
            ps_types: FnvHashMap::default(),
            text_ps_types: FnvHashMap::default(),
            exec_targets: FnvHashMap::default(),
            connections_version: 0,
            last_activity: coarse_monotonic_now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn trx(&self) -> &TrxTracker {
        &self.trx
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Opens the initial connections: the master and up to slave_connections replicas.
    /// With lazy_connect nothing is opened until the first statement needs it.
    pub fn start(&mut self, ctx: &mut WorkerContext) -> Result<()> {
        if self.config.lazy_connect {
            return Ok(());
        }
        let master = self.get_master(ctx)?;
        if master.is_none() && self.config.master_failure_mode == MasterFailureMode::FailInstantly {
            return Err(Error::backend(ErrorType::Transient, "no master server available"));
        }

        let wanted = self.config.slave_connections.min(self.config.max_slave_connections) as usize;
        let mut skip = FnvHashSet::default();
        let mut connected = 0;
        while connected < wanted {
            let constraints = ReadConstraints {
                max_replication_lag: self.config.max_replication_lag,
                master_accept_reads: false,
                gtid: None,
            };
            let (cands, map) = self.candidates(|i, ep| !skip.contains(&i) && ep.can_connect());
            let i = match select_reader(&cands, self.config.slave_selection_criteria, &constraints) {
                Some(c) => map[c],
                None => break,
            };
            match self.connect(ctx, i) {
                Ok(()) => connected += 1,
                Err(e) => {
                    warn!(session_id = self.id, server = self.endpoints[i].server().name(), %e, "could not connect to replica");
                    skip.insert(i);
                },
            }
        }

        if !self.endpoints.iter().any(|ep| ep.is_open()) {
            return Err(Error::backend(ErrorType::Transient, "could not connect to any server"));
        }
        Ok(())
    }

    fn candidates(&self, filter: impl Fn(usize, &Endpoint) -> bool) -> (Vec<Candidate>, Vec<usize>) {
        let mut cands = Vec::new();
        let mut map = Vec::new();
        for (i, ep) in self.endpoints.iter().enumerate() {
            if ep.state() == EndpointState::ConnectedFailed || !filter(i, ep) {
                continue;
            }
            cands.push(Candidate::new(ep.server().clone(), ep.is_busy(), ep.last_used()));
            map.push(i);
        }
        (cands, map)
    }

    /// New connections need the whole session state, which is gone once the history is disabled.
    fn can_reconnect(&self) -> bool {
        self.history.is_enabled() || self.sescmd_count == 0
    }

    fn is_waiting_for_reply(&self) -> bool {
        self.endpoints.iter().any(|ep| ep.expects_client_reply())
    }

    fn loading_endpoint(&self) -> Option<usize> {
        self.endpoints.iter().position(|ep| ep.is_loading_data())
    }

    fn connect(&mut self, ctx: &mut WorkerContext, i: usize) -> Result<()> {
        let server = self.endpoints[i].server().clone();
        if !server.try_reserve_connection() {
            if self.pool_config.wait_for_connection {
                if self.endpoints[i].state() != EndpointState::WaitingForConn {
                    debug!(session_id = self.id, server = server.name(), "waiting for a connection slot");
                    self.endpoints[i].set_waiting(coarse_monotonic_now());
                    ctx.sessions.add_slot_waiter(server.index(), self.id);
                    self.connections_version += 1;
                }
                return Ok(());
            }
            return Err(Error::backend(ErrorType::Transient, format!("server {} has no free connection slots", server.name())));
        }

        let (conn, thread_id) = match ctx.pools.take(&server) {
            Some(pooled) => {
                trace!(session_id = self.id, server = server.name(), conn_id = pooled.conn.id(), "reusing pooled connection");
                pooled.conn.set_sink(self.sink.clone());
                if let Err(e) = pooled.conn.reset(&self.auth) {
                    pooled.conn.close();
                    ctx.release_slot(&server);
                    return Err(e);
                }
                (pooled.conn, pooled.thread_id)
            },
            None => {
                let conn_id = ctx.next_conn_id();
                match ctx.connector.connect(&server, &self.auth, conn_id, self.sink.clone()) {
                    Ok(conn) => (conn, 0),
                    Err(e) => {
                        ctx.release_slot(&server);
                        return Err(e);
                    },
                }
            },
        };

        self.endpoints[i].attach(conn, thread_id, true);
        self.connections_version += 1;
        if self.config.causal_reads != CausalReads::None {
            self.endpoints[i].write(query_packet(CAUSAL_READS_SETUP), Some(ReplyTo::Ignore))?;
        }
        self.replay(i)?;
        self.endpoints[i].flush_waiting()
    }

    /// Writes the session command history to a new connection.
    fn replay(&mut self, i: usize) -> Result<()> {
        let ep = &mut self.endpoints[i];
        let mut n = 0;
        for entry in self.history.entries() {
            let to = match self.sescmds.get_mut(&entry.id) {
                // still in flight elsewhere, check it like the other secondaries
                Some(r) => {
                    r.outstanding += 1;
                    ReplyTo::SessionCommand { id: entry.id, primary: false }
                },
                None => ReplyTo::History(entry.id),
            };
            ep.write(entry.packet.clone(), Some(to))?;
            n += 1;
        }
        if n > 0 {
            debug!(session_id = self.id, server = ep.server().name(), commands = n, "replaying session command history");
        }
        Ok(())
    }

    /// Returns the master endpoint, connecting one if needed and allowed.
    fn get_master(&mut self, ctx: &mut WorkerContext) -> Result<Option<usize>> {
        let in_trx = self.trx.is_trx_active() && !self.trx.is_trx_starting();
        if let Some(m) = self.master {
            let ep = &self.endpoints[m];
            if ep.is_open() && (ep.server().is_master() || in_trx || !self.config.master_reconnection) {
                return Ok(Some(m));
            }
        }

        let current = self.master.map(|m| self.endpoints[m].server().clone());
        let (cands, map) = self.candidates(|_, ep| ep.is_open() || ep.can_connect());
        let i = match select_master(&cands, current.as_ref(), self.config.slave_selection_criteria) {
            Some(c) => map[c],
            None => return Ok(None),
        };
        if !self.endpoints[i].is_open() {
            if self.lost_master && (!self.config.master_reconnection || in_trx) {
                return Ok(None);
            }
            if !self.can_reconnect() {
                return Ok(None);
            }
            if let Err(e) = self.connect(ctx, i) {
                warn!(session_id = self.id, server = self.endpoints[i].server().name(), %e, "could not connect to master");
                return Ok(None);
            }
        }
        if self.master.is_some() && self.master != Some(i) {
            info!(session_id = self.id, server = self.endpoints[i].server().name(), "switching to a new master");
        }
        self.master = Some(i);
        self.lost_master = false;
        Ok(Some(i))
    }

    fn master_for_write(&mut self, ctx: &mut WorkerContext) -> Result<usize> {
        match self.get_master(ctx)? {
            Some(i) => Ok(i),
            None => match self.config.master_failure_mode {
                MasterFailureMode::ErrorOnWrite => Err(Error::query_error(
                    ER_OPTION_PREVENTS_STATEMENT.code, ER_OPTION_PREVENTS_STATEMENT.sql_state, READ_ONLY_MESSAGE)),
                _ => Err(Error::backend(ErrorType::Transient, "no master server available for a write")),
            },
        }
    }

    fn causal_position(&self) -> Option<GtidPosition> {
        match self.config.causal_reads {
            CausalReads::None => None,
            CausalReads::Fast => Some(self.gtid.clone()),
            CausalReads::FastGlobal => Some(self.service.gtid_pos()),
        }
    }

    /// Returns an endpoint for a read, None if only the master could take it.
    fn get_reader(&mut self, ctx: &mut WorkerContext) -> Result<Option<usize>> {
        if self.trx.is_trx_read_only() {
            if let Some(t) = self.trx_target.filter(|&t| self.endpoints[t].is_open()) {
                return Ok(Some(t));
            }
        }
        let master = self.master;
        let open_replicas = self.endpoints.iter().enumerate()
            .filter(|(i, ep)| ep.is_open() && Some(*i) != master)
            .count();
        let may_connect = open_replicas < self.config.max_slave_connections as usize && self.can_reconnect();

        let gtid = self.causal_position();
        let constraints = ReadConstraints {
            max_replication_lag: self.config.max_replication_lag,
            master_accept_reads: self.config.master_accept_reads,
            gtid: gtid.as_ref(),
        };
        let (cands, map) = self.candidates(|_, ep| ep.is_open() || (may_connect && ep.can_connect()));
        let i = match select_reader(&cands, self.config.slave_selection_criteria, &constraints) {
            Some(c) => map[c],
            None => return Ok(None),
        };
        if !self.endpoints[i].is_open() {
            if let Err(e) = self.connect(ctx, i) {
                warn!(session_id = self.id, server = self.endpoints[i].server().name(), %e, "could not connect to replica");
                return Ok(None);
            }
        }
        if self.trx.is_trx_read_only() {
            self.trx_target = Some(i);
        }
        Ok(Some(i))
    }

    fn reader_or_master(&mut self, ctx: &mut WorkerContext) -> Result<usize> {
        if let Some(i) = self.get_reader(ctx)? {
            return Ok(i);
        }
        match self.get_master(ctx)? {
            Some(i) => Ok(i),
            None => match self.config.master_failure_mode {
                MasterFailureMode::FailInstantly => Err(Error::backend(ErrorType::Transient, "no server available for a read")),
                _ => Err(Error::query_error(ER_UNKNOWN_ERROR.code, ER_UNKNOWN_ERROR.sql_state, NO_READ_TARGET_MESSAGE)),
            },
        }
    }

    /// Writes a command whose reply goes to the client. A statement id command for a
    /// connection still replaying its prepares is put back at the head of the queue.
    fn write_client(&mut self, i: usize, packet: Bytes) -> Result<bool> {
        let uses_stmt_id = payload(&packet).first()
            .and_then(|b| Command::from_u8(*b))
            .map(|c| c.has_statement_id())
            .unwrap_or(false);
        if uses_stmt_id && self.endpoints[i].has_pending_prepare() {
            trace!(session_id = self.id, "deferring statement until the prepares are replayed");
            self.queue.push_front(packet);
            return Ok(false);
        }
        self.use_counter += 1;
        let ep = &mut self.endpoints[i];
        ep.set_last_used(self.use_counter);
        let large = is_large(&packet);
        ep.write(packet, Some(ReplyTo::Client))?;
        if large {
            self.large_targets = vec![i];
        }
        Ok(true)
    }

    fn write_continuation(&mut self, packet: Bytes) -> Result<()> {
        let more = is_large(&packet);
        for &i in &self.large_targets {
            self.endpoints[i].write_raw(packet.clone())?;
        }
        if !more {
            self.large_targets.clear();
        }
        Ok(())
    }

    /// Sends a session command to every open connection. Returns its history id.
    fn session_command(&mut self, ctx: &mut WorkerContext, packet: Bytes) -> Result<u32> {
        if !self.endpoints.iter().any(|ep| ep.is_open()) {
            // something has to answer it
            if self.get_master(ctx)?.is_none() && self.get_reader(ctx)?.is_none() {
                return Err(Error::backend(ErrorType::Transient, "no server available for a session command"));
            }
        }
        let id = self.history.next_id();
        self.sescmd_count += 1;
        self.history.add(id, packet.clone());

        let primary = match self.master.filter(|&m| self.endpoints[m].is_open()) {
            Some(m) => m,
            None => match self.endpoints.iter().position(|ep| ep.is_open()) {
                Some(i) => i,
                None => return Err(Error::backend(ErrorType::Transient, "no server available for a session command")),
            },
        };
        let large = is_large(&packet);
        let mut outstanding = 0;
        let mut targets = Vec::new();
        for (i, ep) in self.endpoints.iter_mut().enumerate() {
            if !ep.is_open() {
                continue;
            }
            ep.write(packet.clone(), Some(ReplyTo::SessionCommand { id, primary: i == primary }))?;
            if i != primary {
                outstanding += 1;
            }
            targets.push(i);
        }
        if large {
            self.large_targets = targets;
        }
        self.sescmds.insert(id, SescmdResult { outstanding, primary: None, early: Vec::new() });
        trace!(session_id = self.id, id, servers = outstanding + 1, "session command");
        Ok(id)
    }

    fn qualified_table(&self, t: &TableName) -> String {
        format!("{}.{}", t.db.as_deref().unwrap_or(&self.db), t.table)
    }

    /// Tracks the session's temporary tables. Reads of them must go to the master, which has them.
    fn track_tmp_tables(&mut self, info: &QueryInfo, type_mask: &mut u32) {
        for t in info.created_tmp_tables() {
            let name = self.qualified_table(t);
            self.tmp_tables.insert(name);
        }
        if self.tmp_tables.is_empty() {
            return;
        }
        if *type_mask & QUERY_TYPE_READ != 0 && info.tables().iter().any(|t| self.tmp_tables.contains(&self.qualified_table(t))) {
            *type_mask |= QUERY_TYPE_READ_TMP_TABLE;
        }
        for t in info.dropped_tables() {
            let name = self.qualified_table(t);
            self.tmp_tables.remove(&name);
        }
    }

    fn route_sql(&mut self, ctx: &mut WorkerContext, packet: Bytes) -> Result<bool> {
        let info = ctx.classifier.parse(&packet);
        let mut mask = info.type_mask();

        if info.is_multi_stmt() && self.config.strict_multi_stmt && !self.locked_to_master {
            info!(session_id = self.id, "multi-statement query, the rest of the session goes to the master");
            self.locked_to_master = true;
        }
        if info.is_sp_call() && self.config.strict_sp_calls && !self.locked_to_master {
            info!(session_id = self.id, "stored procedure call, the rest of the session goes to the master");
            self.locked_to_master = true;
        }
        self.track_tmp_tables(&info, &mut mask);

        if let Some(name) = info.prepare_name() {
            if mask & QUERY_TYPE_PREPARE_NAMED_STMT != 0 {
                self.text_ps_types.insert(name.to_string(), info.prepare_type_mask());
            } else if mask & QUERY_TYPE_DEALLOC_PREPARE != 0 {
                self.text_ps_types.remove(name);
            } else if mask & QUERY_TYPE_EXEC_STMT != 0 {
                // EXECUTE goes where the prepared statement would
                let prepared = self.text_ps_types.get(name).cloned().unwrap_or(QUERY_TYPE_WRITE);
                mask = (mask & !QUERY_TYPE_EXEC_STMT) | prepared;
            }
        }

        self.trx.track_query(mask);
        let route = route_for(mask, &self.trx, self.locked_to_master, self.config.use_sql_variables_in);
        trace!(session_id = self.id, sql = info.sql(), type_mask = %type_mask_to_string(mask), ?route, "routing query");
        self.dispatch(ctx, packet, route)
    }

    fn dispatch(&mut self, ctx: &mut WorkerContext, packet: Bytes, route: Route) -> Result<bool> {
        match route {
            Route::All => {
                self.session_command(ctx, packet)?;
                Ok(true)
            },
            Route::Master => {
                let i = self.master_for_write(ctx)?;
                self.write_client(i, packet)
            },
            Route::Reader => {
                let i = self.reader_or_master(ctx)?;
                let routed = self.write_client(i, packet)?;
                self.retryable = routed && !self.trx.is_trx_active();
                Ok(routed)
            },
        }
    }

    fn route_stmt(&mut self, ctx: &mut WorkerContext, packet: Bytes) -> Result<bool> {
        let id = statement_id(&packet).unwrap_or(0);
        let mask = self.ps_types.get(&id).cloned().unwrap_or(QUERY_TYPE_WRITE);
        let i = match route_for(mask, &self.trx, self.locked_to_master, self.config.use_sql_variables_in) {
            Route::Reader => self.reader_or_master(ctx)?,
            _ => self.master_for_write(ctx)?,
        };
        let routed = self.write_client(i, packet)?;
        if routed {
            self.exec_targets.insert(id, i);
        }
        Ok(routed)
    }

    /// COM_STMT_SEND_LONG_DATA and COM_STMT_CLOSE: every connection that may know the statement, no reply.
    fn route_to_all_no_reply(&mut self, packet: Bytes, close: bool) -> Result<bool> {
        if self.endpoints.iter().any(|ep| ep.is_open() && ep.has_pending_prepare()) {
            self.queue.push_front(packet);
            return Ok(false);
        }
        let id = statement_id(&packet).unwrap_or(0);
        for ep in self.endpoints.iter_mut().filter(|ep| ep.is_open()) {
            ep.write(packet.clone(), None)?;
            if close && ep.is_connected() {
                ep.remove_stmt(id);
            }
        }
        if close {
            self.history.remove_prepare(id);
            self.ps_types.remove(&id);
            self.exec_targets.remove(&id);
        }
        Ok(true)
    }

    fn route_command(&mut self, ctx: &mut WorkerContext, packet: Bytes) -> Result<bool> {
        self.retryable = false;
        let cmd = payload(&packet).first().and_then(|b| Command::from_u8(*b));
        match cmd {
            Some(Command::Query) => self.route_sql(ctx, packet),
            Some(Command::StmtPrepare) => {
                let info = ctx.classifier.parse(&packet);
                let id = self.session_command(ctx, packet)?;
                self.ps_types.insert(id, info.type_mask());
                Ok(true)
            },
            Some(Command::StmtExecute) | Some(Command::StmtBulkExecute) => self.route_stmt(ctx, packet),
            Some(Command::StmtFetch) | Some(Command::StmtReset) => {
                let id = statement_id(&packet).unwrap_or(0);
                let i = match self.exec_targets.get(&id) {
                    Some(&i) if self.endpoints[i].is_open() => i,
                    _ => self.master_for_write(ctx)?,
                };
                self.write_client(i, packet)
            },
            Some(Command::StmtSendLongData) => self.route_to_all_no_reply(packet, false),
            Some(Command::StmtClose) => self.route_to_all_no_reply(packet, true),
            Some(Command::InitDb) | Some(Command::SetOption) => {
                self.session_command(ctx, packet)?;
                Ok(true)
            },
            Some(Command::ResetConnection) => {
                self.session_command(ctx, packet)?;
                // the servers start over, nothing before this needs replaying
                self.history.clear();
                self.trx.reset();
                self.tmp_tables.clear();
                self.ps_types.clear();
                self.text_ps_types.clear();
                self.exec_targets.clear();
                Ok(true)
            },
            Some(Command::Ping) | Some(Command::Statistics) | Some(Command::FieldList) => {
                self.dispatch(ctx, packet, Route::Reader)
            },
            Some(Command::Quit) => Ok(true),
            Some(Command::ChangeUser) | Some(Command::ProcessKill) => {
                Err(Error::protocol_error(format!("{:?} must be handled by the client connection", cmd)))
            },
            _ => self.dispatch(ctx, packet, Route::Master),
        }
    }

    fn process_queue(&mut self, ctx: &mut WorkerContext, up: &mut dyn Upstream) -> Result<()> {
        while let Some(packet) = self.queue.pop_front() {
            if !self.large_targets.is_empty() {
                self.write_continuation(packet)?;
                continue;
            }
            if self.is_waiting_for_reply() {
                self.queue.push_front(packet);
                break;
            }
            match self.route_command(ctx, packet) {
                Ok(true) => (),
                Ok(false) => break,
                Err(e) => match e.as_query_error() {
                    Some(qe) => up.client_error(qe),
                    None => return Err(e),
                },
            }
        }
        Ok(())
    }

    fn track_gtid(&mut self, reply: &Reply) {
        if self.config.causal_reads == CausalReads::None {
            return;
        }
        let gtid = match reply.last_gtid().or_else(|| reply.get_variable("last_gtid")) {
            Some(s) if !s.is_empty() => s,
            _ => return,
        };
        match gtid.parse::<Gtid>() {
            Ok(g) => {
                if self.config.causal_reads == CausalReads::FastGlobal {
                    self.service.update_gtid(g.clone());
                }
                self.gtid.update(g);
            },
            Err(e) => debug!(session_id = self.id, gtid, %e, "ignoring unparsable gtid"),
        }
    }

    fn client_reply_done(&mut self, ctx: &mut WorkerContext, i: usize, up: &mut dyn Upstream) -> Result<()> {
        let reply = self.endpoints[i].reply().clone();
        self.trx.track_reply(&reply);
        if let Some(schema) = reply.schema() {
            self.db = schema.to_string();
        }
        self.track_gtid(&reply);
        if !self.trx.is_trx_active() {
            self.trx_target = None;
        }
        self.retryable = false;
        self.process_queue(ctx, up)
    }

    fn primary_done(&mut self, ctx: &mut WorkerContext, i: usize, id: u32, up: &mut dyn Upstream) -> Result<()> {
        let reply = self.endpoints[i].reply().clone();
        self.history.set_outcome(id, &reply);
        let mut mismatched = Vec::new();
        if let Some(r) = self.sescmds.get_mut(&id) {
            for (j, early) in r.early.drain(..) {
                if !early.same_outcome(&reply) {
                    mismatched.push(j);
                }
            }
            if r.outstanding == 0 {
                self.sescmds.remove(&id);
            } else {
                r.primary = Some(reply);
            }
        }
        for j in mismatched {
            self.sescmd_mismatch(ctx, j, id, up)?;
        }
        Ok(())
    }

    fn secondary_done(&mut self, ctx: &mut WorkerContext, i: usize, id: u32, up: &mut dyn Upstream) -> Result<()> {
        let reply = self.endpoints[i].reply();
        let mut mismatch = false;
        if let Some(r) = self.sescmds.get_mut(&id) {
            r.outstanding = r.outstanding.saturating_sub(1);
            match &r.primary {
                Some(p) => mismatch = !p.same_outcome(reply),
                None => r.early.push((i, reply.clone())),
            }
            if r.outstanding == 0 && r.primary.is_some() {
                self.sescmds.remove(&id);
            }
        }
        if mismatch {
            self.sescmd_mismatch(ctx, i, id, up)?;
        }
        Ok(())
    }

    fn history_done(&mut self, ctx: &mut WorkerContext, i: usize, id: u32, up: &mut dyn Upstream) -> Result<()> {
        let mismatch = match self.history.outcome(id) {
            Some(outcome) => !outcome.same_outcome(self.endpoints[i].reply()),
            None => false,
        };
        if mismatch {
            self.sescmd_mismatch(ctx, i, id, up)?;
        }
        Ok(())
    }

    /// A connection answered a session command differently than the one the client
    /// heard from. Its session state is unknown now, so it's out for good.
    fn sescmd_mismatch(&mut self, ctx: &mut WorkerContext, i: usize, id: u32, up: &mut dyn Upstream) -> Result<()> {
        let ep = &self.endpoints[i];
        if !ep.is_open() {
            return Ok(());
        }
        warn!(session_id = self.id, server = ep.server().name(), id, error = %ep.reply().error().message,
            "session command result differs from the one sent to the client, closing the connection");
        if ep.expects_client_reply() {
            // a command of the client is queued behind it, it's retried or fails the session
            return self.endpoint_failed(ctx, i, ErrorType::Permanent, "session command result mismatch", up);
        }
        self.release(ctx, i, EndpointState::ConnectedFailed, false);
        if self.master == Some(i) {
            self.master = None;
            self.lost_master = true;
        }
        Ok(())
    }

    fn on_packet(&mut self, ctx: &mut WorkerContext, i: usize, packet: Bytes, up: &mut dyn Upstream) -> Result<()> {
        let processed = match self.endpoints[i].on_packet(packet) {
            Ok(p) => p,
            Err(e) => return self.endpoint_failed(ctx, i, ErrorType::Transient, &e.to_string(), up),
        };
        match processed.to {
            ReplyTo::Client => {
                up.client_reply(processed.packet, self.endpoints[i].reply());
                if processed.complete {
                    self.client_reply_done(ctx, i, up)?;
                }
            },
            ReplyTo::SessionCommand { id, primary: true } => {
                up.client_reply(processed.packet, self.endpoints[i].reply());
                if processed.complete {
                    self.primary_done(ctx, i, id, up)?;
                    self.client_reply_done(ctx, i, up)?;
                }
            },
            ReplyTo::SessionCommand { id, primary: false } => {
                if processed.complete {
                    self.secondary_done(ctx, i, id, up)?;
                    self.process_queue(ctx, up)?;
                }
            },
            ReplyTo::History(id) => {
                if processed.complete {
                    self.history_done(ctx, i, id, up)?;
                    self.process_queue(ctx, up)?;
                }
            },
            ReplyTo::Ignore => {
                if processed.complete {
                    let reply = self.endpoints[i].reply();
                    if reply.error().is_set() {
                        warn!(session_id = self.id, server = self.endpoints[i].server().name(), error = %reply.error().message, "internal statement failed");
                    }
                }
            },
        }
        Ok(())
    }

    /// Gives up an endpoint's connection, to the pool if pool is set and the connection is clean.
    fn release(&mut self, ctx: &mut WorkerContext, i: usize, state: EndpointState, pool: bool) {
        let ep = &mut self.endpoints[i];
        let server = ep.server().clone();
        let had_slot = ep.has_slot();
        let thread_id = ep.thread_id();
        let capabilities = ep.capabilities();
        let poolable = pool && ep.is_connected() && !ep.is_busy() && ep.is_established()
            && !self.trx.is_trx_active() && self.history.can_pool();
        let (conn, _) = ep.detach(state);
        if had_slot {
            ctx.release_slot(&server);
        }
        if let Some(conn) = conn {
            if poolable {
                ctx.pools.put(PooledConn { conn, thread_id, capabilities, pooled_at: coarse_monotonic_now() });
            } else {
                conn.close();
            }
        }
        self.large_targets.retain(|&t| t != i);
        self.connections_version += 1;
    }

    fn endpoint_failed(&mut self, ctx: &mut WorkerContext, i: usize, ty: ErrorType, reason: &str, up: &mut dyn Upstream) -> Result<()> {
        let server: Arc<Server> = self.endpoints[i].server().clone();
        let forwarded = self.endpoints[i].has_forwarded();
        warn!(session_id = self.id, server = server.name(), reason, error_type = %ty, "lost connection to server");

        let state = match ty {
            ErrorType::Permanent => EndpointState::ConnectedFailed,
            ErrorType::Transient => EndpointState::NoConn,
        };
        let had_slot = self.endpoints[i].has_slot();
        let (conn, pending) = self.endpoints[i].detach(state);
        if let Some(conn) = conn {
            conn.close();
        }
        if had_slot {
            ctx.release_slot(&server);
        }
        self.large_targets.retain(|&t| t != i);
        self.connections_version += 1;

        let was_master = self.master == Some(i);
        if was_master {
            self.master = None;
            self.lost_master = true;
        }
        if self.trx_target == Some(i) {
            self.trx_target = None;
            if self.trx.is_trx_active() {
                return Err(Error::backend(ty, format!("lost connection to {} during a read-only transaction", server.name())));
            }
        }

        let mut retry = None;
        for p in pending {
            match p.to {
                ReplyTo::Client => {
                    if self.retryable && self.config.retry_failed_reads && !forwarded {
                        retry = Some(p.packet);
                    } else {
                        return Err(Error::backend(ty, format!("lost connection to {} while waiting for a reply: {}", server.name(), reason)));
                    }
                },
                ReplyTo::SessionCommand { id, primary } => {
                    if primary {
                        let promoted = !forwarded && self.endpoints.iter_mut().any(|ep| ep.promote(id));
                        if !promoted {
                            return Err(Error::backend(ty, format!("lost connection to {} during a session command: {}", server.name(), reason)));
                        }
                    }
                    if let Some(r) = self.sescmds.get_mut(&id) {
                        r.outstanding = r.outstanding.saturating_sub(1);
                    }
                },
                _ => (),
            }
        }

        if was_master && self.config.master_failure_mode == MasterFailureMode::FailInstantly {
            return Err(Error::backend(ty, format!("lost connection to the master {}", server.name())));
        }
        if let Some(packet) = retry {
            info!(session_id = self.id, server = server.name(), "retrying the read on another server");
            let j = self.reader_or_master(ctx)?;
            self.retryable = false;
            if !self.write_client(j, packet)? {
                return Ok(());
            }
        }
        self.process_queue(ctx, up)
    }

    /// Tries again to connect the endpoints waiting for a connection slot.
    fn retry_waiting(&mut self, ctx: &mut WorkerContext, up: &mut dyn Upstream) -> Result<()> {
        for i in 0..self.endpoints.len() {
            if self.endpoints[i].state() == EndpointState::WaitingForConn {
                if let Err(e) = self.connect(ctx, i) {
                    warn!(session_id = self.id, server = self.endpoints[i].server().name(), %e, "connecting after waiting for a slot failed");
                    return self.endpoint_failed(ctx, i, e.error_type(), &e.to_string(), up);
                }
            }
        }
        Ok(())
    }

    fn wait_timed_out(&self, now: u32) -> Option<&Endpoint> {
        let timeout = self.pool_config.multiplex_timeout as u32;
        self.endpoints.iter().find(|ep| {
            ep.state() == EndpointState::WaitingForConn && now.saturating_sub(ep.waiting_since()) >= timeout
        })
    }
}

impl RouterSession for RWSplitSession {
    fn route_query(&mut self, ctx: &mut WorkerContext, packet: Bytes, _up: &mut dyn Upstream) -> Result<()> {
        self.last_activity = coarse_monotonic_now();
        if !self.queue.is_empty() {
            self.queue.push_back(packet);
            return Ok(());
        }
        if !self.large_targets.is_empty() {
            return self.write_continuation(packet);
        }
        if let Some(i) = self.loading_endpoint() {
            return self.endpoints[i].write_raw(packet);
        }
        if self.is_waiting_for_reply() {
            self.queue.push_back(packet);
            return Ok(());
        }
        self.route_command(ctx, packet).map(|_| ())
    }

    fn backend_event(&mut self, ctx: &mut WorkerContext, event: BackendEvent, up: &mut dyn Upstream) -> Result<()> {
        let i = match self.endpoints.iter().position(|ep| ep.conn_id() == Some(event.conn_id)) {
            Some(i) => i,
            None => {
                trace!(session_id = self.id, conn_id = event.conn_id, "event for a connection the session no longer has");
                return Ok(());
            },
        };
        match event.kind {
            BackendEventKind::Established { thread_id, capabilities } => {
                self.endpoints[i].set_established(thread_id, capabilities);
                self.connections_version += 1;
                Ok(())
            },
            BackendEventKind::Packet(packet) => self.on_packet(ctx, i, packet, up),
            BackendEventKind::Error(ty, msg) => self.endpoint_failed(ctx, i, ty, &msg, up),
            BackendEventKind::Closed => self.endpoint_failed(ctx, i, ErrorType::Transient, "server closed the connection", up),
        }
    }

    fn wakeup(&mut self, ctx: &mut WorkerContext, up: &mut dyn Upstream) -> Result<()> {
        self.retry_waiting(ctx, up)
    }

    fn tick(&mut self, ctx: &mut WorkerContext, now: u32, up: &mut dyn Upstream) -> Result<()> {
        // slots released by sessions of other workers don't wake us up
        self.retry_waiting(ctx, up)?;
        if let Some(ep) = self.wait_timed_out(now) {
            return Err(Error::backend(ErrorType::Transient,
                format!("timed out waiting for a connection slot on {}", ep.server().name())));
        }
        let idle_time = self.pool_config.idle_session_pool_time as u32;
        if idle_time == 0 || now.saturating_sub(self.last_activity) < idle_time {
            return Ok(());
        }
        if !self.queue.is_empty() || self.trx.is_trx_active() || !self.history.can_pool() {
            return Ok(());
        }
        for i in 0..self.endpoints.len() {
            let ep = &self.endpoints[i];
            if ep.is_connected() && ep.is_established() && !ep.is_busy() {
                debug!(session_id = self.id, server = ep.server().name(), "session idle, returning connection to the pool");
                self.release(ctx, i, EndpointState::IdlePooled, true);
            }
        }
        Ok(())
    }

    fn change_user(&mut self, _ctx: &mut WorkerContext, auth: BackendAuth) -> Result<()> {
        self.db = auth.db.clone();
        self.auth = auth;
        self.history.clear();
        self.sescmds.clear();
        self.trx.reset();
        self.tmp_tables.clear();
        self.ps_types.clear();
        self.text_ps_types.clear();
        self.exec_targets.clear();
        self.locked_to_master = false;
        for ep in self.endpoints.iter_mut().filter(|ep| ep.is_connected()) {
            ep.begin_reset();
            ep.reset_conn(&self.auth)?;
        }
        self.connections_version += 1;
        Ok(())
    }

    fn connections(&self) -> Vec<(Arc<Server>, u32)> {
        self.endpoints.iter()
            .filter(|ep| ep.is_connected() && ep.thread_id() != 0)
            .map(|ep| (ep.server().clone(), ep.thread_id()))
            .collect()
    }

    fn connections_version(&self) -> u64 {
        self.connections_version
    }

    fn close(&mut self, ctx: &mut WorkerContext) {
        for i in 0..self.endpoints.len() {
            if self.endpoints[i].state() != EndpointState::NoConn {
                self.release(ctx, i, EndpointState::NoConn, true);
            }
        }
        ctx.sessions.remove_slot_waiter(self.id);
        self.queue.clear();
    }
}

impl Drop for RWSplitSession {
    fn drop(&mut self) {
        // close() returns connections to the pool, anything left here just goes away
        for ep in self.endpoints.iter_mut() {
            let (conn, _) = ep.detach(EndpointState::NoConn);
            if let Some(conn) = conn {
                conn.close();
            }
        }
    }
}
