use std::collections::VecDeque;
use std::mem;
use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, Bytes};
use chrono::{DateTime, Local};
use tracing::{debug, info, trace, warn};

use crate::sluicedb::{Error, QueryError};
use crate::sluicedb::config::{Settings, TlsMode, MAX_HANDSHAKE_PACKET_SIZE, SESSION_TRACE_STATEMENTS};
use crate::sluicedb::mysql::backend::{BackendAuth, BackendEvent, EventSink};
use crate::sluicedb::mysql::client::auth::{check_native_token, AuthFailure};
use crate::sluicedb::mysql::client::client_state::{AuthState, ClientState, RoutingState};
use crate::sluicedb::mysql::protocol::{ChangeUserRequest, Command, ErrorCode, Header, HandshakeResponse, InitialHandshake, PacketReader, ProxyHeader, Reply, ReplyState};
use crate::sluicedb::mysql::protocol::capabilities::*;
use crate::sluicedb::mysql::protocol::error_codes::*;
use crate::sluicedb::mysql::protocol::handshake::is_ssl_request;
use crate::sluicedb::mysql::protocol::packet::{is_large_payload, payload, sequence};
use crate::sluicedb::mysql::protocol::packet_builder::{auth_switch_request, err_packet, error_code_packet, ok_packet};
use crate::sluicedb::mysql::protocol::proxy_protocol::{is_proxy_protocol_allowed, normalize_ip, parse_proxy_header};
use crate::sluicedb::mysql::protocol::scramble::{generate_scramble, Phase2Token, Scramble, NATIVE_PASSWORD_PLUGIN};
use crate::sluicedb::mysql::sql::{get_sql, parse_special_statement, KillRequest, KillTarget, KillType, SpecialStatement};
use crate::sluicedb::router::{RWSplitSession, RouterSession, Upstream};
use crate::sluicedb::users::{UserEntry, UserEntryType};
use crate::sluicedb::worker::{Wakeup, WorkerContext};

/// Longest statement text kept in the session trace
const TRACE_SQL_LEN: usize = 1024;

/// Work the client connection needs its driver to do outside the state machine.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Action {
    /// The client sent an SSLRequest: start TLS on the socket, then hand the bytes
    /// read past the request (take_pending_input) back through the TLS layer.
    StartTls,
    /// Resolve the client's host name and send it back as Wakeup::Hostname
    ReverseLookup(IpAddr),
    /// Run the KILL and send Wakeup::KillDone when it finished
    Kill(KillRequest),
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum StateChange {
    Use(String),
    Role(Option<String>),
}

enum ReplyEvent {
    LoadData,
    Complete { ok: bool },
}

/// Collects what the router sends upstream while it's borrowed mutably.
#[derive(Default)]
struct Replies {
    packets: Vec<Bytes>,
    events: Vec<ReplyEvent>,
}

impl Upstream for Replies {
    fn client_reply(&mut self, packet: Bytes, reply: &Reply) {
        self.packets.push(packet);
        if reply.is_complete() {
            self.events.push(ReplyEvent::Complete { ok: reply.is_ok() });
        } else if reply.state() == ReplyState::LoadData {
            self.events.push(ReplyEvent::LoadData);
        }
    }

    fn client_error(&mut self, err: &QueryError) {
        self.packets.push(err_packet(1, err.code, err.sql_state, &err.message));
        self.events.push(ReplyEvent::Complete { ok: false });
    }
}

/// The credentials of a login or COM_CHANGE_USER and what the account lookup found.
#[derive(Debug, Clone, Default)]
struct Login {
    user: String,
    token: Vec<u8>,
    db: String,
    plugin: String,
    charset: u8,
    attrs: Bytes,
    entry: UserEntry,
    result: Option<UserEntryType>,
    phase2: Option<Phase2Token>,
    /// The reverse lookup finished, hostname holds its answer
    rdns_done: bool,
    hostname: Option<String>,
    tried_again: bool,
}

/// The client side of a session: the MariaDB server protocol from the first byte
/// to COM_QUIT. It does no IO, the driver feeds it socket data, backend events and
/// wakeups, then writes take_output to the socket and performs take_action.
pub struct ClientConnection {
    id: u64,
    settings: &'static Settings,
    state: ClientState,
    auth_state: AuthState,
    routing_state: RoutingState,
    reader: PacketReader,
    output: Vec<Bytes>,
    actions: VecDeque<Action>,
    peer: SocketAddr,
    host: String,
    proxy_checked: bool,
    awaiting_tls: bool,
    tls: bool,
    scramble: Scramble,
    /// The next sequence number of the handshake or auth exchange
    next_seq: u8,
    capabilities: u32,
    extended_capabilities: u32,
    login: Login,
    /// The login in effect before a COM_CHANGE_USER, restored if it fails
    prev_login: Option<Login>,
    role: Option<String>,
    sink: EventSink,
    router: Option<RWSplitSession>,
    /// One entry per command that gets a reply, oldest first
    in_flight: VecDeque<Option<StateChange>>,
    deferred: VecDeque<Bytes>,
    pending_kill: Option<KillRequest>,
    trace: VecDeque<(DateTime<Local>, String)>,
    close_reason: Option<String>,
    published: Option<(u64, String)>,
}

impl ClientConnection {
    pub fn new(id: u64, settings: &'static Settings, peer: SocketAddr, sink: EventSink) -> Self {
        let mut reader = PacketReader::new(settings.recv_buffer_size as usize);
        reader.set_limit(MAX_HANDSHAKE_PACKET_SIZE);
        let host = normalize_ip(peer.ip()).to_string();
        Self {
            id,
            settings,
            state: ClientState::Handshaking,
            auth_state: AuthState::FindEntry,
            routing_state: RoutingState::PacketStart,
            reader,
            output: Vec::new(),
            actions: VecDeque::new(),
            peer,
            host,
            proxy_checked: false,
            awaiting_tls: false,
            tls: false,
            scramble: generate_scramble(),
            next_seq: 0,
            capabilities: 0,
            extended_capabilities: 0,
            login: Login::default(),
            prev_login: None,
            role: None,
            sink,
            router: None,
            in_flight: VecDeque::new(),
            deferred: VecDeque::new(),
            pending_kill: None,
            trace: VecDeque::with_capacity(SESSION_TRACE_STATEMENTS),
            close_reason: None,
            published: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn routing_state(&self) -> RoutingState {
        self.routing_state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn user(&self) -> &str {
        &self.login.user
    }

    pub fn db(&self) -> &str {
        &self.login.db
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn router(&self) -> Option<&RWSplitSession> {
        self.router.as_ref()
    }

    /// Sends the initial handshake.
    pub fn start(&mut self, ctx: &WorkerContext) {
        let mut capabilities = SERVER_CAPABILITIES;
        if ctx.tls.is_some() {
            capabilities |= CLIENT_SSL;
        }
        let hs = InitialHandshake {
            server_version: ctx.service.version_string(),
            thread_id: self.id as u32,
            scramble: self.scramble,
            capabilities,
            extended_capabilities: SERVER_EXTENDED_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        self.send(hs.build(0));
        self.next_seq = 1;
    }

    /// Packets to write to the client, in order.
    pub fn take_output(&mut self) -> Vec<Bytes> {
        mem::take(&mut self.output)
    }

    pub fn take_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Called once TLS is set up: returns the bytes that arrived after the SSLRequest,
    /// they belong to the TLS handshake. Input is processed again from here on.
    pub fn take_pending_input(&mut self) -> Bytes {
        self.awaiting_tls = false;
        self.tls = true;
        self.reader.take_remaining()
    }

    /// Data from the client, already decrypted with TLS.
    pub fn on_data(&mut self, ctx: &mut WorkerContext, data: &[u8]) {
        if self.state.is_closed() {
            return;
        }
        self.reader.bytes_mut().extend_from_slice(data);
        self.process_input(ctx);
        self.after_event(ctx);
    }

    pub fn on_backend_event(&mut self, ctx: &mut WorkerContext, event: BackendEvent) {
        if self.state.is_closed() {
            return;
        }
        let mut replies = Replies::default();
        let result = match self.router.as_mut() {
            Some(router) => router.backend_event(ctx, event, &mut replies),
            None => Ok(()),
        };
        self.apply_replies(replies);
        if let Err(e) = result {
            self.router_error(e, false);
        }
        self.after_event(ctx);
    }

    pub fn on_wakeup(&mut self, ctx: &mut WorkerContext, wakeup: Wakeup) {
        if self.state.is_closed() {
            return;
        }
        trace!(session_id = self.id, ?wakeup, "wakeup");
        match wakeup {
            Wakeup::Hostname(name) => {
                if self.auth_state == AuthState::FindEntryRdns {
                    debug!(session_id = self.id, hostname = ?name, "reverse lookup finished");
                    self.login.hostname = name;
                    self.login.rdns_done = true;
                    self.auth_state = AuthState::FindEntry;
                    self.advance_auth(ctx);
                }
            },
            Wakeup::UsersUpdated => {
                if self.auth_state == AuthState::TryAgain {
                    self.auth_state = AuthState::FindEntry;
                    self.advance_auth(ctx);
                }
            },
            Wakeup::ConnectionSlotFree => {
                let mut replies = Replies::default();
                let result = match self.router.as_mut() {
                    Some(router) => router.wakeup(ctx, &mut replies),
                    None => Ok(()),
                };
                self.apply_replies(replies);
                if let Err(e) = result {
                    self.router_error(e, false);
                }
            },
            Wakeup::KillDone { found } => {
                if self.routing_state == RoutingState::Killing {
                    self.routing_state = RoutingState::PacketStart;
                    match self.pending_kill.take() {
                        Some(KillRequest { target: KillTarget::Id(id), .. }) if !found => {
                            self.send(error_code_packet(1, &ER_NO_SUCH_THREAD, &no_such_thread_message(id)));
                        },
                        _ => self.send(ok_packet(1, 0, 0, 0, 0, None)),
                    }
                }
            },
            Wakeup::Killed => {
                self.send(error_code_packet(0, &ER_CONNECTION_KILLED, "Connection was killed"));
                self.fail("killed by another session");
            },
        }
        self.after_event(ctx);
    }

    /// Periodic housekeeping, now is the coarse monotonic clock.
    pub fn tick(&mut self, ctx: &mut WorkerContext, now: u32) {
        if self.state.is_closed() {
            return;
        }
        let mut replies = Replies::default();
        let result = match self.router.as_mut() {
            Some(router) => router.tick(ctx, now, &mut replies),
            None => Ok(()),
        };
        self.apply_replies(replies);
        if let Err(e) = result {
            self.router_error(e, false);
        }
        self.after_event(ctx);
    }

    /// Closes the router session, releasing its backend connections. The session trace
    /// is logged if the session didn't end with COM_QUIT.
    pub fn finish(&mut self, ctx: &mut WorkerContext) {
        if let Some(mut router) = self.router.take() {
            router.close(ctx);
        }
        match self.state {
            ClientState::Quit => info!(session_id = self.id, user = self.login.user.as_str(), "client quit"),
            ClientState::Failed => {
                let reason = self.close_reason.clone().unwrap_or_default();
                let statements: Vec<String> = self.trace.iter()
                    .map(|(at, sql)| format!("{} {}", at.format("%Y-%m-%d %H:%M:%S%.3f"), sql))
                    .collect();
                warn!(session_id = self.id, user = self.login.user.as_str(), host = self.host.as_str(),
                      reason = reason.as_str(), statements = %statements.join("\n"), "session closed abnormally");
            },
            state => info!(session_id = self.id, user = self.login.user.as_str(), %state, "client closed the connection"),
        }
    }

    fn send(&mut self, packet: Bytes) {
        self.output.push(packet);
    }

    fn fail(&mut self, reason: &str) {
        self.state = ClientState::Failed;
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.to_string());
        }
    }

    /// Sends an ERR with the current exchange sequence number and closes the session.
    fn fail_with(&mut self, ec: &ErrorCode, message: &str) {
        self.send(error_code_packet(self.next_seq, ec, message));
        self.fail(message);
    }

    fn process_input(&mut self, ctx: &mut WorkerContext) {
        if !self.proxy_checked && !self.check_proxy_header() {
            return;
        }
        while !self.state.is_closed() && !self.awaiting_tls {
            match self.reader.read_packet() {
                Ok(Some(packet)) => self.on_packet(ctx, packet),
                Ok(None) => break,
                Err(e) => {
                    debug!(session_id = self.id, %e, "client packet rejected");
                    self.fail_with(&ER_NET_PACKET_TOO_LARGE, "Got a packet bigger than 'max_allowed_packet' bytes");
                },
            }
        }
    }

    /// Consumes a proxy protocol header from an allowed network, returns true
    /// once the rest of the input can be read as packets.
    fn check_proxy_header(&mut self) -> bool {
        if !is_proxy_protocol_allowed(&self.peer.ip(), &self.settings.proxy_networks) {
            self.proxy_checked = true;
            return true;
        }
        match parse_proxy_header(&self.reader.bytes_mut()[..]) {
            Ok(ProxyHeader::Incomplete) => false,
            Ok(ProxyHeader::Absent) => {
                self.proxy_checked = true;
                true
            },
            Ok(ProxyHeader::Parsed { len, source }) => {
                self.reader.bytes_mut().advance(len);
                if let Some(source) = source {
                    debug!(session_id = self.id, proxy = %self.peer, client = %source, "proxy protocol header");
                    self.peer = source;
                    self.host = normalize_ip(source.ip()).to_string();
                }
                self.proxy_checked = true;
                true
            },
            Err(e) => {
                warn!(session_id = self.id, peer = %self.peer, %e, "invalid proxy protocol header");
                self.fail_with(&ER_HANDSHAKE_ERROR, BAD_HANDSHAKE_MESSAGE);
                false
            },
        }
    }

    fn on_packet(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        match self.state {
            ClientState::Handshaking => self.on_handshake_packet(ctx, packet),
            ClientState::Authenticating | ClientState::ChangingUser => self.on_auth_packet(ctx, packet),
            ClientState::Ready => self.on_client_packet(ctx, packet),
            ClientState::Quit | ClientState::Failed => (),
        }
    }

    fn on_handshake_packet(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        let seq = sequence(&packet);
        if seq != self.next_seq {
            self.fail_with(&ER_NET_PACKETS_OUT_OF_ORDER, OUT_OF_ORDER_MESSAGE);
            return;
        }
        self.next_seq = seq.wrapping_add(1);
        let data = payload(&packet);
        if is_ssl_request(data) {
            if self.tls || ctx.tls.is_none() {
                self.fail_with(&ER_HANDSHAKE_ERROR, BAD_HANDSHAKE_MESSAGE);
                return;
            }
            debug!(session_id = self.id, "client requested tls");
            self.awaiting_tls = true;
            self.actions.push_back(Action::StartTls);
            return;
        }
        if self.settings.client_tls.mode == TlsMode::Required && !self.tls {
            self.fail_with(&ER_ACCESS_DENIED_ERROR, SSL_REQUIRED_MESSAGE);
            return;
        }
        let hs = match HandshakeResponse::parse(data) {
            Ok(hs) => hs,
            Err(e) => {
                debug!(session_id = self.id, %e, "bad handshake response");
                self.fail_with(&ER_HANDSHAKE_ERROR, BAD_HANDSHAKE_MESSAGE);
                return;
            },
        };
        self.capabilities = hs.capabilities & (SERVER_CAPABILITIES | CLIENT_SSL | CLIENT_MYSQL);
        self.extended_capabilities = hs.extended_capabilities & SERVER_EXTENDED_CAPABILITIES;
        self.login = Login {
            user: hs.user,
            token: hs.auth_token,
            db: hs.database,
            plugin: hs.auth_plugin,
            charset: hs.charset,
            attrs: hs.attributes,
            ..Login::default()
        };
        debug!(session_id = self.id, user = self.login.user.as_str(), db = self.login.db.as_str(), tls = self.tls, "handshake response");
        self.state = ClientState::Authenticating;
        self.auth_state = AuthState::FindEntry;
        self.advance_auth(ctx);
    }

    fn on_auth_packet(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        // Only the reply to an AuthSwitchRequest is expected, anything else
        // (including data sent while parked) breaks the exchange.
        if self.auth_state != AuthState::ContinueExchange || sequence(&packet) != self.next_seq {
            self.fail_with(&ER_NET_PACKETS_OUT_OF_ORDER, OUT_OF_ORDER_MESSAGE);
            return;
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        self.login.token = payload(&packet).to_vec();
        self.auth_state = AuthState::CheckToken;
        self.advance_auth(ctx);
    }

    /// Runs the authentication states until the exchange completes, fails or has
    /// to wait for the client, a reverse lookup or a user account reload.
    fn advance_auth(&mut self, ctx: &mut WorkerContext) {
        while self.state.is_authenticating() {
            match self.auth_state {
                AuthState::FindEntry => self.find_entry(ctx),
                AuthState::StartExchange => self.start_exchange(ctx),
                AuthState::CheckToken => self.check_token(ctx),
                AuthState::StartSession => self.start_session(ctx),
                AuthState::FindEntryRdns
                | AuthState::ContinueExchange
                | AuthState::TryAgain
                | AuthState::Complete
                | AuthState::Fail => return,
            }
        }
    }

    fn find_entry(&mut self, ctx: &mut WorkerContext) {
        let addr = normalize_ip(self.peer.ip());
        let users_config = &ctx.service.config.users;
        let found = ctx.users.find_user(&self.login.user, &addr, self.login.hostname.as_deref(), &self.login.db, users_config);
        match found.result {
            UserEntryType::NeedNameInfo if !self.login.rdns_done => {
                self.auth_state = AuthState::FindEntryRdns;
                self.actions.push_back(Action::ReverseLookup(addr));
            },
            UserEntryType::NeedNameInfo => {
                // the name couldn't be resolved, no host name pattern can match
                self.login.entry = UserEntry::dummy(&self.login.user);
                self.login.result = Some(UserEntryType::UserNotFound);
                self.auth_state = AuthState::StartExchange;
            },
            result => {
                self.login.entry = found.entry;
                self.login.result = Some(result);
                self.auth_state = AuthState::StartExchange;
            },
        }
    }

    fn start_exchange(&mut self, ctx: &mut WorkerContext) {
        if self.login.result == Some(UserEntryType::PluginNotLoaded) {
            self.auth_failed(ctx, AuthFailure::Entry(UserEntryType::PluginNotLoaded));
            return;
        }
        let plugin = self.login.plugin.as_str();
        if !plugin.is_empty() && plugin != NATIVE_PASSWORD_PLUGIN && self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            debug!(session_id = self.id, plugin, "switching client to mysql_native_password");
            self.send(auth_switch_request(self.next_seq, NATIVE_PASSWORD_PLUGIN, &self.scramble));
            self.next_seq = self.next_seq.wrapping_add(1);
            self.login.plugin = NATIVE_PASSWORD_PLUGIN.to_string();
            self.auth_state = AuthState::ContinueExchange;
            return;
        }
        self.auth_state = AuthState::CheckToken;
    }

    fn check_token(&mut self, ctx: &mut WorkerContext) {
        let token_ok = check_native_token(&self.scramble, &self.login.token, self.login.entry.password_hash());
        let failure = match (self.login.result, token_ok) {
            (None, _) | (Some(UserEntryType::UserNotFound), _) => Some(AuthFailure::Entry(UserEntryType::UserNotFound)),
            (Some(r @ UserEntryType::RootAccessDenied), _)
            | (Some(r @ UserEntryType::AnonProxyAccessDenied), _) => Some(AuthFailure::Entry(r)),
            (Some(_), None) => {
                if ctx.service.config.users.log_password_mismatch {
                    warn!(session_id = self.id, user = self.login.user.as_str(), host = self.host.as_str(), "password mismatch");
                }
                Some(AuthFailure::WrongPassword)
            },
            (Some(UserEntryType::Ok), Some(phase2)) => {
                self.login.phase2 = phase2;
                None
            },
            (Some(r), Some(_)) => Some(AuthFailure::Entry(r)),
        };
        match failure {
            Some(f) => self.auth_failed(ctx, f),
            None => self.auth_state = AuthState::StartSession,
        }
    }

    fn auth_failed(&mut self, ctx: &mut WorkerContext, failure: AuthFailure) {
        if failure.is_retryable() {
            // accounts may have been created on the servers since the last load
            ctx.users.request_update();
        }
        if self.state == ClientState::Authenticating
            && failure.is_retryable()
            && !self.login.tried_again
            && ctx.users.can_update_immediately() {
            debug!(session_id = self.id, user = self.login.user.as_str(), ?failure, "reloading users before retrying");
            self.login.tried_again = true;
            ctx.sessions.add_user_waiter(self.id);
            self.auth_state = AuthState::TryAgain;
            return;
        }

        let (ec, message) = failure.error(&self.login.user, &self.host, &self.login.db,
                                          self.login.entry.auth_plugin(), !self.login.token.is_empty());
        warn!(session_id = self.id, user = self.login.user.as_str(), host = self.host.as_str(),
              code = ec.code, message = message.as_str(), "authentication failed");
        self.send(error_code_packet(self.next_seq, &ec, &message));
        if self.state == ClientState::ChangingUser {
            if let Some(prev) = self.prev_login.take() {
                self.login = prev;
            }
            self.state = ClientState::Ready;
            self.auth_state = AuthState::Complete;
        } else {
            self.auth_state = AuthState::Fail;
            self.fail(&message);
        }
    }

    fn backend_auth(&self) -> BackendAuth {
        BackendAuth {
            user: self.login.user.clone(),
            phase2: self.login.phase2,
            db: self.login.db.clone(),
            plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
            charset: self.login.charset,
            attrs: self.login.attrs.clone(),
            client_caps: self.capabilities,
            client_ext_caps: self.extended_capabilities,
        }
    }

    fn start_session(&mut self, ctx: &mut WorkerContext) {
        let auth = self.backend_auth();
        if self.state == ClientState::ChangingUser {
            let result = match self.router.as_mut() {
                Some(router) => router.change_user(ctx, auth),
                None => Err(Error::closed()),
            };
            match result {
                Ok(()) => {
                    info!(session_id = self.id, user = self.login.user.as_str(), "user changed");
                    self.prev_login = None;
                    self.role = None;
                    self.send(ok_packet(self.next_seq, 0, 0, SERVER_STATUS_AUTOCOMMIT, 0, None));
                    self.state = ClientState::Ready;
                    self.auth_state = AuthState::Complete;
                },
                Err(e) => {
                    self.auth_state = AuthState::Fail;
                    self.fail_with(&ER_UNKNOWN_ERROR, &format!("Failed to change user: {}", e));
                },
            }
            return;
        }

        let mut router = RWSplitSession::new(ctx.service.clone(), self.id, auth, self.sink.clone());
        match router.start(ctx) {
            Ok(()) => {
                info!(session_id = self.id, user = self.login.user.as_str(), host = self.host.as_str(),
                      db = self.login.db.as_str(), "client authenticated");
                self.router = Some(router);
                self.send(ok_packet(self.next_seq, 0, 0, SERVER_STATUS_AUTOCOMMIT, 0, None));
                self.state = ClientState::Ready;
                self.auth_state = AuthState::Complete;
                self.reader.set_limit(0);
            },
            Err(e) => {
                router.close(ctx);
                self.auth_state = AuthState::Fail;
                self.fail_with(&ER_UNKNOWN_ERROR, &format!("Session creation failed: {}", e));
            },
        }
    }

    fn on_client_packet(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        let wait = !self.deferred.is_empty() || self.must_wait(&packet);
        if wait {
            trace!(session_id = self.id, routing_state = %self.routing_state, "deferring client packet");
            self.deferred.push_back(packet);
            return;
        }
        self.dispatch(ctx, packet);
    }

    /// True if packet can't be handled in the current routing state yet.
    fn must_wait(&self, packet: &[u8]) -> bool {
        match self.routing_state {
            RoutingState::ChangingState | RoutingState::Killing => true,
            RoutingState::PacketStart => {
                payload(packet).first() == Some(&(Command::ChangeUser as u8)) && !self.in_flight.is_empty()
            },
            RoutingState::LargePacket | RoutingState::LoadData => false,
        }
    }

    fn drain_deferred(&mut self, ctx: &mut WorkerContext) {
        while self.state == ClientState::Ready {
            let wait = match self.deferred.front() {
                Some(packet) => self.must_wait(packet),
                None => break,
            };
            if wait {
                break;
            }
            if let Some(packet) = self.deferred.pop_front() {
                self.dispatch(ctx, packet);
            }
        }
    }

    fn dispatch(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        match self.routing_state {
            RoutingState::LargePacket => {
                if !Header::parse(&packet).map(|h| is_large_payload(&h)).unwrap_or(false) {
                    self.routing_state = RoutingState::PacketStart;
                }
                self.route(ctx, packet);
            },
            RoutingState::LoadData => {
                if payload(&packet).is_empty() {
                    self.routing_state = RoutingState::PacketStart;
                }
                self.route(ctx, packet);
            },
            RoutingState::PacketStart => self.start_command(ctx, packet),
            RoutingState::ChangingState | RoutingState::Killing => self.deferred.push_front(packet),
        }
    }

    fn start_command(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        let large = Header::parse(&packet).map(|h| is_large_payload(&h)).unwrap_or(false);
        let data = payload(&packet);
        let command = data.first().and_then(|b| Command::from_u8(*b));
        self.record(&packet, command);

        let mut change = None;
        match command {
            Some(Command::Quit) => {
                debug!(session_id = self.id, "COM_QUIT");
                self.state = ClientState::Quit;
                return;
            },
            Some(Command::ChangeUser) => {
                self.start_change_user(ctx, &packet);
                return;
            },
            Some(Command::ProcessKill) if data.len() >= 5 => {
                let id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as u64;
                self.start_kill(KillRequest { target: KillTarget::Id(id), kill_type: KillType::Connection, hardness: None });
                return;
            },
            Some(Command::InitDb) => {
                change = Some(StateChange::Use(String::from_utf8_lossy(&data[1..]).into_owned()));
            },
            Some(Command::Query) if !large => {
                match get_sql(&packet).and_then(parse_special_statement) {
                    Some(SpecialStatement::Kill(req)) => {
                        self.start_kill(req);
                        return;
                    },
                    Some(SpecialStatement::Use(db)) => change = Some(StateChange::Use(db)),
                    Some(SpecialStatement::SetRole(role)) => change = Some(StateChange::Role(role)),
                    None => (),
                }
            },
            _ => (),
        }

        if command.map(|c| c.will_respond()).unwrap_or(true) {
            self.in_flight.push_back(change.clone());
        }
        if change.is_some() {
            self.routing_state = RoutingState::ChangingState;
        } else if large {
            self.routing_state = RoutingState::LargePacket;
        }
        self.route(ctx, packet);
    }

    fn start_kill(&mut self, req: KillRequest) {
        debug!(session_id = self.id, ?req, "kill");
        self.pending_kill = Some(req.clone());
        self.routing_state = RoutingState::Killing;
        self.actions.push_back(Action::Kill(req));
    }

    fn start_change_user(&mut self, ctx: &mut WorkerContext, packet: &Bytes) {
        self.next_seq = sequence(packet).wrapping_add(1);
        let req = match ChangeUserRequest::parse(payload(packet), self.capabilities) {
            Ok(req) => req,
            Err(e) => {
                debug!(session_id = self.id, %e, "bad COM_CHANGE_USER");
                self.fail_with(&ER_HANDSHAKE_ERROR, BAD_HANDSHAKE_MESSAGE);
                return;
            },
        };
        let charset = if req.charset != 0 { req.charset as u8 } else { self.login.charset };
        let login = Login {
            user: req.user,
            token: req.auth_token,
            db: req.database,
            plugin: req.auth_plugin,
            charset,
            attrs: if req.attributes.is_empty() { self.login.attrs.clone() } else { req.attributes },
            rdns_done: self.login.rdns_done,
            hostname: self.login.hostname.clone(),
            ..Login::default()
        };
        debug!(session_id = self.id, from = self.login.user.as_str(), to = login.user.as_str(), "COM_CHANGE_USER");
        self.prev_login = Some(mem::replace(&mut self.login, login));
        self.state = ClientState::ChangingUser;
        self.auth_state = AuthState::FindEntry;
        self.advance_auth(ctx);
    }

    fn route(&mut self, ctx: &mut WorkerContext, packet: Bytes) {
        let mut replies = Replies::default();
        let result = match self.router.as_mut() {
            Some(router) => router.route_query(ctx, packet, &mut replies),
            None => Err(Error::closed()),
        };
        self.apply_replies(replies);
        if let Err(e) = result {
            self.router_error(e, true);
        }
    }

    fn apply_replies(&mut self, replies: Replies) {
        self.output.extend(replies.packets);
        for event in replies.events {
            match event {
                ReplyEvent::LoadData => {
                    if self.routing_state == RoutingState::PacketStart {
                        self.routing_state = RoutingState::LoadData;
                    }
                },
                ReplyEvent::Complete { ok } => self.complete_command(ok),
            }
        }
    }

    fn complete_command(&mut self, ok: bool) {
        match self.in_flight.pop_front() {
            Some(Some(change)) => {
                if ok {
                    self.apply_state_change(change);
                }
                if self.routing_state == RoutingState::ChangingState {
                    self.routing_state = RoutingState::PacketStart;
                }
            },
            Some(None) => (),
            None => trace!(session_id = self.id, "reply without a pending command"),
        }
    }

    fn apply_state_change(&mut self, change: StateChange) {
        match change {
            StateChange::Use(db) => {
                debug!(session_id = self.id, db = db.as_str(), "default database changed");
                self.login.db = db;
            },
            StateChange::Role(role) => {
                debug!(session_id = self.id, ?role, "role changed");
                self.role = role;
            },
        }
    }

    /// A query error is answered with an ERR, anything else ends the session.
    /// direct is true for an error routing the command the client just sent.
    fn router_error(&mut self, e: Error, direct: bool) {
        if let Some(qe) = e.as_query_error() {
            debug!(session_id = self.id, code = qe.code, message = qe.message.as_str(), "query error");
            self.send(err_packet(1, qe.code, qe.sql_state, &qe.message));
            if direct {
                if let Some(Some(_)) = self.in_flight.pop_back() {
                    self.routing_state = RoutingState::PacketStart;
                } else if self.routing_state == RoutingState::LargePacket {
                    self.routing_state = RoutingState::PacketStart;
                }
            } else {
                self.complete_command(false);
            }
            return;
        }
        warn!(session_id = self.id, %e, "session failed");
        let seq = if self.in_flight.is_empty() { 0 } else { 1 };
        self.send(error_code_packet(seq, &ER_CONNECTION_KILLED, &format!("Connection killed by SluiceDB: {}", e)));
        self.fail(&e.to_string());
    }

    fn after_event(&mut self, ctx: &mut WorkerContext) {
        if self.state != ClientState::Ready {
            return;
        }
        self.drain_deferred(ctx);
        self.publish_info(ctx);
    }

    /// Keeps the worker's session registry current for KILL.
    fn publish_info(&mut self, ctx: &mut WorkerContext) {
        let router = match self.router.as_ref() {
            Some(router) => router,
            None => return,
        };
        let version = router.connections_version();
        let changed = match &self.published {
            Some((v, user)) => *v != version || *user != self.login.user,
            None => true,
        };
        if changed {
            ctx.sessions.update_info(self.id, &self.login.user, &self.host, router.connections());
            self.published = Some((version, self.login.user.clone()));
        }
    }

    fn record(&mut self, packet: &[u8], command: Option<Command>) {
        let text = match command {
            Some(Command::Query) | Some(Command::StmtPrepare) => match get_sql(packet) {
                Some(sql) => truncate(sql, TRACE_SQL_LEN).to_string(),
                None => command.map(|c| c.to_string()).unwrap_or_default(),
            },
            Some(c) => c.to_string(),
            None => format!("unknown command 0x{:02x}", payload(packet).first().copied().unwrap_or(0)),
        };
        trace!(session_id = self.id, statement = text.as_str(), "client command");
        if self.trace.len() == SESSION_TRACE_STATEMENTS {
            self.trace.pop_front();
        }
        self.trace.push_back((Local::now(), text));
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("select 1", 100), "select 1");
        assert_eq!(truncate("select 1", 6), "select");
        assert_eq!(truncate("sélect", 2), "s");
    }

    #[test]
    fn test_replies_track_completion() {
        let mut replies = Replies::default();
        replies.client_error(&QueryError { code: 1290, sql_state: "HY000", message: "read only".into() });
        assert_eq!(replies.packets.len(), 1);
        assert!(matches!(replies.events[..], [ReplyEvent::Complete { ok: false }]));
        assert_eq!(sequence(&replies.packets[0]), 1);
    }
}
