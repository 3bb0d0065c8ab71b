use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use strum::Display;
use tracing::debug;

use crate::sluicedb::{Error, Result};
use crate::sluicedb::mysql::backend::{BackendAuth, BackendConnection};
use crate::sluicedb::mysql::protocol::{Command, Reply, ReplyState, ReplyTracker, HEADER_LEN};
use crate::sluicedb::mysql::protocol::packet::payload;
use crate::sluicedb::router::Server;

#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointState {
    NoConn,
    Connected,
    /// Unusable for the rest of the session
    ConnectedFailed,
    /// The connection went back to the pool while the session was idle
    IdlePooled,
    /// The server is at max_routing_connections, writes are buffered until a slot frees up
    WaitingForConn,
}

/// Who the reply to a command written to an endpoint is for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyTo {
    Client,
    /// Replay of a history entry, checked against its recorded outcome
    History(u32),
    /// A session command sent to every connection. Only the primary's reply reaches the client.
    SessionCommand { id: u32, primary: bool },
    Ignore,
}

/// A command whose reply hasn't completed yet.
pub struct Pending {
    pub to: ReplyTo,
    pub packet: Bytes,
    sent_at: Instant,
}

/// A write held back until the endpoint has a connection.
struct Waiting {
    packet: Bytes,
    to: Option<ReplyTo>,
    /// continuation of the previous packet, written as is
    raw: bool,
}

/// A packet read from an endpoint, after bookkeeping.
pub struct Processed {
    pub to: ReplyTo,
    pub packet: Bytes,
    pub complete: bool,
}

/// The session's handle to one server.
pub struct Endpoint {
    server: Arc<Server>,
    state: EndpointState,
    conn: Option<Box<dyn BackendConnection>>,
    established: bool,
    thread_id: u32,
    capabilities: u32,
    tracker: ReplyTracker,
    started: bool,
    pending: VecDeque<Pending>,
    /// Writes made while waiting for a connection slot
    waiting: Vec<Waiting>,
    waiting_since: u32,
    /// Statement ids the client sees to the ids this server gave out
    ps_map: FnvHashMap<u32, u32>,
    last_used: u64,
    has_slot: bool,
    /// Some packet of the current client reply was already forwarded
    forwarded: bool,
}

impl Endpoint {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            state: EndpointState::NoConn,
            conn: None,
            established: false,
            thread_id: 0,
            capabilities: 0,
            tracker: ReplyTracker::new(0),
            started: false,
            pending: VecDeque::new(),
            waiting: Vec::new(),
            waiting_since: 0,
            ps_map: FnvHashMap::default(),
            last_used: 0,
            has_slot: false,
            forwarded: false,
        }
    }

    pub fn server(&self) -> &Arc<Server> { &self.server }
    pub fn state(&self) -> EndpointState { self.state }
    pub fn thread_id(&self) -> u32 { self.thread_id }
    pub fn is_established(&self) -> bool { self.established }
    pub fn last_used(&self) -> u64 { self.last_used }
    pub fn has_slot(&self) -> bool { self.has_slot }
    pub fn waiting_since(&self) -> u32 { self.waiting_since }
    pub fn has_forwarded(&self) -> bool { self.forwarded }

    pub fn set_last_used(&mut self, n: u64) {
        self.last_used = n;
    }

    pub fn is_connected(&self) -> bool {
        self.state == EndpointState::Connected
    }

    /// Accepts writes: connected, or buffering until it is
    pub fn is_open(&self) -> bool {
        matches!(self.state, EndpointState::Connected | EndpointState::WaitingForConn)
    }

    pub fn can_connect(&self) -> bool {
        matches!(self.state, EndpointState::NoConn | EndpointState::IdlePooled) && self.server.is_connectable()
    }

    pub fn conn_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty() || self.waiting.iter().any(|w| w.to.is_some())
    }

    pub fn pending(&self) -> impl Iterator<Item=&Pending> {
        self.pending.iter()
    }

    pub fn expects(&self, to: ReplyTo) -> bool {
        self.pending.iter().any(|p| p.to == to) || self.waiting.iter().any(|w| w.to == Some(to))
    }

    pub fn expects_client_reply(&self) -> bool {
        self.pending.iter().any(|p| is_for_client(p.to))
            || self.waiting.iter().any(|w| w.to.map(is_for_client).unwrap_or(false))
    }

    /// A replayed prepare hasn't answered yet, its statement id is unknown.
    pub fn has_pending_prepare(&self) -> bool {
        self.pending.iter().map(|p| &p.packet).chain(self.waiting.iter().filter(|w| !w.raw).map(|w| &w.packet))
            .any(|p| payload(p).first() == Some(&(Command::StmtPrepare as u8)))
    }

    /// The server asked for the contents of a LOAD DATA LOCAL INFILE
    pub fn is_loading_data(&self) -> bool {
        self.started && self.tracker.state() == ReplyState::LoadData
    }

    pub fn reply(&self) -> &Reply {
        self.tracker.reply()
    }

    pub fn backend_stmt_id(&self, external: u32) -> Option<u32> {
        self.ps_map.get(&external).cloned()
    }

    pub fn remove_stmt(&mut self, external: u32) {
        self.ps_map.remove(&external);
    }

    /// Starts using a connection. It is established once its Established event arrives.
    pub fn attach(&mut self, conn: Box<dyn BackendConnection>, thread_id: u32, has_slot: bool) {
        debug!(server = self.server.name(), conn_id = conn.id(), "endpoint connected");
        self.conn = Some(conn);
        self.state = EndpointState::Connected;
        self.established = false;
        self.thread_id = thread_id;
        self.has_slot = has_slot;
        self.started = false;
        self.forwarded = false;
        self.ps_map.clear();
    }

    pub fn set_established(&mut self, thread_id: u32, capabilities: u32) {
        self.established = true;
        if thread_id != 0 {
            self.thread_id = thread_id;
        }
        self.capabilities = capabilities;
        self.tracker.set_capabilities(capabilities);
    }

    pub fn set_waiting(&mut self, now: u32) {
        if self.state != EndpointState::WaitingForConn {
            self.state = EndpointState::WaitingForConn;
            self.waiting_since = now;
        }
    }

    /// A COM_CHANGE_USER reset is on the way, statement ids are forgotten.
    pub fn begin_reset(&mut self) {
        self.established = false;
        self.ps_map.clear();
    }

    pub fn reset_conn(&self, auth: &BackendAuth) -> Result<()> {
        match &self.conn {
            Some(c) => c.reset(auth),
            None => Ok(()),
        }
    }

    /// Sends the writes buffered while waiting for a connection.
    pub fn flush_waiting(&mut self) -> Result<()> {
        for w in std::mem::take(&mut self.waiting) {
            if w.raw {
                self.write_raw(w.packet)?;
            } else {
                self.write(w.packet, w.to)?;
            }
        }
        Ok(())
    }

    /// Writes a command. to is None for packets the server doesn't answer.
    pub fn write(&mut self, packet: Bytes, to: Option<ReplyTo>) -> Result<()> {
        if self.state == EndpointState::WaitingForConn {
            self.waiting.push(Waiting { packet, to, raw: false });
            return Ok(());
        }
        let conn = match (&self.conn, self.state) {
            (Some(conn), EndpointState::Connected) => conn,
            _ => return Err(Error::new(format!("endpoint {} is not connected ({})", self.server.name(), self.state))),
        };
        let packet = self.map_stmt_id(packet);
        conn.write(packet.clone())?;
        if let Some(to) = to {
            self.server.stats.current_operations.fetch_add(1, Relaxed);
            self.pending.push_back(Pending { to, packet, sent_at: Instant::now() });
        }
        Ok(())
    }

    /// Writes a packet that is part of the command in flight: large payload continuations and LOAD DATA contents.
    pub fn write_raw(&mut self, packet: Bytes) -> Result<()> {
        if self.state == EndpointState::WaitingForConn {
            self.waiting.push(Waiting { packet, to: None, raw: true });
            return Ok(());
        }
        match &self.conn {
            Some(conn) => conn.write(packet),
            None => Err(Error::closed()),
        }
    }

    fn map_stmt_id(&self, packet: Bytes) -> Bytes {
        let data = payload(&packet);
        let has_id = data.first().and_then(|b| Command::from_u8(*b)).map(|c| c.has_statement_id()).unwrap_or(false);
        if !has_id || data.len() < 5 {
            return packet;
        }
        let external = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        // u32::MAX refers to the last prepared statement, the server resolves it
        if external == u32::MAX {
            return packet;
        }
        match self.ps_map.get(&external) {
            Some(&internal) if internal != external => {
                let mut buf = BytesMut::from(&packet[..]);
                buf[HEADER_LEN + 1..HEADER_LEN + 5].copy_from_slice(&internal.to_le_bytes());
                buf.freeze()
            },
            _ => packet,
        }
    }

    /// Processes a packet from the server. The prepare response of a session
    /// command has its statement id replaced with the one the client sees.
    pub fn on_packet(&mut self, packet: Bytes) -> Result<Processed> {
        let front = match self.pending.front() {
            Some(p) => p,
            None => return Err(Error::protocol_error(format!("unexpected packet from {}", self.server.name()))),
        };
        let to = front.to;
        if !self.started {
            self.tracker.start(&front.packet);
            self.started = true;
        }
        let first_packet = self.tracker.reply().size() == 0;
        self.tracker.process(&packet)?;
        let mut packet = packet;

        let reply = self.tracker.reply();
        if first_packet && Command::from_u8(reply.command()) == Some(Command::StmtPrepare) && reply.generated_id() != 0 {
            let external = match to {
                ReplyTo::History(id) | ReplyTo::SessionCommand { id, .. } => Some(id),
                _ => None,
            };
            if let Some(external) = external {
                self.ps_map.insert(external, reply.generated_id());
                if matches!(to, ReplyTo::SessionCommand { primary: true, .. }) {
                    let mut buf = BytesMut::from(&packet[..]);
                    buf[HEADER_LEN + 1..HEADER_LEN + 5].copy_from_slice(&external.to_le_bytes());
                    packet = buf.freeze();
                }
            }
        }
        if is_for_client(to) {
            self.forwarded = true;
        }

        let complete = self.tracker.is_complete();
        if complete {
            if let Some(p) = self.pending.pop_front() {
                self.server.add_response_time(p.sent_at.elapsed().as_secs_f64());
            }
            self.server.stats.current_operations.fetch_sub(1, Relaxed);
            self.started = false;
            self.forwarded = false;
        }
        Ok(Processed { to, packet, complete })
    }

    /// Flags a secondary's pending session command as the one the client waits for.
    /// Fails if the reply is already partly read, the client would miss its start.
    pub fn promote(&mut self, id: u32) -> bool {
        let started = self.started;
        for (n, p) in self.pending.iter_mut().enumerate() {
            if p.to == (ReplyTo::SessionCommand { id, primary: false }) {
                if n == 0 && started {
                    return false;
                }
                p.to = ReplyTo::SessionCommand { id, primary: true };
                return true;
            }
        }
        false
    }

    /// Gives up the connection. Returns it with the commands still waiting for a reply.
    pub fn detach(&mut self, state: EndpointState) -> (Option<Box<dyn BackendConnection>>, Vec<Pending>) {
        let n = self.pending.len() as u32;
        if n > 0 {
            let _ = self.server.stats.current_operations.fetch_update(Relaxed, Relaxed, |v| Some(v.saturating_sub(n)));
        }
        let pending: Vec<Pending> = self.pending.drain(..).collect();
        let mut pending = pending;
        for w in self.waiting.drain(..) {
            if let Some(to) = w.to {
                pending.push(Pending { to, packet: w.packet, sent_at: Instant::now() });
            }
        }
        self.state = state;
        self.established = false;
        self.started = false;
        self.forwarded = false;
        self.has_slot = false;
        self.ps_map.clear();
        (self.conn.take(), pending)
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }
}

pub fn is_for_client(to: ReplyTo) -> bool {
    matches!(to, ReplyTo::Client | ReplyTo::SessionCommand { primary: true, .. })
}
