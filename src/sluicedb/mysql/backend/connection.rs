use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use tokio::sync::mpsc::UnboundedSender;

use crate::sluicedb::{ErrorType, Result};
use crate::sluicedb::mysql::protocol::scramble::Phase2Token;
use crate::sluicedb::router::Server;

/// What a backend connection reports to whoever currently owns it.
#[derive(Debug)]
pub enum BackendEventKind {
    /// Login (or a COM_CHANGE_USER reset) completed. capabilities are the ones
    /// negotiated with the server, they decide the format of its replies.
    Established { thread_id: u32, capabilities: u32 },
    /// One complete packet from the server, header included
    Packet(Bytes),
    Error(ErrorType, String),
    /// The server closed the connection
    Closed,
}

#[derive(Debug)]
pub struct BackendEvent {
    pub conn_id: u64,
    pub kind: BackendEventKind,
}

/// Events of a session's backend connections go to a channel of the session.
pub type EventSink = UnboundedSender<BackendEvent>;

/// The credentials and options a backend connection logs in with, taken from the
/// client's handshake so the servers see the client's own account.
#[derive(Clone, Default)]
pub struct BackendAuth {
    pub user: String,
    /// SHA1(password) recovered from the client's token, None for an empty password
    pub phase2: Option<Phase2Token>,
    pub db: String,
    pub plugin: String,
    pub charset: u8,
    /// Raw connection attributes of the client
    pub attrs: Bytes,
    pub client_caps: u32,
    pub client_ext_caps: u32,
}

impl Debug for BackendAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAuth")
            .field("user", &self.user)
            .field("db", &self.db)
            .field("client_caps", &format_args!("0x{:x}", self.client_caps))
            .finish()
    }
}

/// A connection to a backend server. Implementations run their IO elsewhere
/// and report through the EventSink; every method returns without waiting.
pub trait BackendConnection {
    fn id(&self) -> u64;
    fn server(&self) -> &Arc<Server>;
    /// Queues a client packet for the server. Writes issued during login or a
    /// reset are sent once it completes, in order.
    fn write(&self, packet: Bytes) -> Result<()>;
    /// Resets the server session with COM_CHANGE_USER. Established is reported again when done.
    fn reset(&self, auth: &BackendAuth) -> Result<()>;
    /// Redirects future events, used when the connection moves in or out of a pool.
    fn set_sink(&self, sink: EventSink);
    fn close(&self);
}

impl Debug for dyn BackendConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BackendConnection(id={}, server={})", self.id(), self.server().name())
    }
}

/// Opens backend connections for sessions. Must be called inside the worker's LocalSet.
pub trait Connector {
    fn connect(&self, server: &Arc<Server>, auth: &BackendAuth, conn_id: u64, sink: EventSink) -> Result<Box<dyn BackendConnection>>;
}

/// Runs a single statement on a server over a short lived connection with the
/// service credentials. Used for KILL.
pub trait SideConnector {
    fn execute(&self, server: Arc<Server>, sql: String) -> LocalBoxFuture<'static, Result<()>>;
}
