use std::sync::Arc;

use bytes::Bytes;

use crate::sluicedb::{QueryError, Result};
use crate::sluicedb::mysql::backend::{BackendAuth, BackendEvent};
use crate::sluicedb::mysql::protocol::Reply;
use crate::sluicedb::router::Server;
use crate::sluicedb::worker::WorkerContext;

/// Whatever sits above a router session and receives the replies, normally the client connection.
pub trait Upstream {
    /// A packet of the reply to the client's current command. reply describes the
    /// reply so far, it is complete with the last packet.
    fn client_reply(&mut self, packet: Bytes, reply: &Reply);

    /// A queued command failed before reaching a server. The client gets an ERR in its place.
    fn client_error(&mut self, err: &QueryError);
}

/// The routing half of a client session.
///
/// Errors are either query errors (Error::as_query_error), which are sent to the
/// client as an ERR packet while the session carries on, or fatal, in which case
/// the caller closes the session and the router is not called again except for close.
pub trait RouterSession {
    /// Routes one packet from the client. Continuation packets of a large payload and
    /// LOAD DATA contents follow the packet they belong to.
    fn route_query(&mut self, ctx: &mut WorkerContext, packet: Bytes, up: &mut dyn Upstream) -> Result<()>;

    /// Handles an event of one of the session's backend connections.
    fn backend_event(&mut self, ctx: &mut WorkerContext, event: BackendEvent, up: &mut dyn Upstream) -> Result<()>;

    /// A connection slot was released on a server the session waits for.
    fn wakeup(&mut self, ctx: &mut WorkerContext, up: &mut dyn Upstream) -> Result<()>;

    /// Called periodically with the coarse clock, for timeouts and idle pooling.
    fn tick(&mut self, ctx: &mut WorkerContext, now: u32, up: &mut dyn Upstream) -> Result<()>;

    /// The client changed user, the client side already verified the new credentials.
    fn change_user(&mut self, ctx: &mut WorkerContext, auth: BackendAuth) -> Result<()>;

    /// (server, thread id) of every established backend connection, for KILL
    fn connections(&self) -> Vec<(Arc<Server>, u32)>;

    /// Bumped whenever connections() changes
    fn connections_version(&self) -> u64;

    fn close(&mut self, ctx: &mut WorkerContext);
}
