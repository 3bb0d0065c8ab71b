mod gtid;
mod trx;
mod history;
mod target;
mod selection;
mod pool;
mod endpoint;
mod component;
mod session;

pub use self::gtid::{Gtid, GtidPosition};
pub use self::trx::TrxTracker;
pub use self::history::{History, HistoryEntry};
pub use self::target::*;
pub use self::selection::{Candidate, ReadConstraints, can_serve_reads, select_master, select_reader, ADAPTIVE_DECAY};
pub use self::pool::{ConnectionPools, PooledConn};
pub use self::endpoint::{Endpoint, EndpointState, ReplyTo};
pub use self::component::{RouterSession, Upstream};
pub use self::session::{RWSplitSession, Route, route_for, CAUSAL_READS_SETUP};
