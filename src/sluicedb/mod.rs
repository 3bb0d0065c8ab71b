pub mod config;
pub mod common;
pub mod mysql;
pub mod users;
pub mod router;
pub mod server;
pub mod worker;
pub mod monitor;

pub use common::{Error, ErrorKind, ErrorType, QueryError, Result, coarse_monotonic_now};
