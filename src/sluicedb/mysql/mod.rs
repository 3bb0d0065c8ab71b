pub mod protocol;
pub mod sql;
pub mod backend;
pub mod client;
