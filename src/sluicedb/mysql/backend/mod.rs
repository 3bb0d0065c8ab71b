mod connection;
mod login;
mod local_client;
mod mariadb;

pub use connection::{BackendConnection, BackendEvent, BackendEventKind, BackendAuth, Connector, SideConnector, EventSink};
pub use login::{PacketStream, LoginOptions, Credentials, login, BACKEND_CAPABILITIES};
pub use local_client::{LocalClient, ResultSet};
pub use mariadb::{MariaDbConnector, MariaDbConnection, MariaDbSideConnector};
