mod listener;
mod tls;
mod session;

pub use self::listener::Listener;
pub use self::tls::{load_tls_config, TlsSession};
pub use self::session::{run_client_session, reject_connection};
