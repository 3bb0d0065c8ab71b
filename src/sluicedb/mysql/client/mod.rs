mod client_state;
mod auth;
mod kill;
mod connection;

pub use self::client_state::{ClientState, AuthState, RoutingState};
pub use self::auth::{check_native_token, AuthFailure};
pub use self::kill::{execute_kill, kill_statements};
pub use self::connection::{ClientConnection, Action};
