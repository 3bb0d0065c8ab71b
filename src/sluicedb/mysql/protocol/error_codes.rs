//! Server error codes and SQLSTATEs the proxy generates itself.
//! Messages mirror the server's wording since client libraries match on them.

pub struct ErrorCode {
    pub code: u16,
    pub sql_state: &'static str,
}

const fn code(code: u16, sql_state: &'static str) -> ErrorCode {
    ErrorCode { code, sql_state }
}

pub const ER_CON_COUNT_ERROR: ErrorCode = code(1040, "08004");
pub const ER_HANDSHAKE_ERROR: ErrorCode = code(1043, "08S01");
pub const ER_DBACCESS_DENIED_ERROR: ErrorCode = code(1044, "42000");
pub const ER_ACCESS_DENIED_ERROR: ErrorCode = code(1045, "28000");
pub const ER_BAD_DB_ERROR: ErrorCode = code(1049, "42000");
pub const ER_UNKNOWN_PROCEDURE: ErrorCode = code(1106, "42000");
pub const ER_NO_SUCH_THREAD: ErrorCode = code(1094, "HY000");
pub const ER_UNKNOWN_ERROR: ErrorCode = code(1105, "HY000");
pub const ER_NET_PACKETS_OUT_OF_ORDER: ErrorCode = code(1156, "08S01");
pub const ER_NET_PACKET_TOO_LARGE: ErrorCode = code(1153, "08S01");
pub const ER_OPTION_PREVENTS_STATEMENT: ErrorCode = code(1290, "HY000");
pub const ER_PLUGIN_IS_NOT_LOADED: ErrorCode = code(1524, "HY000");
pub const ER_CONNECTION_KILLED: ErrorCode = code(1927, "70100");
pub const ER_UNKNOWN_STMT_HANDLER: ErrorCode = code(1243, "HY000");

pub fn access_denied_message(user: &str, host: &str, using_password: bool) -> String {
    format!("Access denied for user '{}'@'{}' (using password: {})",
            user, host, if using_password { "YES" } else { "NO" })
}

pub fn db_access_denied_message(user: &str, host: &str, db: &str) -> String {
    format!("Access denied for user '{}'@'{}' to database '{}'", user, host, db)
}

pub fn bad_db_message(db: &str) -> String {
    format!("Unknown database '{}'", db)
}

pub fn plugin_not_loaded_message(plugin: &str) -> String {
    format!("Plugin '{}' is not loaded", plugin)
}

pub fn no_such_thread_message(id: u64) -> String {
    format!("Unknown thread id: {}", id)
}

pub const READ_ONLY_MESSAGE: &str = "The MariaDB server is running with the --read-only option so it cannot execute this statement";
pub const SSL_REQUIRED_MESSAGE: &str = "Access without SSL denied";
pub const OUT_OF_ORDER_MESSAGE: &str = "Got packets out of order";
pub const BAD_HANDSHAKE_MESSAGE: &str = "Bad handshake";
pub const TOO_MANY_CONNECTIONS_MESSAGE: &str = "Too many connections";
