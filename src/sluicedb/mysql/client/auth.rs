use crate::sluicedb::mysql::protocol::ErrorCode;
use crate::sluicedb::mysql::protocol::error_codes::*;
use crate::sluicedb::mysql::protocol::scramble::{check_token, parse_password_hash, Phase2Token, Scramble, SCRAMBLE_LEN};
use crate::sluicedb::users::UserEntryType;

/// Checks a mysql_native_password token against the stored hash of an account.
/// Returns None if it doesn't match, otherwise the phase 2 token the backends are
/// logged in with (None for an account without a password).
pub fn check_native_token(scramble: &Scramble, token: &[u8], stored_hash: &str) -> Option<Option<Phase2Token>> {
    match parse_password_hash(stored_hash) {
        None => {
            if token.is_empty() {
                Some(None)
            } else {
                None
            }
        },
        Some(Ok(stored)) => {
            if token.len() != SCRAMBLE_LEN {
                return None;
            }
            check_token(scramble, token, &stored).map(Some)
        },
        Some(Err(())) => None,
    }
}

/// Why authentication failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthFailure {
    /// The account lookup rejected the client
    Entry(UserEntryType),
    WrongPassword,
}

impl AuthFailure {
    /// Failures a reload of the user accounts could fix, the account may be new.
    pub fn is_retryable(&self) -> bool {
        matches!(self,
            AuthFailure::WrongPassword
            | AuthFailure::Entry(UserEntryType::UserNotFound)
            | AuthFailure::Entry(UserEntryType::BadDb)
            | AuthFailure::Entry(UserEntryType::DbAccessDenied))
    }

    /// The error the client gets, with the server's wording.
    pub fn error(&self, user: &str, host: &str, db: &str, plugin: &str, using_password: bool) -> (ErrorCode, String) {
        match self {
            AuthFailure::Entry(UserEntryType::BadDb) => (ER_BAD_DB_ERROR, bad_db_message(db)),
            AuthFailure::Entry(UserEntryType::DbAccessDenied) => (ER_DBACCESS_DENIED_ERROR, db_access_denied_message(user, host, db)),
            AuthFailure::Entry(UserEntryType::PluginNotLoaded) => (ER_PLUGIN_IS_NOT_LOADED, plugin_not_loaded_message(plugin)),
            _ => (ER_ACCESS_DENIED_ERROR, access_denied_message(user, host, using_password)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sluicedb::mysql::protocol::scramble::{generate_scramble, password_hash, scramble_password, sha1};

    #[test]
    fn test_native_token() {
        let scramble = generate_scramble();
        let stored = password_hash("secret");
        let token = scramble_password(&scramble, "secret");
        let phase2 = check_native_token(&scramble, &token, &stored).expect("token matches");
        assert_eq!(phase2, Some(sha1(&[b"secret"])));

        let wrong = scramble_password(&scramble, "Secret");
        assert!(check_native_token(&scramble, &wrong, &stored).is_none());
        assert!(check_native_token(&scramble, &[], &stored).is_none());
        assert!(check_native_token(&scramble, &token[..10], &stored).is_none());
    }

    #[test]
    fn test_empty_password() {
        let scramble = generate_scramble();
        assert_eq!(check_native_token(&scramble, &[], ""), Some(None));
        let token = scramble_password(&scramble, "x");
        assert!(check_native_token(&scramble, &token, "").is_none());
        assert!(check_native_token(&scramble, &token, "*not-hex").is_none());
    }

    #[test]
    fn test_failure_errors() {
        let (ec, msg) = AuthFailure::WrongPassword.error("bob", "10.0.0.1", "", "", true);
        assert_eq!(ec.code, 1045);
        assert_eq!(msg, "Access denied for user 'bob'@'10.0.0.1' (using password: YES)");
        let (ec, _) = AuthFailure::Entry(UserEntryType::BadDb).error("bob", "h", "shop", "", true);
        assert_eq!(ec.code, 1049);
        let (ec, _) = AuthFailure::Entry(UserEntryType::DbAccessDenied).error("bob", "h", "shop", "", true);
        assert_eq!(ec.code, 1044);
        let (ec, _) = AuthFailure::Entry(UserEntryType::PluginNotLoaded).error("bob", "h", "", "pam", true);
        assert_eq!(ec.code, 1524);
        let (ec, _) = AuthFailure::Entry(UserEntryType::RootAccessDenied).error("root", "h", "", "", false);
        assert_eq!(ec.code, 1045);

        assert!(AuthFailure::WrongPassword.is_retryable());
        assert!(AuthFailure::Entry(UserEntryType::BadDb).is_retryable());
        assert!(!AuthFailure::Entry(UserEntryType::RootAccessDenied).is_retryable());
        assert!(!AuthFailure::Entry(UserEntryType::AnonProxyAccessDenied).is_retryable());
    }
}
