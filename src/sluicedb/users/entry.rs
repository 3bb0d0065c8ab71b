use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::sluicedb::mysql::protocol::scramble::{NATIVE_PASSWORD_PLUGIN, password_hash};
use crate::sluicedb::users::host_pattern::first_wildcard;

/// One row of mysql.user, a (username, host pattern) pair.
#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct UserEntry {
    #[serde(rename = "user")]
    pub username: String,
    #[serde(rename = "host")]
    pub host_pattern: String,
    #[serde(default)]
    pub plugin: String,
    /// "*HEX" double SHA1 of the password, or empty for no password
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "authentication_string")]
    pub auth_string: String,
    #[serde(default)]
    pub ssl: bool,
    /// SELECT on *.*, can use any database
    #[serde(default, rename = "global_priv")]
    pub global_db_priv: bool,
    #[serde(default)]
    pub proxy_priv: bool,
    #[serde(default)]
    pub super_priv: bool,
    #[serde(default)]
    pub is_role: bool,
    #[serde(default)]
    pub default_role: String,
}

impl UserEntry {
    pub fn new(username: &str, host_pattern: &str, password_hash: &str) -> Self {
        Self {
            username: username.to_string(),
            host_pattern: host_pattern.to_string(),
            password: password_hash.to_string(),
            ..Default::default()
        }
    }

    /// The plugin, empty means mysql_native_password on older servers
    pub fn auth_plugin(&self) -> &str {
        if self.plugin.is_empty() { NATIVE_PASSWORD_PLUGIN } else { &self.plugin }
    }

    /// The stored password hash. Newer servers keep it in authentication_string.
    pub fn password_hash(&self) -> &str {
        if self.password.is_empty() && self.plugin == NATIVE_PASSWORD_PLUGIN {
            &self.auth_string
        } else {
            &self.password
        }
    }

    /// A stand-in for a user that doesn't exist. Authentication proceeds against it exactly
    /// like against a real entry and then fails at the token check, so a client can't tell
    /// missing users from wrong passwords. The hash depends only on the user name.
    pub fn dummy(username: &str) -> Self {
        let mut secret = String::with_capacity(username.len() + 16);
        secret.push_str("sluicedb-nonexistent:");
        secret.push_str(username);
        let mut e = UserEntry::new(username, "%", &password_hash(&secret));
        e.plugin = NATIVE_PASSWORD_PLUGIN.to_string();
        e
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }

    /// "'user'@'host'" as the server writes it in messages
    pub fn display_name(&self) -> String {
        format!("'{}'@'{}'", self.username, self.host_pattern)
    }
}

/// Orders host patterns most specific first: patterns without wildcards come first,
/// then patterns whose first wildcard appears later.
pub fn host_pattern_order(lhs: &str, rhs: &str) -> Ordering {
    let lw = first_wildcard(lhs);
    let rw = first_wildcard(rhs);
    match (lw, rw) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(l), Some(r)) if l != r => r.cmp(&l),
        _ => lhs.cmp(rhs),
    }
}

/// The outcome of a user lookup.
#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum UserEntryType {
    Ok,
    UserNotFound,
    BadDb,
    DbAccessDenied,
    RootAccessDenied,
    AnonProxyAccessDenied,
    PluginNotLoaded,
    /// A host name pattern needs the client's host name, do a reverse lookup and search again
    NeedNameInfo,
}

#[derive(Debug, Clone)]
pub struct UserEntryResult {
    pub entry: UserEntry,
    pub result: UserEntryType,
}
