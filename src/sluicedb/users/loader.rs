use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn, debug};

use crate::sluicedb::{Error, Result};
use crate::sluicedb::mysql::backend::LocalClient;
use crate::sluicedb::router::Server;
use crate::sluicedb::users::database::UserDatabase;
use crate::sluicedb::users::entry::UserEntry;

/// A source of user accounts. Called on the updater thread, so it may block.
pub trait UserLoader: Send + Sync {
    fn load(&self) -> Result<UserDatabase>;
}

const USERS_QUERY: &str = "SELECT u.user, u.host, u.password, u.plugin, u.authentication_string, \
    u.is_role, u.default_role, u.select_priv, u.ssl_type, u.super_priv, \
    EXISTS(SELECT 1 FROM mysql.proxies_priv p WHERE p.user = u.user AND p.host = u.host) AS proxy_priv \
    FROM mysql.user u";

const DB_GRANTS_QUERY: &str = "SELECT user, host, db FROM mysql.db \
    UNION SELECT user, host, db FROM mysql.tables_priv \
    UNION SELECT user, host, db FROM mysql.columns_priv \
    UNION SELECT user, host, db FROM mysql.procs_priv";

const ROLES_QUERY: &str = "SELECT user, host, role FROM mysql.roles_mapping";

const DATABASES_QUERY: &str = "SHOW DATABASES";

/// Loads accounts from the servers of the service with SQL queries. The master is
/// asked first. With users_from_all every running server is queried and the results merged.
pub struct SqlUserLoader {
    servers: Vec<Arc<Server>>,
    user: String,
    password: String,
    users_from_all: bool,
}

impl SqlUserLoader {
    pub fn new(servers: Vec<Arc<Server>>, user: String, password: String, users_from_all: bool) -> Self {
        Self { servers, user, password, users_from_all }
    }

    async fn load_from(&self, server: &Server) -> Result<UserDatabase> {
        let mut client = LocalClient::connect(server.address(), &self.user, &self.password, "").await?;
        let mut db = UserDatabase::new();

        let users = client.query(USERS_QUERY).await?;
        for row in users.rows() {
            db.add_entry(user_entry_from_row(row));
        }
        let grants = client.query(DB_GRANTS_QUERY).await?;
        for row in grants.rows() {
            db.add_db_grant(col(row, 0), col(row, 1), col(row, 2));
        }
        let roles = client.query(ROLES_QUERY).await?;
        for row in roles.rows() {
            db.add_role_mapping(col(row, 0), col(row, 1), col(row, 2));
        }
        let databases = client.query(DATABASES_QUERY).await?;
        for row in databases.rows() {
            db.add_database_name(col(row, 0));
        }
        client.close().await;
        Ok(db)
    }

    async fn load_async(&self) -> Result<UserDatabase> {
        // Masters first, then anything that's running
        let mut servers: Vec<&Arc<Server>> = self.servers.iter().filter(|s| s.is_running()).collect();
        servers.sort_by_key(|s| !s.is_master());
        if servers.is_empty() {
            return Err(Error::new("no running servers to load users from"));
        }

        let mut result: Option<UserDatabase> = None;
        let mut last_error = None;
        for server in servers {
            match self.load_from(server).await {
                Ok(db) => {
                    debug!(server = server.name(), users = db.n_entries(), "loaded user accounts");
                    match result.as_mut() {
                        Some(merged) => merged.merge(db),
                        None => result = Some(db),
                    }
                    if !self.users_from_all {
                        break;
                    }
                },
                Err(e) => {
                    warn!(server = server.name(), %e, "failed to load user accounts");
                    last_error = Some(e);
                },
            }
        }
        match (result, last_error) {
            (Some(db), _) => Ok(db),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::new("no user accounts loaded")),
        }
    }
}

impl UserLoader for SqlUserLoader {
    fn load(&self) -> Result<UserDatabase> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.load_async())
    }
}

fn col<'a>(row: &'a [Option<String>], i: usize) -> &'a str {
    row.get(i).and_then(|c| c.as_deref()).unwrap_or("")
}

fn flag(row: &[Option<String>], i: usize) -> bool {
    matches!(col(row, i), "Y" | "y" | "1")
}

fn user_entry_from_row(row: &[Option<String>]) -> UserEntry {
    UserEntry {
        username: col(row, 0).to_string(),
        host_pattern: col(row, 1).to_string(),
        password: col(row, 2).to_string(),
        plugin: col(row, 3).to_string(),
        auth_string: col(row, 4).to_string(),
        is_role: flag(row, 5),
        default_role: col(row, 6).to_string(),
        global_db_priv: flag(row, 7),
        ssl: !col(row, 8).is_empty(),
        super_priv: flag(row, 9),
        proxy_priv: flag(row, 10),
    }
}

#[derive(Deserialize)]
struct DbGrantRow {
    user: String,
    host: String,
    db: String,
}

#[derive(Deserialize)]
struct RoleRow {
    user: String,
    host: String,
    role: String,
}

#[derive(Deserialize)]
struct UsersFile {
    #[serde(default)]
    user: Vec<UserEntry>,
    #[serde(default)]
    db: Vec<DbGrantRow>,
    #[serde(default)]
    roles_mapping: Vec<RoleRow>,
    #[serde(default)]
    database_names: Vec<String>,
}

/// Parses the JSON users file format:
/// {"user": [...], "db": [...], "roles_mapping": [...], "database_names": [...]}
pub fn parse_users_json(text: &str) -> Result<UserDatabase> {
    let file: UsersFile = serde_json::from_str(text)?;
    let mut db = UserDatabase::new();
    for entry in file.user {
        db.add_entry(entry);
    }
    for grant in file.db {
        db.add_db_grant(&grant.user, &grant.host, &grant.db);
    }
    for role in file.roles_mapping {
        db.add_role_mapping(&role.user, &role.host, &role.role);
    }
    for name in file.database_names {
        db.add_database_name(&name);
    }
    Ok(db)
}

/// Loads accounts from a JSON file.
pub struct FileUserLoader {
    path: PathBuf,
}

impl FileUserLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl UserLoader for FileUserLoader {
    fn load(&self) -> Result<UserDatabase> {
        let text = std::fs::read_to_string(&self.path)?;
        let db = parse_users_json(&text)?;
        info!(path = %self.path.to_string_lossy(), users = db.n_entries(), "read user accounts file");
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_users_json() {
        let text = r#"{
            "user": [
                {"user": "alice", "host": "%", "password": "*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19", "global_priv": true},
                {"user": "bob", "host": "10.0.0.0/24", "plugin": "mysql_native_password", "default_role": "r1"}
            ],
            "db": [{"user": "bob", "host": "10.0.0.0/24", "db": "shop"}],
            "roles_mapping": [{"user": "bob", "host": "10.0.0.0/24", "role": "r1"}],
            "database_names": ["shop", "mysql"]
        }"#;
        let db = parse_users_json(text).unwrap();
        assert_eq!(db.n_entries(), 2);
        assert!(db.database_exists("shop", 0));
        let bob = db.entries().find(|e| e.username == "bob").unwrap().clone();
        assert_eq!(bob.default_role, "r1");
        assert!(db.check_database_access(&bob, "shop", 0));
        assert!(!db.check_database_access(&bob, "mysql", 0));
        assert!(db.user_can_set_role(&bob, "r1"));
    }

    #[test]
    fn test_parse_users_json_rejects_garbage() {
        assert!(parse_users_json("{\"user\": 5}").is_err());
    }

    #[test]
    fn test_user_entry_from_row() {
        let row: Vec<Option<String>> = ["app", "%", "", "mysql_native_password", "*ABC", "N", "", "Y", "ANY", "N", "1"]
            .iter()
            .map(|s| Some(s.to_string()))
            .collect();
        let e = user_entry_from_row(&row);
        assert_eq!(e.username, "app");
        assert!(e.global_db_priv);
        assert!(e.ssl);
        assert!(e.proxy_priv);
        assert!(!e.is_role);
        assert_eq!(e.password_hash(), "*ABC");
    }
}
