use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::sluicedb::config::UsersConfig;
use crate::sluicedb::mysql::protocol::scramble::NATIVE_PASSWORD_PLUGIN;
use crate::sluicedb::users::database::{UserDatabase, FindEntry};
use crate::sluicedb::users::entry::{UserEntry, UserEntryResult, UserEntryType};
use crate::sluicedb::users::manager::UserManager;

/// A worker's view of the user accounts. Holds on to a snapshot and only
/// swaps it when the manager's version moved on.
pub struct UserCache {
    manager: Arc<UserManager>,
    userdb: Arc<UserDatabase>,
    version: u64,
}

impl UserCache {
    pub fn new(manager: Arc<UserManager>) -> Self {
        let version = manager.version();
        let userdb = manager.user_database();
        Self { manager, userdb, version }
    }

    /// Pulls the latest snapshot if it's newer than ours.
    pub fn update_from_master(&mut self) {
        let version = self.manager.version();
        if version != self.version {
            // Load the snapshot after reading the version, at worst we get a newer snapshot
            // with an older version and pull it again next time
            self.userdb = self.manager.user_database();
            self.version = version;
            debug!(version, "worker user cache refreshed");
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn can_update_immediately(&self) -> bool {
        self.manager.can_update_immediately()
    }

    pub fn request_update(&self) {
        self.manager.update_user_accounts();
    }

    pub fn user_database(&self) -> &UserDatabase {
        &self.userdb
    }

    /// Finds the account a client authenticates as and checks it may connect
    /// with the requested default database.
    pub fn find_user(&mut self, user: &str, addr: &IpAddr, hostname: Option<&str>, db: &str, settings: &UsersConfig) -> UserEntryResult {
        self.update_from_master();
        let userdb = &self.userdb;
        let entry = match userdb.find_entry(user, addr, hostname, settings) {
            FindEntry::Found(e) => e,
            FindEntry::NeedNameInfo => {
                return UserEntryResult { entry: UserEntry::default(), result: UserEntryType::NeedNameInfo };
            },
            FindEntry::NotFound => {
                return UserEntryResult { entry: UserEntry::dummy(user), result: UserEntryType::UserNotFound };
            },
        };

        let result = if entry.username == "root" && !settings.enable_root_user {
            UserEntryType::RootAccessDenied
        } else if entry.is_anonymous() && entry.proxy_priv {
            // An anonymous user with a proxy grant would map to another account on the server
            UserEntryType::AnonProxyAccessDenied
        } else if entry.auth_plugin() != NATIVE_PASSWORD_PLUGIN {
            UserEntryType::PluginNotLoaded
        } else if !db.is_empty() && !userdb.database_exists(db, settings.lower_case_table_names) {
            UserEntryType::BadDb
        } else if !userdb.check_database_access(entry, db, settings.lower_case_table_names) {
            UserEntryType::DbAccessDenied
        } else {
            UserEntryType::Ok
        };
        UserEntryResult { entry: entry.clone(), result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sluicedb::Result;
    use crate::sluicedb::users::loader::UserLoader;
    use std::sync::Mutex;

    struct FixedLoader(Mutex<UserDatabase>);

    impl UserLoader for FixedLoader {
        fn load(&self) -> Result<UserDatabase> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn cache(db: UserDatabase) -> (UserCache, Arc<UserManager>) {
        let manager = Arc::new(UserManager::new(UsersConfig::default(), Box::new(FixedLoader(Mutex::new(db)))));
        manager.run_update().unwrap();
        (UserCache::new(manager.clone()), manager)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_find_user_results() {
        let mut db = UserDatabase::new();
        db.add_entry(UserEntry::new("alice", "%", ""));
        db.add_entry(UserEntry::new("root", "%", ""));
        let mut anon = UserEntry::new("", "10.%", "");
        anon.proxy_priv = true;
        db.add_entry(anon);
        let mut pam = UserEntry::new("pam_user", "%", "");
        pam.plugin = "pam".to_string();
        db.add_entry(pam);
        db.add_database_name("shop");
        db.add_database_name("hr");
        db.add_db_grant("alice", "%", "shop");
        let (mut cache, _m) = cache(db);
        let s = UsersConfig::default();
        let addr = ip("192.168.0.10");

        assert_eq!(cache.find_user("alice", &addr, None, "", &s).result, UserEntryType::Ok);
        assert_eq!(cache.find_user("alice", &addr, None, "shop", &s).result, UserEntryType::Ok);
        assert_eq!(cache.find_user("alice", &addr, None, "hr", &s).result, UserEntryType::DbAccessDenied);
        assert_eq!(cache.find_user("alice", &addr, None, "nope", &s).result, UserEntryType::BadDb);
        assert_eq!(cache.find_user("root", &addr, None, "", &s).result, UserEntryType::RootAccessDenied);
        assert_eq!(cache.find_user("pam_user", &addr, None, "", &s).result, UserEntryType::PluginNotLoaded);
        assert_eq!(cache.find_user("zed", &ip("10.1.1.1"), None, "", &s).result, UserEntryType::AnonProxyAccessDenied);

        let missing = cache.find_user("zed", &addr, None, "", &s);
        assert_eq!(missing.result, UserEntryType::UserNotFound);
        assert_eq!(missing.entry, UserEntry::dummy("zed"));

        let mut root_ok = UsersConfig::default();
        root_ok.enable_root_user = true;
        assert_eq!(cache.find_user("root", &addr, None, "", &root_ok).result, UserEntryType::Ok);
    }

    #[test]
    fn test_cache_follows_manager_version() {
        let mut db = UserDatabase::new();
        db.add_entry(UserEntry::new("alice", "%", ""));
        let (mut cache, manager) = cache(db.clone());
        assert_eq!(cache.version(), 1);
        let s = UsersConfig::default();
        assert_eq!(cache.find_user("bob", &ip("10.0.0.1"), None, "", &s).result, UserEntryType::UserNotFound);

        db.add_entry(UserEntry::new("bob", "%", ""));
        assert!(manager.apply_loaded(db));
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.find_user("bob", &ip("10.0.0.1"), None, "", &s).result, UserEntryType::Ok);
        assert_eq!(cache.version(), 2);
    }
}
