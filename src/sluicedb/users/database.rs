use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;

use crate::sluicedb::config::UsersConfig;
use crate::sluicedb::users::entry::{UserEntry, host_pattern_order};
use crate::sluicedb::users::host_pattern::{
    pattern_type, address_matches, hostname_matches, is_loopback, like_match, first_wildcard, PatternType};

/// The result of searching the entries for a (user, client) pair.
#[derive(Debug, Eq, PartialEq)]
pub enum FindEntry<'a> {
    Found(&'a UserEntry),
    /// No address pattern matched, but a host name pattern might once the client's name is known
    NeedNameInfo,
    NotFound,
}

/// An immutable snapshot of the user accounts, grants and roles of the cluster.
/// Snapshots are compared by value to decide whether a reload changed anything.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct UserDatabase {
    /// username -> entries, most specific host pattern first
    users: BTreeMap<String, Vec<UserEntry>>,
    /// "user@host" -> databases granted by name
    db_grants: BTreeMap<String, BTreeSet<String>>,
    /// "user@host" -> database patterns with wildcards
    db_wc_grants: BTreeMap<String, BTreeSet<String>>,
    /// "user@host" -> roles the user may set
    roles_mapping: BTreeMap<String, BTreeSet<String>>,
    database_names: BTreeSet<String>,
}

fn grant_key(user: &str, host: &str) -> String {
    let mut key = String::with_capacity(user.len() + host.len() + 1);
    key.push_str(user);
    key.push('@');
    key.push_str(host);
    key
}

impl UserDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, keeping the bucket sorted. A duplicate (user, host) replaces the old entry.
    pub fn add_entry(&mut self, entry: UserEntry) {
        let bucket = self.users.entry(entry.username.clone()).or_default();
        if let Some(existing) = bucket.iter_mut().find(|e| e.host_pattern == entry.host_pattern) {
            *existing = entry;
            return;
        }
        let pos = bucket.iter()
            .position(|e| host_pattern_order(&entry.host_pattern, &e.host_pattern).is_lt())
            .unwrap_or(bucket.len());
        bucket.insert(pos, entry);
    }

    pub fn add_db_grant(&mut self, user: &str, host: &str, db: &str) {
        let key = grant_key(user, host);
        if first_wildcard(db).is_some() {
            self.db_wc_grants.entry(key).or_default().insert(db.to_string());
        } else {
            self.db_grants.entry(key).or_default().insert(db.to_string());
        }
    }

    pub fn add_role_mapping(&mut self, user: &str, host: &str, role: &str) {
        self.roles_mapping.entry(grant_key(user, host)).or_default().insert(role.to_string());
    }

    pub fn add_database_name(&mut self, db: &str) {
        self.database_names.insert(db.to_string());
    }

    /// Adds everything from other. Entries already present here win.
    pub fn merge(&mut self, other: UserDatabase) {
        for (_, entries) in other.users {
            for entry in entries {
                let exists = self.users.get(&entry.username)
                    .map(|b| b.iter().any(|e| e.host_pattern == entry.host_pattern))
                    .unwrap_or(false);
                if !exists {
                    self.add_entry(entry);
                }
            }
        }
        for (key, dbs) in other.db_grants {
            self.db_grants.entry(key).or_default().extend(dbs);
        }
        for (key, dbs) in other.db_wc_grants {
            self.db_wc_grants.entry(key).or_default().extend(dbs);
        }
        for (key, roles) in other.roles_mapping {
            self.roles_mapping.entry(key).or_default().extend(roles);
        }
        self.database_names.extend(other.database_names);
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn n_usernames(&self) -> usize {
        self.users.len()
    }

    pub fn n_entries(&self) -> usize {
        self.users.values().map(|b| b.len()).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item=&UserEntry> {
        self.users.values().flat_map(|b| b.iter())
    }

    /// Finds the entry the server would authenticate the client against. The exact user name is
    /// tried first, then the anonymous user if allowed. hostname is the client's reverse-resolved
    /// name, if one was looked up.
    pub fn find_entry(&self, user: &str, addr: &IpAddr, hostname: Option<&str>, settings: &UsersConfig) -> FindEntry<'_> {
        let mut need_name = false;
        if let Some(bucket) = self.users.get(user) {
            match self.find_in_bucket(bucket, addr, hostname, settings) {
                FindEntry::Found(e) => return FindEntry::Found(e),
                FindEntry::NeedNameInfo => need_name = true,
                FindEntry::NotFound => (),
            }
        }
        if settings.allow_anonymous_user && !user.is_empty() {
            if let Some(bucket) = self.users.get("") {
                match self.find_in_bucket(bucket, addr, hostname, settings) {
                    FindEntry::Found(e) => return FindEntry::Found(e),
                    FindEntry::NeedNameInfo => need_name = true,
                    FindEntry::NotFound => (),
                }
            }
        }
        if need_name { FindEntry::NeedNameInfo } else { FindEntry::NotFound }
    }

    fn find_in_bucket<'a>(&self, bucket: &'a [UserEntry], addr: &IpAddr, hostname: Option<&str>, settings: &UsersConfig) -> FindEntry<'a> {
        let loopback = is_loopback(addr);
        let mut has_hostname_patterns = false;
        for entry in bucket {
            let pattern = entry.host_pattern.as_str();
            if entry.is_role {
                continue;
            }
            let ptype = pattern_type(pattern);
            if loopback && !settings.localhost_match_wildcard_host && (pattern.is_empty() || pattern == "%") {
                continue;
            }
            if address_matches(addr, pattern, ptype) {
                return FindEntry::Found(entry);
            }
            if ptype == PatternType::Hostname && !settings.skip_name_resolve {
                has_hostname_patterns = true;
            }
        }
        if !has_hostname_patterns {
            return FindEntry::NotFound;
        }
        match hostname {
            Some(name) => bucket.iter()
                .find(|e| !e.is_role
                    && pattern_type(&e.host_pattern) == PatternType::Hostname
                    && hostname_matches(name, &e.host_pattern))
                .map(FindEntry::Found)
                .unwrap_or(FindEntry::NotFound),
            None => FindEntry::NeedNameInfo,
        }
    }

    fn case_fold(&self, name: &str, lower_case_table_names: u8) -> String {
        if lower_case_table_names == 0 {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    fn names_equal(a: &str, b: &str, lower_case_table_names: u8) -> bool {
        match lower_case_table_names {
            0 => a == b,
            1 => a == b.to_lowercase(),
            _ => a.to_lowercase() == b.to_lowercase(),
        }
    }

    /// Does the database exist on the servers? Case handling follows lower_case_table_names.
    pub fn database_exists(&self, db: &str, lower_case_table_names: u8) -> bool {
        if lower_case_table_names == 0 {
            return self.database_names.contains(db);
        }
        let folded = self.case_fold(db, lower_case_table_names);
        self.database_names.iter().any(|name| name.to_lowercase() == folded)
    }

    fn grants_access(&self, key: &str, db: &str, lower_case_table_names: u8) -> bool {
        let db = if lower_case_table_names == 1 { self.case_fold(db, 1) } else { db.to_string() };
        if let Some(dbs) = self.db_grants.get(key) {
            if dbs.iter().any(|granted| Self::names_equal(&db, granted, lower_case_table_names)) {
                return true;
            }
        }
        if let Some(patterns) = self.db_wc_grants.get(key) {
            let case_insensitive = lower_case_table_names != 0;
            if patterns.iter().any(|p| like_match(p, &db, case_insensitive)) {
                return true;
            }
        }
        false
    }

    /// Can the user of entry use database db? Checks the global privilege, then grants
    /// to the user, then grants reachable through the default role.
    pub fn check_database_access(&self, entry: &UserEntry, db: &str, lower_case_table_names: u8) -> bool {
        if db.is_empty() || entry.global_db_priv {
            return true;
        }
        let key = grant_key(&entry.username, &entry.host_pattern);
        if self.grants_access(&key, db, lower_case_table_names) {
            return true;
        }
        if entry.default_role.is_empty() {
            return false;
        }
        let granted = self.roles_mapping.get(&key)
            .map(|roles| roles.contains(&entry.default_role))
            .unwrap_or(false);
        granted && self.role_can_access_db(&entry.default_role, db, lower_case_table_names)
    }

    /// Breadth-first search over the role graph starting at role. Roles can be granted to
    /// each other in cycles, the closed set stops the search from looping.
    pub fn role_can_access_db(&self, role: &str, db: &str, lower_case_table_names: u8) -> bool {
        let mut open = VecDeque::new();
        let mut closed = BTreeSet::new();
        open.push_back(role.to_string());
        while let Some(current) = open.pop_front() {
            if !closed.insert(current.clone()) {
                continue;
            }
            // roles are stored with an empty host
            let global = self.users.get(&current)
                .map(|b| b.iter().any(|e| e.is_role && e.global_db_priv))
                .unwrap_or(false);
            let key = grant_key(&current, "");
            if global || self.grants_access(&key, db, lower_case_table_names) {
                return true;
            }
            if let Some(roles) = self.roles_mapping.get(&key) {
                for r in roles {
                    if !closed.contains(r) {
                        open.push_back(r.clone());
                    }
                }
            }
        }
        false
    }

    /// Roles the entry may activate with SET ROLE, directly or through other roles.
    pub fn user_can_set_role(&self, entry: &UserEntry, role: &str) -> bool {
        self.roles_mapping.get(&grant_key(&entry.username, &entry.host_pattern))
            .map(|roles| roles.contains(role))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UsersConfig {
        UsersConfig::default()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sample() -> UserDatabase {
        let mut db = UserDatabase::new();
        db.add_entry(UserEntry::new("alice", "%", ""));
        db.add_entry(UserEntry::new("alice", "192.168.%", ""));
        db.add_entry(UserEntry::new("alice", "10.0.0.0/24", ""));
        db.add_entry(UserEntry::new("bob", "%.example.com", ""));
        db.add_entry(UserEntry::new("", "%", ""));
        db
    }

    #[test]
    fn test_most_specific_wins() {
        let db = sample();
        let s = settings();
        match db.find_entry("alice", &ip("192.168.1.5"), None, &s) {
            FindEntry::Found(e) => assert_eq!(e.host_pattern, "192.168.%"),
            other => panic!("unexpected {:?}", other),
        }
        match db.find_entry("alice", &ip("::ffff:192.168.1.5"), None, &s) {
            FindEntry::Found(e) => assert_eq!(e.host_pattern, "192.168.%"),
            other => panic!("unexpected {:?}", other),
        }
        match db.find_entry("alice", &ip("10.0.0.9"), None, &s) {
            FindEntry::Found(e) => assert_eq!(e.host_pattern, "10.0.0.0/24"),
            other => panic!("unexpected {:?}", other),
        }
        match db.find_entry("alice", &ip("172.16.0.1"), None, &s) {
            FindEntry::Found(e) => assert_eq!(e.host_pattern, "%"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hostname_needs_name_info() {
        let mut db = sample();
        db.users.remove("");
        let s = settings();
        assert_eq!(db.find_entry("bob", &ip("10.1.1.1"), None, &s), FindEntry::NeedNameInfo);
        match db.find_entry("bob", &ip("10.1.1.1"), Some("app.example.com"), &s) {
            FindEntry::Found(e) => assert_eq!(e.host_pattern, "%.example.com"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(db.find_entry("bob", &ip("10.1.1.1"), Some("app.other.com"), &s), FindEntry::NotFound);

        let mut s = settings();
        s.skip_name_resolve = true;
        assert_eq!(db.find_entry("bob", &ip("10.1.1.1"), None, &s), FindEntry::NotFound);
    }

    #[test]
    fn test_anonymous_fallback() {
        let db = sample();
        let mut s = settings();
        match db.find_entry("carol", &ip("10.1.1.1"), None, &s) {
            FindEntry::Found(e) => assert!(e.is_anonymous()),
            other => panic!("unexpected {:?}", other),
        }
        s.allow_anonymous_user = false;
        assert_eq!(db.find_entry("carol", &ip("10.1.1.1"), None, &s), FindEntry::NotFound);
    }

    #[test]
    fn test_localhost_wildcard() {
        let mut db = UserDatabase::new();
        db.add_entry(UserEntry::new("dave", "%", ""));
        let mut s = settings();
        assert!(matches!(db.find_entry("dave", &ip("127.0.0.1"), None, &s), FindEntry::Found(_)));
        s.localhost_match_wildcard_host = false;
        assert_eq!(db.find_entry("dave", &ip("127.0.0.1"), None, &s), FindEntry::NotFound);
        db.add_entry(UserEntry::new("dave", "localhost", ""));
        assert!(matches!(db.find_entry("dave", &ip("127.0.0.1"), None, &s), FindEntry::Found(e) if e.host_pattern == "localhost"));
    }

    #[test]
    fn test_database_access() {
        let mut db = UserDatabase::new();
        let alice = UserEntry::new("alice", "%", "");
        db.add_entry(alice.clone());
        db.add_database_name("Sales");
        db.add_database_name("test_1");
        db.add_db_grant("alice", "%", "Sales");
        db.add_db_grant("alice", "%", "test\\_%");

        assert!(db.check_database_access(&alice, "Sales", 0));
        assert!(!db.check_database_access(&alice, "sales", 0));
        assert!(db.check_database_access(&alice, "sales", 2));
        assert!(db.check_database_access(&alice, "test_1", 0));
        assert!(!db.check_database_access(&alice, "testx1", 0));
        assert!(db.check_database_access(&alice, "", 0));

        assert!(db.database_exists("Sales", 0));
        assert!(!db.database_exists("sales", 0));
        assert!(db.database_exists("sales", 1));

        let mut global = alice.clone();
        global.global_db_priv = true;
        assert!(global.global_db_priv && db.check_database_access(&global, "anything", 0));
    }

    #[test]
    fn test_role_graph_with_cycle() {
        let mut db = UserDatabase::new();
        let mut alice = UserEntry::new("alice", "%", "");
        alice.default_role = "r1".to_string();
        db.add_entry(alice.clone());
        for role in ["r1", "r2", "r3"] {
            let mut e = UserEntry::new(role, "", "");
            e.is_role = true;
            db.add_entry(e);
        }
        db.add_role_mapping("alice", "%", "r1");
        // r1 -> r2 -> r1 is a cycle, r2 -> r3 holds the grant
        db.add_role_mapping("r1", "", "r2");
        db.add_role_mapping("r2", "", "r1");
        db.add_role_mapping("r2", "", "r3");
        db.add_db_grant("r3", "", "reports");

        assert!(db.check_database_access(&alice, "reports", 0));
        assert!(!db.check_database_access(&alice, "payroll", 0));

        // The default role must actually be granted to the user
        let mut mallory = UserEntry::new("mallory", "%", "");
        mallory.default_role = "r1".to_string();
        db.add_entry(mallory.clone());
        assert!(!db.check_database_access(&mallory, "reports", 0));
    }

    #[test]
    fn test_equality_and_merge() {
        let a = sample();
        let b = sample();
        assert_eq!(a, b);

        let mut other = UserDatabase::new();
        other.add_entry(UserEntry::new("alice", "%", "*changed"));
        other.add_entry(UserEntry::new("erin", "%", ""));
        let mut merged = a.clone();
        merged.merge(other);
        assert_ne!(merged, a);
        assert_eq!(merged.n_usernames(), 4);
        // the existing alice@% wins
        assert!(merged.entries().any(|e| e.username == "alice" && e.host_pattern == "%" && e.password.is_empty()));
    }
}
