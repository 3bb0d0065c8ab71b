use std::path::PathBuf;

use serde::{Deserialize};

use crate::sluicedb::config::enums::{
    SelectionCriteria, MasterFailureMode, CausalReads, UserAccountsFileUsage, SqlVariablesIn, StaticStatus};
use crate::sluicedb::common::{Error, Result};

#[derive(Deserialize)]
pub struct ServiceConfig {
    /// name of the service, used in logs
    #[serde(default = "default_service_name")]
    pub name: String,
    /// user the proxy uses to load user accounts, monitor servers and kill backend connections
    pub user: String,
    /// password for user
    #[serde(default)]
    pub password: String,
    /// version_string sent to clients in the handshake. Defaults to the lowest version reported by the servers.
    #[serde(default)]
    pub version_string: String,
    /// servers are the backend database servers
    pub servers: Vec<ServerConfig>,
    /// groups are named sets of servers and other groups, they must not form a cycle
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// targets the service routes to, names of servers or groups. Default is every server.
    #[serde(default)]
    pub targets: Vec<String>,
    /// default values used to replace any empty/omitted value for each ServerConfig
    #[serde(default)]
    pub default: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_service_name() -> String { "rwsplit".to_string() }

#[derive(Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// name used to refer to this server in groups and logs
    #[serde(default)]
    pub name: String,
    /// address to connect to, defaults to 127.0.0.1
    #[serde(default)]
    pub address: String,
    /// port to connect to, defaults to 3306
    #[serde(default)]
    pub port: u16,
    /// rank is the priority tier of the server, lower is preferred. Default 1.
    #[serde(default)]
    pub rank: i64,
    /// max_routing_connections caps the number of connections sessions may use at once. 0 is unlimited.
    #[serde(default)]
    pub max_routing_connections: u32,
    /// persist_pool_max is the number of idle connections each worker may keep for reuse. 0 disables pooling.
    #[serde(default)]
    pub persist_pool_max: u32,
    /// persist_max_time is how long (seconds) a pooled connection may stay idle before it's closed. Default 3600.
    #[serde(default)]
    pub persist_max_time: u32,
    /// status used when the monitor is disabled
    #[serde(default)]
    pub status: Option<StaticStatus>,
}

#[derive(Deserialize, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub targets: Vec<String>,
}

#[derive(Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection_criteria: SelectionCriteria,
    /// max_slave_connections is the upper limit on replica connections per session. Default 255.
    #[serde(default = "default_max_slave_connections")]
    pub max_slave_connections: u32,
    /// slave_connections is the number of replicas connected at session start. Default 255.
    #[serde(default = "default_max_slave_connections")]
    pub slave_connections: u32,
    /// max_replication_lag in seconds, replicas lagging more are not used for reads. 0 disables the check.
    #[serde(default)]
    pub max_replication_lag: i64,
    /// master_accept_reads allows the master to be chosen as a read target
    #[serde(default)]
    pub master_accept_reads: bool,
    #[serde(default)]
    pub causal_reads: CausalReads,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    /// lazy_connect defers opening backend connections until the first query that needs them
    #[serde(default)]
    pub lazy_connect: bool,
    /// master_reconnection allows switching to a new master mid-session when no transaction is open. Default true.
    #[serde(default = "default_true")]
    pub master_reconnection: bool,
    /// retry_failed_reads re-routes a read to another server if its server fails before replying. Default true.
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// strict_multi_stmt routes everything to the master after the first multi-statement query. Default false.
    #[serde(default)]
    pub strict_multi_stmt: bool,
    /// strict_sp_calls routes everything to the master after the first CALL. Default false.
    #[serde(default)]
    pub strict_sp_calls: bool,
    #[serde(default)]
    pub use_sql_variables_in: SqlVariablesIn,
    /// max_sescmd_history is the number of session commands kept for replay. Default 50.
    #[serde(default = "default_max_sescmd_history")]
    pub max_sescmd_history: usize,
    /// prune_sescmd_history drops the oldest entries when the history is full instead of disabling it. Default true.
    #[serde(default = "default_true")]
    pub prune_sescmd_history: bool,
    /// disable_sescmd_history turns off recording, which disables reconnection and pooling
    #[serde(default)]
    pub disable_sescmd_history: bool,
}

const fn default_true() -> bool { true }
const fn default_max_slave_connections() -> u32 { 255 }
const fn default_max_sescmd_history() -> usize { 50 }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection_criteria: Default::default(),
            max_slave_connections: default_max_slave_connections(),
            slave_connections: default_max_slave_connections(),
            max_replication_lag: 0,
            master_accept_reads: false,
            causal_reads: Default::default(),
            master_failure_mode: Default::default(),
            lazy_connect: false,
            master_reconnection: true,
            retry_failed_reads: true,
            strict_multi_stmt: false,
            strict_sp_calls: false,
            use_sql_variables_in: Default::default(),
            max_sescmd_history: default_max_sescmd_history(),
            prune_sescmd_history: true,
            disable_sescmd_history: false,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct UsersConfig {
    /// users_refresh_time is the minimum number of seconds between reloads. Default 30.
    #[serde(default = "default_users_refresh_time")]
    pub users_refresh_time: u64,
    /// users_refresh_interval reloads accounts at least this often (seconds). 0 means only on demand.
    #[serde(default)]
    pub users_refresh_interval: u64,
    /// user_accounts_file is an optional JSON file with additional accounts
    #[serde(default)]
    pub user_accounts_file: Option<PathBuf>,
    #[serde(default)]
    pub user_accounts_file_usage: UserAccountsFileUsage,
    /// users_from_all loads accounts from every server and merges them instead of stopping at the first
    #[serde(default)]
    pub users_from_all: bool,
    /// skip_name_resolve disables reverse DNS lookups for hostname patterns
    #[serde(default)]
    pub skip_name_resolve: bool,
    /// lower_case_table_names as on the servers: 0 case-sensitive, 1 lowercase, 2 case-insensitive compare
    #[serde(default)]
    pub lower_case_table_names: u8,
    #[serde(default = "default_true")]
    pub log_password_mismatch: bool,
    #[serde(default)]
    pub enable_root_user: bool,
    #[serde(default = "default_true")]
    pub localhost_match_wildcard_host: bool,
    #[serde(default = "default_true")]
    pub allow_anonymous_user: bool,
    /// throttle on-demand reloads after this many successful loads. Default 5.
    #[serde(default = "default_throttle")]
    pub throttle_after_successful_loads: u32,
    /// throttle on-demand reloads after this many consecutive failed loads. Default 5.
    #[serde(default = "default_throttle")]
    pub throttle_after_failed_loads: u32,
}

const fn default_users_refresh_time() -> u64 { 30 }
const fn default_throttle() -> u32 { 5 }

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            users_refresh_time: default_users_refresh_time(),
            users_refresh_interval: 0,
            user_accounts_file: None,
            user_accounts_file_usage: Default::default(),
            users_from_all: false,
            skip_name_resolve: false,
            lower_case_table_names: 0,
            log_password_mismatch: true,
            enable_root_user: false,
            localhost_match_wildcard_host: true,
            allow_anonymous_user: true,
            throttle_after_successful_loads: default_throttle(),
            throttle_after_failed_loads: default_throttle(),
        }
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct PoolConfig {
    /// wait_for_connection parks a session when a server is at max_routing_connections instead of failing it
    #[serde(default)]
    pub wait_for_connection: bool,
    /// multiplex_timeout is how long (seconds) a session may wait for a connection slot. Default 60.
    #[serde(default)]
    pub multiplex_timeout: u64,
    /// idle_session_pool_time returns an idle session's connections to the pool after this many seconds. 0 disables.
    #[serde(default)]
    pub idle_session_pool_time: u64,
}

#[derive(Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// monitor_interval in milliseconds. Default 2000.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,
}

const fn default_monitor_interval() -> u64 { 2000 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_interval: default_monitor_interval(),
        }
    }
}

impl ServiceConfig {
    pub(crate) fn load(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::new("service must have at least one server"));
        }
        for (i, server) in self.servers.iter_mut().enumerate() {
            server.load(&self.default, i)?;
        }
        for (i, server) in self.servers.iter().enumerate() {
            if self.servers[..i].iter().any(|s| s.name == server.name) {
                return Err(Error::new(format!("duplicate server name {}", server.name)));
            }
        }
        if self.router.slave_connections > self.router.max_slave_connections {
            self.router.slave_connections = self.router.max_slave_connections;
        }
        if self.users.lower_case_table_names > 2 {
            return Err(Error::new("lower_case_table_names must be 0, 1 or 2"));
        }
        if self.pool.multiplex_timeout == 0 {
            self.pool.multiplex_timeout = 60;
        }
        if self.targets.is_empty() {
            self.targets = self.servers.iter().map(|s| s.name.clone()).collect();
        }
        Ok(())
    }
}

impl ServerConfig {
    pub(crate) fn load(&mut self, defaults: &ServerConfig, index: usize) -> Result<()> {
        if self.name.is_empty() {
            self.name = format!("server{}", index + 1);
        }
        if self.address.is_empty() {
            self.address = if defaults.address.is_empty() { "127.0.0.1".to_string() } else { defaults.address.clone() };
        }
        if self.port == 0 {
            self.port = if defaults.port == 0 { 3306 } else { defaults.port };
        }
        if self.rank == 0 {
            self.rank = if defaults.rank == 0 { 1 } else { defaults.rank };
        }
        if self.max_routing_connections == 0 {
            self.max_routing_connections = defaults.max_routing_connections;
        }
        if self.persist_pool_max == 0 {
            self.persist_pool_max = defaults.persist_pool_max;
        }
        if self.persist_max_time == 0 {
            self.persist_max_time = if defaults.persist_max_time == 0 { 3600 } else { defaults.persist_max_time };
        }
        Ok(())
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
