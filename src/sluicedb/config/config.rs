use std::path::PathBuf;

use serde::{Deserialize};

use crate::sluicedb::config::enums::TlsMode;
use crate::sluicedb::config::service::ServiceConfig;
use crate::sluicedb::mysql::protocol::Subnet;
use crate::sluicedb::{Error, Result};

// Things that are not configurable, but might be one day
pub const CONNECT_TIMEOUT_SECONDS: u64 = 10;
pub const LISTEN_BACKLOG: u32 = 1024;
pub const COARSE_CLOCK_GRANULARITY_SECONDS: u64 = 1;
/// Client packets before authentication completes may not be larger than this
pub const MAX_HANDSHAKE_PACKET_SIZE: usize = 64 * 1024;
/// Reverse DNS lookups slower than this are logged
pub const SLOW_NAME_LOOKUP_MILLIS: u64 = 1000;
/// Statements remembered per session for diagnostics
pub const SESSION_TRACE_STATEMENTS: usize = 10;
/// Interval at which sessions check their timeouts
pub const SESSION_TICK_MILLIS: u64 = 1000;

#[derive(Deserialize)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip)]
    pub config_path: PathBuf,
    /// host to listen on, defaults to 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// port to listen on for client connections: default 4006
    #[serde(default = "default_port")]
    pub port: u16,
    /// reuseport is unix only, if true we create a listening socket per worker thread with SO_REUSEPORT options.
    /// this reduces lock contention in the kernel when calling accept. Default true.
    #[serde(default = "default_reuseport")]
    pub reuseport: bool,
    /// num_workers is the number of worker threads. Default is the number of hardware threads (hyperthreads) for the host.
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    /// recv_buffer_size is the default size for (user-space) buffers used to read from TCP sockets
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: u32,
    /// max_connections to allow before rejecting new connections. Important to introduce back-pressure. Default 10,000.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// log_level used when RUST_LOG isn't set. Default info.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// client_tls configures TLS between clients and the proxy
    #[serde(default)]
    pub client_tls: TlsConfig,
    /// proxy_protocol_networks lists the networks (addr/prefix, addr/netmask or addr) allowed to send a proxy protocol header
    #[serde(default)]
    pub proxy_protocol_networks: Vec<String>,
    /// parsed proxy_protocol_networks
    #[serde(skip)]
    pub proxy_networks: Vec<Subnet>,
    /// the read/write split service
    pub service: ServiceConfig,
}

#[derive(Deserialize, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM certificate chain
    #[serde(default)]
    pub cert_path: PathBuf,
    /// PEM private key (pkcs8 or rsa)
    #[serde(default)]
    pub key_path: PathBuf,
}

fn default_num_workers() -> u32 { num_cpus::get() as u32 }
fn default_reuseport() -> bool { cfg!(unix) }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_log_level() -> String { "info".to_string() }
const fn default_port() -> u16 { 4006 }
const fn default_recv_buffer_size() -> u32 { 32 * 1024 }
const fn default_max_connections() -> u32 { 10000 }

impl Settings {
    pub(crate) fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.num_workers == 0 {
            self.num_workers = default_num_workers();
        }
        if self.recv_buffer_size < 4096 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.recv_buffer_size > 1024*1024 {
            return Err(Error::new("recv_buffer_size cannot be > 1MB"));
        }
        self.recv_buffer_size = self.recv_buffer_size.next_power_of_two();
        if self.client_tls.mode != TlsMode::Disabled
            && (self.client_tls.cert_path.as_os_str().is_empty() || self.client_tls.key_path.as_os_str().is_empty()) {
            return Err(Error::new("client_tls requires cert_path and key_path"));
        }
        self.proxy_networks = self.proxy_protocol_networks.iter()
            .map(|s| s.parse::<Subnet>())
            .collect::<Result<Vec<_>>>()?;
        self.service.load()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
