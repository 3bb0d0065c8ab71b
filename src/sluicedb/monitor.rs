use std::sync::Arc;
use std::thread;
use std::time::Instant;

use futures::future::join_all;
use tokio::runtime::Builder;
use tokio::time::{interval, Duration};
use tracing::{debug, info, info_span, warn};

use crate::sluicedb::Result;
use crate::sluicedb::mysql::backend::{LocalClient, ResultSet};
use crate::sluicedb::router::{GtidPosition, Server, Service, SERVER_MASTER, SERVER_RUNNING, SERVER_SLAVE};

/// What one round of monitor queries found out about a server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probe {
    pub read_only: bool,
    pub gtid_pos: GtidPosition,
    pub version: String,
    /// None if the server doesn't replicate from anyone
    pub replication: Option<Replication>,
    pub ping_micros: u64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Replication {
    pub io_running: bool,
    pub sql_running: bool,
    pub seconds_behind_master: Option<i64>,
}

impl Probe {
    /// The status bits for the probed server. A server replicating from a master is a
    /// slave, a writable server that isn't replicating is the master.
    pub fn status(&self) -> u64 {
        match &self.replication {
            Some(r) if r.io_running && r.sql_running => SERVER_RUNNING | SERVER_SLAVE,
            Some(r) if r.io_running || r.sql_running => SERVER_RUNNING,
            _ if !self.read_only => SERVER_RUNNING | SERVER_MASTER,
            _ => SERVER_RUNNING,
        }
    }

    /// Replication lag in seconds, None when unknown.
    pub fn replication_lag(&self) -> Option<i64> {
        match &self.replication {
            Some(r) if r.io_running && r.sql_running => r.seconds_behind_master,
            _ => None,
        }
    }

    pub fn parse(vars: &ResultSet, slave_status: &ResultSet) -> Result<Self> {
        let read_only = matches!(vars.get(0, "@@read_only"), Some("1") | Some("ON"));
        let gtid_pos = vars.get(0, "@@gtid_current_pos").unwrap_or("").parse()?;
        let version = vars.get(0, "@@version").unwrap_or("").to_string();
        let replication = if slave_status.rows().is_empty() {
            None
        } else {
            Some(Replication {
                io_running: slave_status.get(0, "Slave_IO_Running") == Some("Yes"),
                sql_running: slave_status.get(0, "Slave_SQL_Running") == Some("Yes"),
                seconds_behind_master: slave_status.get(0, "Seconds_Behind_Master").and_then(|s| s.parse().ok()),
            })
        };
        Ok(Self {
            read_only,
            gtid_pos,
            version,
            replication,
            ping_micros: 0,
        })
    }

    pub fn apply(&self, server: &Server) {
        let before = server.status();
        server.assign_status(self.status());
        server.set_replication_lag(self.replication_lag());
        server.set_ping_micros(self.ping_micros);
        server.set_gtid_pos(self.gtid_pos.clone());
        if !self.version.is_empty() {
            server.set_version_string(self.version.clone());
        }
        if before != server.status() {
            info!(server = server.name(), status = server.status(), "server status changed");
        }
    }
}

/// Connects to each server of the service every monitor_interval and keeps their
/// status bits, replication lag, GTID position and version current.
pub struct Monitor {
    service: Arc<Service>,
    user: String,
    password: String,
    interval: Duration,
}

impl Monitor {
    pub fn new(service: Arc<Service>) -> Self {
        let config = service.config;
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            interval: Duration::from_millis(config.monitor.monitor_interval),
            service,
        }
    }

    /// Runs the monitor on its own thread and runtime. Returns None if the monitor is
    /// disabled, servers then keep the static status from their configuration.
    pub fn start(self) -> Result<Option<thread::JoinHandle<()>>> {
        if !self.service.config.monitor.enabled {
            info!(service = self.service.name(), "monitor disabled, using static server status");
            return Ok(None);
        }
        let tokio = Builder::new_current_thread().enable_all().build()?;
        let handle = thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || {
                let _span = info_span!("monitor").entered();
                tokio.block_on(self.run());
            })?;
        Ok(Some(handle))
    }

    pub async fn run(self) {
        info!(servers = self.service.servers().len(), interval_ms = self.interval.as_millis() as u64, "monitor started");
        let mut tick = interval(self.interval);
        loop {
            tick.tick().await;
            self.tick().await;
        }
    }

    /// Probes every server once, concurrently.
    pub async fn tick(&self) {
        let probes = join_all(self.service.servers().iter().map(|server| self.probe(server))).await;
        for (server, probe) in self.service.servers().iter().zip(probes) {
            match probe {
                Ok(probe) => probe.apply(server),
                Err(e) => {
                    if server.is_running() {
                        warn!(server = server.name(), %e, "server is down");
                    } else {
                        debug!(server = server.name(), %e, "server still down");
                    }
                    server.clear_status(SERVER_RUNNING);
                    server.set_replication_lag(None);
                },
            }
        }
    }

    async fn probe(&self, server: &Server) -> Result<Probe> {
        let start = Instant::now();
        let mut client = LocalClient::connect(server.address(), &self.user, &self.password, "").await?;
        let ping_micros = start.elapsed().as_micros() as u64;
        let vars = client.query("SELECT @@read_only, @@gtid_current_pos, @@version").await;
        let slave_status = client.query("SHOW SLAVE STATUS").await;
        client.close().await;
        let mut probe = Probe::parse(&vars?, &slave_status?)?;
        probe.ping_micros = ping_micros;
        Ok(probe)
    }
}
