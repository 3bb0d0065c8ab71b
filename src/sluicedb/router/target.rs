use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicI64, Ordering::{Acquire, Release, AcqRel, Relaxed}};

use arc_swap::ArcSwap;
use fnv::FnvHashMap;
use tracing::warn;

use crate::sluicedb::{Error, Result};
use crate::sluicedb::common::Version;
use crate::sluicedb::config::{ServerConfig, ServiceConfig, StaticStatus};
use crate::sluicedb::router::gtid::{GtidPosition, Gtid};

// Server status bits, owned by the monitor. The router only reads them.
pub const SERVER_RUNNING: u64 = 1;
pub const SERVER_MASTER: u64 = 1 << 1;
pub const SERVER_SLAVE: u64 = 1 << 2;
/// A replica that other replicas replicate from
pub const SERVER_RELAY: u64 = 1 << 3;
pub const SERVER_MAINT: u64 = 1 << 4;
/// No new connections, existing ones may finish
pub const SERVER_DRAINING: u64 = 1 << 5;
pub const SERVER_DISK_EXHAUSTED: u64 = 1 << 6;
/// The address is a host name that hasn't resolved yet
pub const SERVER_NEED_DNS: u64 = 1 << 7;

/// Weight of a new sample in the response time moving average
const RESPONSE_TIME_ALPHA: f64 = 0.04;

/// Connection and traffic counters of a server, shared by all workers.
#[derive(Default)]
pub struct ServerStats {
    pub current_connections: AtomicU32,
    pub total_connections: AtomicU64,
    /// Connections being opened, not yet authenticated
    pub intended_connections: AtomicU32,
    /// Commands sent and not yet answered
    pub current_operations: AtomicU32,
    pub packets: AtomicU64,
}

/// A backend database server.
pub struct Server {
    index: usize,
    name: String,
    address: String,
    rank: i64,
    max_routing_connections: u32,
    persist_pool_max: u32,
    persist_max_time: u32,
    status: AtomicU64,
    /// seconds behind the master, -1 if unknown
    replication_lag: AtomicI64,
    ping_micros: AtomicU64,
    /// f64 bits of the response time average in seconds
    response_time: AtomicU64,
    response_samples: AtomicU64,
    routing_connections: AtomicU32,
    gtid_pos: ArcSwap<GtidPosition>,
    version: ArcSwap<String>,
    pub stats: ServerStats,
}

impl Server {
    pub fn new(index: usize, config: &ServerConfig) -> Self {
        let status = match config.status {
            Some(StaticStatus::Master) => SERVER_RUNNING | SERVER_MASTER,
            Some(StaticStatus::Slave) => SERVER_RUNNING | SERVER_SLAVE,
            Some(StaticStatus::Down) | None => 0,
        };
        Self {
            index,
            name: config.name.clone(),
            address: config.socket_address(),
            rank: config.rank,
            max_routing_connections: config.max_routing_connections,
            persist_pool_max: config.persist_pool_max,
            persist_max_time: config.persist_max_time,
            status: AtomicU64::new(status),
            replication_lag: AtomicI64::new(-1),
            ping_micros: AtomicU64::new(0),
            response_time: AtomicU64::new(0f64.to_bits()),
            response_samples: AtomicU64::new(0),
            routing_connections: AtomicU32::new(0),
            gtid_pos: ArcSwap::from_pointee(GtidPosition::new()),
            version: ArcSwap::from_pointee(String::new()),
            stats: ServerStats::default(),
        }
    }

    /// Position of the server in the service's server list, also the key of its connection pool
    pub fn index(&self) -> usize { self.index }
    pub fn name(&self) -> &str { &self.name }
    /// host:port
    pub fn address(&self) -> &str { &self.address }
    pub fn rank(&self) -> i64 { self.rank }
    pub fn persist_pool_max(&self) -> u32 { self.persist_pool_max }
    pub fn persist_max_time(&self) -> u32 { self.persist_max_time }
    pub fn max_routing_connections(&self) -> u32 { self.max_routing_connections }

    pub fn status(&self) -> u64 {
        self.status.load(Acquire)
    }

    pub fn set_status(&self, bits: u64) {
        self.status.fetch_or(bits, AcqRel);
    }

    pub fn clear_status(&self, bits: u64) {
        self.status.fetch_and(!bits, AcqRel);
    }

    /// Replaces the whole status, used by the monitor
    pub fn assign_status(&self, bits: u64) {
        self.status.store(bits, Release);
    }

    pub fn is_running(&self) -> bool { self.status() & SERVER_RUNNING != 0 }
    pub fn is_master(&self) -> bool { self.status() & (SERVER_RUNNING | SERVER_MASTER) == SERVER_RUNNING | SERVER_MASTER }
    pub fn is_slave(&self) -> bool { self.status() & (SERVER_RUNNING | SERVER_SLAVE) == SERVER_RUNNING | SERVER_SLAVE }
    pub fn is_relay(&self) -> bool { self.status() & (SERVER_RUNNING | SERVER_RELAY) == SERVER_RUNNING | SERVER_RELAY }
    pub fn is_in_maint(&self) -> bool { self.status() & SERVER_MAINT != 0 }
    pub fn is_draining(&self) -> bool { self.status() & SERVER_DRAINING != 0 }

    /// New connections may be opened to the server
    pub fn is_connectable(&self) -> bool {
        let status = self.status();
        status & SERVER_RUNNING != 0 && status & (SERVER_MAINT | SERVER_DRAINING | SERVER_NEED_DNS) == 0
    }

    pub fn replication_lag(&self) -> Option<i64> {
        match self.replication_lag.load(Relaxed) {
            lag if lag < 0 => None,
            lag => Some(lag),
        }
    }

    pub fn set_replication_lag(&self, lag: Option<i64>) {
        self.replication_lag.store(lag.unwrap_or(-1), Relaxed);
    }

    pub fn ping_micros(&self) -> u64 {
        self.ping_micros.load(Relaxed)
    }

    pub fn set_ping_micros(&self, micros: u64) {
        self.ping_micros.store(micros, Relaxed);
    }

    pub fn response_time_average(&self) -> f64 {
        f64::from_bits(self.response_time.load(Relaxed))
    }

    pub fn response_time_samples(&self) -> u64 {
        self.response_samples.load(Relaxed)
    }

    fn update_response_time<F: Fn(f64) -> f64>(&self, f: F) {
        let _ = self.response_time.fetch_update(AcqRel, Acquire, |bits| Some(f(f64::from_bits(bits)).to_bits()));
    }

    /// Adds a response time sample (seconds) to the moving average
    pub fn add_response_time(&self, secs: f64) {
        let first = self.response_samples.fetch_add(1, Relaxed) == 0;
        self.update_response_time(|ave| if first { secs } else { ave + RESPONSE_TIME_ALPHA * (secs - ave) });
    }

    /// Pulls the average towards zero so a server that was slow once gets traffic again
    pub fn decay_response_time(&self, factor: f64) {
        self.update_response_time(|ave| ave * factor);
    }

    pub fn gtid_pos(&self) -> Arc<GtidPosition> {
        self.gtid_pos.load_full()
    }

    pub fn set_gtid_pos(&self, pos: GtidPosition) {
        self.gtid_pos.store(Arc::new(pos));
    }

    pub fn version_string(&self) -> Arc<String> {
        self.version.load_full()
    }

    pub fn set_version_string(&self, version: String) {
        self.version.store(Arc::new(version));
    }

    /// Takes one of max_routing_connections. Always succeeds if the server has no limit.
    pub fn try_reserve_connection(&self) -> bool {
        let max = self.max_routing_connections;
        if max == 0 {
            self.routing_connections.fetch_add(1, AcqRel);
            return true;
        }
        self.routing_connections.fetch_update(AcqRel, Acquire, |n| if n < max { Some(n + 1) } else { None }).is_ok()
    }

    pub fn release_connection(&self) {
        let _ = self.routing_connections.fetch_update(AcqRel, Acquire, |n| n.checked_sub(1));
    }

    pub fn routing_connections(&self) -> u32 {
        self.routing_connections.load(Acquire)
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Server({} {} status=0x{:x})", self.name, self.address, self.status())
    }
}

/// A routing target is a server or a group of targets.
#[derive(Debug, Clone)]
pub enum Target {
    Server(Arc<Server>),
    /// Index of a group node in the TargetGraph
    Group(usize),
}

enum TargetNode {
    Server(usize),
    Group { name: String, children: Vec<usize> },
}

/// The servers and groups of a service as an arena of nodes. Groups may nest, but
/// linking a group into one of its own descendants is rejected.
pub struct TargetGraph {
    nodes: Vec<TargetNode>,
    by_name: FnvHashMap<String, usize>,
}

impl TargetGraph {
    pub fn new(servers: &[Arc<Server>]) -> Self {
        let mut graph = Self { nodes: Vec::new(), by_name: FnvHashMap::default() };
        for s in servers {
            graph.by_name.insert(s.name().to_string(), graph.nodes.len());
            graph.nodes.push(TargetNode::Server(s.index()));
        }
        graph
    }

    pub fn add_group(&mut self, name: &str) -> Result<usize> {
        if self.by_name.contains_key(name) {
            return Err(Error::new(format!("duplicate target name {}", name)));
        }
        let id = self.nodes.len();
        self.nodes.push(TargetNode::Group { name: name.to_string(), children: Vec::new() });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).cloned()
    }

    fn reachable(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            if let TargetNode::Group { children, .. } = &self.nodes[n] {
                stack.extend(children.iter().cloned());
            }
        }
        false
    }

    /// Adds child to group. Fails if that would create a cycle.
    pub fn link(&mut self, group: usize, child: usize) -> Result<()> {
        if self.reachable(child, group) {
            return Err(Error::new(format!("linking {} into {} would create a cycle", self.name(child), self.name(group))));
        }
        match &mut self.nodes[group] {
            TargetNode::Group { children, .. } => {
                if !children.contains(&child) {
                    children.push(child);
                }
                Ok(())
            },
            TargetNode::Server(_) => Err(Error::new(format!("{} is a server, not a group", self.name(group)))),
        }
    }

    fn name(&self, node: usize) -> String {
        match &self.nodes[node] {
            TargetNode::Group { name, .. } => name.clone(),
            TargetNode::Server(i) => self.by_name.iter()
                .find(|(_, n)| **n == node)
                .map(|(k, _)| k.clone())
                .unwrap_or_else(|| format!("server #{}", i)),
        }
    }

    /// The distinct server indexes under the given nodes, in first-seen order
    pub fn servers_of(&self, nodes: &[usize]) -> Vec<usize> {
        let mut result = Vec::new();
        let mut stack: Vec<usize> = nodes.iter().rev().cloned().collect();
        while let Some(n) = stack.pop() {
            match &self.nodes[n] {
                TargetNode::Server(i) => if !result.contains(i) { result.push(*i) },
                TargetNode::Group { children, .. } => stack.extend(children.iter().rev().cloned()),
            }
        }
        result
    }
}

/// The read/write split service: its servers, the ones it routes to, and service-wide state.
pub struct Service {
    pub config: &'static ServiceConfig,
    servers: Vec<Arc<Server>>,
    targets: Vec<Arc<Server>>,
    graph: TargetGraph,
    // Latest write seen by any session, for causal_reads: fast_global
    gtid: Mutex<GtidPosition>,
}

impl Service {
    pub fn new(config: &'static ServiceConfig) -> Result<Self> {
        let servers: Vec<Arc<Server>> = config.servers.iter().enumerate()
            .map(|(i, c)| Arc::new(Server::new(i, c)))
            .collect();
        let mut graph = TargetGraph::new(&servers);
        for g in &config.groups {
            graph.add_group(&g.name)?;
        }
        for g in &config.groups {
            let group = graph.find(&g.name).ok_or_else(|| Error::new(format!("unknown group {}", g.name)))?;
            for child in &g.targets {
                let node = graph.find(child).ok_or_else(|| Error::new(format!("group {} has unknown target {}", g.name, child)))?;
                graph.link(group, node)?;
            }
        }
        let mut roots = Vec::with_capacity(config.targets.len());
        for name in &config.targets {
            roots.push(graph.find(name).ok_or_else(|| Error::new(format!("unknown target {}", name)))?);
        }
        let targets = graph.servers_of(&roots).into_iter().map(|i| servers[i].clone()).collect();
        Ok(Self {
            config,
            servers,
            targets,
            graph,
            gtid: Mutex::new(GtidPosition::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Every server of the service, indexed by Server::index
    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// The servers sessions route to
    pub fn targets(&self) -> &[Arc<Server>] {
        &self.targets
    }

    pub fn graph(&self) -> &TargetGraph {
        &self.graph
    }

    pub fn server(&self, index: usize) -> Option<&Arc<Server>> {
        self.servers.get(index)
    }

    pub fn find_server(&self, name: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.name() == name)
    }

    pub fn update_gtid(&self, gtid: Gtid) {
        if let Ok(mut pos) = self.gtid.lock() {
            pos.update(gtid);
        }
    }

    pub fn gtid_pos(&self) -> GtidPosition {
        self.gtid.lock().map(|pos| pos.clone()).unwrap_or_default()
    }

    /// The version clients see in the handshake: the configured version_string, otherwise
    /// the lowest version among the running servers so clients don't use features some lack.
    pub fn version_string(&self) -> String {
        if !self.config.version_string.is_empty() {
            return self.config.version_string.clone();
        }
        let mut lowest: Option<(Version, Arc<String>)> = None;
        for server in &self.targets {
            let vs = server.version_string();
            if vs.is_empty() {
                continue;
            }
            match Version::from_str(&vs) {
                Ok(v) => {
                    if let Some((current, current_str)) = &lowest {
                        if v != *current {
                            warn!(server = server.name(), version = %vs, other = %current_str, "servers have different versions, using the lower one");
                        }
                        if v >= *current {
                            continue;
                        }
                    }
                    lowest = Some((v, vs));
                },
                Err(e) => warn!(server = server.name(), version = %vs, %e, "could not parse server version"),
            }
        }
        match lowest {
            Some((_, s)) => s.to_string(),
            None => DEFAULT_VERSION_STRING.to_string(),
        }
    }
}

/// Sent to clients before any server version is known
pub const DEFAULT_VERSION_STRING: &str = "10.6.0-MariaDB";
