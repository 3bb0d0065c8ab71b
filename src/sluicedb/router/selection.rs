use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use crate::sluicedb::config::SelectionCriteria;
use crate::sluicedb::router::Server;
use crate::sluicedb::router::gtid::GtidPosition;

/// Each adaptive routing score pulls the server's response time average down a little,
/// so a server that was slow once is retried eventually.
pub const ADAPTIVE_DECAY: f64 = 0.99;

/// A server a session could send a statement to, with the session's view of it.
#[derive(Clone)]
pub struct Candidate {
    pub server: Arc<Server>,
    /// The session's connection to it has a command in flight
    pub busy: bool,
    /// When the session last routed to it, from a per-session counter. Lower is longer ago.
    pub last_used: u64,
}

impl Candidate {
    pub fn new(server: Arc<Server>, busy: bool, last_used: u64) -> Self {
        Self { server, busy, last_used }
    }
}

/// Limits on which servers may serve reads.
pub struct ReadConstraints<'a> {
    /// seconds, 0 means no limit
    pub max_replication_lag: i64,
    pub master_accept_reads: bool,
    /// With causal reads, replicas must have replicated this position
    pub gtid: Option<&'a GtidPosition>,
}

pub fn can_serve_reads(server: &Server, c: &ReadConstraints) -> bool {
    if !server.is_connectable() {
        return false;
    }
    if server.is_master() {
        return c.master_accept_reads;
    }
    if !(server.is_slave() || server.is_relay()) {
        return false;
    }
    if c.max_replication_lag > 0 {
        match server.replication_lag() {
            Some(lag) if lag <= c.max_replication_lag => (),
            _ => return false,
        }
    }
    match c.gtid {
        Some(pos) if !pos.is_empty() => server.gtid_pos().is_caught_up(pos),
        _ => true,
    }
}

/// Lower is better. Adaptive routing decays the server's response time average as a side effect.
pub fn score(server: &Server, criteria: SelectionCriteria) -> f64 {
    let stats = &server.stats;
    match criteria {
        SelectionCriteria::LeastCurrentConnections => stats.current_connections.load(Relaxed) as f64,
        SelectionCriteria::LeastBehindMaster => server.replication_lag().unwrap_or(i64::MAX) as f64,
        SelectionCriteria::LeastCurrentOperations => stats.current_operations.load(Relaxed) as f64,
        SelectionCriteria::AdaptiveRouting => {
            let ops = stats.current_operations.load(Relaxed) as f64;
            let ave = if server.response_time_samples() == 0 { 0.0 } else { server.response_time_average() };
            server.decay_response_time(ADAPTIVE_DECAY);
            ave * (ops + 1.0)
        },
    }
}

/// Picks the best scored candidate among idx, breaking ties with the least recently used.
fn best_of(candidates: &[Candidate], idx: &[usize], criteria: SelectionCriteria) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for &i in idx {
        let s = score(&candidates[i].server, criteria);
        best = match best {
            None => Some((i, s)),
            Some((b, bs)) => {
                if s < bs || (s == bs && candidates[i].last_used < candidates[b].last_used) {
                    Some((i, s))
                } else {
                    Some((b, bs))
                }
            },
        };
    }
    best.map(|(i, _)| i)
}

fn lowest_rank(candidates: &[Candidate], idx: Vec<usize>) -> Vec<usize> {
    match idx.iter().map(|&i| candidates[i].server.rank()).min() {
        Some(rank) => idx.into_iter().filter(|&i| candidates[i].server.rank() == rank).collect(),
        None => idx,
    }
}

/// Chooses the master: a running, connectable master of the lowest rank.
/// The session's current master wins a tie.
pub fn select_master(candidates: &[Candidate], current: Option<&Arc<Server>>, criteria: SelectionCriteria) -> Option<usize> {
    let masters: Vec<usize> = (0..candidates.len())
        .filter(|&i| {
            let s = &candidates[i].server;
            s.is_master() && s.is_connectable()
        })
        .collect();
    let masters = lowest_rank(candidates, masters);
    if let Some(current) = current {
        if let Some(&i) = masters.iter().find(|&&i| Arc::ptr_eq(&candidates[i].server, current)) {
            return Some(i);
        }
    }
    best_of(candidates, &masters, criteria)
}

/// Read priority: idle replica, then busy replica, then a master taking reads.
fn read_priority(c: &Candidate) -> u8 {
    if c.server.is_master() {
        2
    } else if c.busy {
        1
    } else {
        0
    }
}

/// Chooses a server for a read among the candidates that may serve it.
pub fn select_reader(candidates: &[Candidate], criteria: SelectionCriteria, constraints: &ReadConstraints) -> Option<usize> {
    let eligible: Vec<usize> = (0..candidates.len())
        .filter(|&i| can_serve_reads(&candidates[i].server, constraints))
        .collect();
    let eligible = lowest_rank(candidates, eligible);
    let priority = eligible.iter().map(|&i| read_priority(&candidates[i])).min()?;
    let top: Vec<usize> = eligible.into_iter().filter(|&i| read_priority(&candidates[i]) == priority).collect();
    best_of(candidates, &top, criteria)
}
