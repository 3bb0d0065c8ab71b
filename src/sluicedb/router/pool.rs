use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::sluicedb::mysql::backend::{BackendConnection, EventSink};
use crate::sluicedb::router::Server;

/// An idle backend connection waiting for a session.
pub struct PooledConn {
    pub conn: Box<dyn BackendConnection>,
    pub thread_id: u32,
    pub capabilities: u32,
    /// coarse clock time it entered the pool
    pub pooled_at: u32,
}

/// Idle backend connections of one worker, a stack per server. Only the worker's own
/// sessions use them, so there's no locking.
pub struct ConnectionPools {
    pools: Vec<VecDeque<PooledConn>>,
    /// Where pooled connections report, so the worker notices when they die
    sink: EventSink,
}

impl ConnectionPools {
    pub fn new(num_servers: usize, sink: EventSink) -> Self {
        let mut pools = Vec::with_capacity(num_servers);
        pools.resize_with(num_servers, VecDeque::new);
        Self { pools, sink }
    }

    /// Adds an idle connection. Returns false, after closing it, if the pool is full or disabled.
    pub fn put(&mut self, pooled: PooledConn) -> bool {
        let server = pooled.conn.server().clone();
        let max = server.persist_pool_max() as usize;
        match self.pools.get_mut(server.index()) {
            Some(pool) if pool.len() < max && server.is_connectable() => {
                pooled.conn.set_sink(self.sink.clone());
                debug!(server = server.name(), conn_id = pooled.conn.id(), pooled = pool.len() + 1, "connection returned to pool");
                pool.push_back(pooled);
                true
            },
            _ => {
                pooled.conn.close();
                false
            },
        }
    }

    /// Takes the most recently pooled connection to server, the caller sets its sink.
    pub fn take(&mut self, server: &Arc<Server>) -> Option<PooledConn> {
        let pool = self.pools.get_mut(server.index())?;
        if !server.is_connectable() {
            for p in pool.drain(..) {
                p.conn.close();
            }
            return None;
        }
        pool.pop_back()
    }

    /// Drops a pooled connection that closed or failed.
    pub fn remove(&mut self, conn_id: u64) -> Option<PooledConn> {
        for pool in self.pools.iter_mut() {
            if let Some(i) = pool.iter().position(|p| p.conn.id() == conn_id) {
                return pool.remove(i);
            }
        }
        None
    }

    /// Closes connections idle for longer than their server's persist_max_time.
    pub fn evict_expired(&mut self, now: u32) -> usize {
        let mut evicted = 0;
        for pool in self.pools.iter_mut() {
            // oldest first, stop at the first one still fresh
            while let Some(front) = pool.front() {
                let max_time = front.conn.server().persist_max_time();
                if now.saturating_sub(front.pooled_at) < max_time {
                    break;
                }
                if let Some(p) = pool.pop_front() {
                    debug!(server = p.conn.server().name(), conn_id = p.conn.id(), "closing expired pooled connection");
                    p.conn.close();
                    evicted += 1;
                }
            }
        }
        evicted
    }

    pub fn len(&self, server: &Server) -> usize {
        self.pools.get(server.index()).map(|p| p.len()).unwrap_or(0)
    }

    pub fn close_all(&mut self) {
        for pool in self.pools.iter_mut() {
            for p in pool.drain(..) {
                p.conn.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use bytes::Bytes;
    use tokio::sync::mpsc::unbounded_channel;
    use crate::sluicedb::Result;
    use crate::sluicedb::config::{ServerConfig, StaticStatus};
    use crate::sluicedb::mysql::backend::BackendAuth;

    struct FakeConn {
        id: u64,
        server: Arc<Server>,
        closed: Rc<RefCell<Vec<u64>>>,
    }

    impl BackendConnection for FakeConn {
        fn id(&self) -> u64 { self.id }
        fn server(&self) -> &Arc<Server> { &self.server }
        fn write(&self, _packet: Bytes) -> Result<()> { Ok(()) }
        fn reset(&self, _auth: &BackendAuth) -> Result<()> { Ok(()) }
        fn set_sink(&self, _sink: EventSink) {}
        fn close(&self) { self.closed.borrow_mut().push(self.id) }
    }

    fn pooled(id: u64, server: &Arc<Server>, closed: &Rc<RefCell<Vec<u64>>>, at: u32) -> PooledConn {
        PooledConn {
            conn: Box::new(FakeConn { id, server: server.clone(), closed: closed.clone() }),
            thread_id: id as u32,
            capabilities: 0,
            pooled_at: at,
        }
    }

    #[test]
    fn test_pool_limits_and_expiry() {
        let mut config = ServerConfig::default();
        config.status = Some(StaticStatus::Slave);
        config.persist_pool_max = 2;
        config.persist_max_time = 60;
        let server = Arc::new(Server::new(0, &config));
        let (tx, _rx) = unbounded_channel();
        let mut pools = ConnectionPools::new(1, tx);
        let closed = Rc::new(RefCell::new(Vec::new()));

        assert!(pools.put(pooled(1, &server, &closed, 0)));
        assert!(pools.put(pooled(2, &server, &closed, 30)));
        assert!(!pools.put(pooled(3, &server, &closed, 30)));
        assert_eq!(*closed.borrow(), vec![3]);
        assert_eq!(pools.len(&server), 2);

        assert_eq!(pools.evict_expired(70), 1);
        assert_eq!(*closed.borrow(), vec![3, 1]);
        let p = pools.take(&server).expect("pooled connection");
        assert_eq!(p.conn.id(), 2);
        assert!(pools.take(&server).is_none());

        assert!(pools.put(p));
        assert!(pools.remove(2).is_some());
        assert_eq!(pools.len(&server), 0);
    }
}
