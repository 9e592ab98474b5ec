//! Connection pooling: a bounded [`Backend`] per broker endpoint and the
//! endpoint-keyed [`ConnectionPool`] above them.
//!
//! A backend hands out idle connections first, dials while under its
//! connection limit, and otherwise waits a bounded time for a connection to
//! be returned. Saturation (`NoConnectionsAvailable`) is deliberately a
//! different error kind from dial failures: the former is local
//! backpressure, the latter means the endpoint may be gone and the caller
//! should refresh its view of the cluster.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    config::ClusterConnectionConf,
    connection::Connection,
    error::{Error, Result},
};

#[derive(Default)]
struct BackendState {
    /// Live connections associated with this backend, idle or checked out.
    open_count: usize,
    idle: VecDeque<Arc<Connection>>,
    /// Set when the backend is removed from the pool; returned connections
    /// are closed instead of re-enqueued.
    dead: bool,
}

/// Bounded pool of connections to a single broker endpoint.
pub struct Backend {
    addr: String,
    client_id: String,
    conf: ClusterConnectionConf,
    state: Mutex<BackendState>,
    /// Signalled whenever a connection is returned or capacity frees up.
    returned: Notify,
}

impl Backend {
    fn new(addr: String, client_id: String, conf: ClusterConnectionConf) -> Arc<Self> {
        Arc::new(Self {
            addr,
            client_id,
            conf,
            state: Mutex::new(BackendState::default()),
            returned: Notify::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Advisory count of live connections (idle and checked out).
    pub fn num_open_connections(&self) -> usize {
        self.state.lock().open_count
    }

    /// Returns an idle connection, dials a new one while under the
    /// connection limit, or waits up to `idle_connection_wait` for one to be
    /// returned. Failing that wait yields
    /// [`Error::NoConnectionsAvailable`].
    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.take_idle() {
            return Ok(conn);
        }
        if self.try_reserve()? {
            return self.dial().await;
        }

        let deadline = tokio::time::Instant::now() + self.conf.idle_connection_wait;
        loop {
            let notified = self.returned.notified();
            // Re-check after arming the waiter so a return between the
            // first check and here is not lost.
            if let Some(conn) = self.take_idle() {
                return Ok(conn);
            }
            if self.try_reserve()? {
                return self.dial().await;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(addr = %self.addr, "backend saturated");
                return Err(Error::NoConnectionsAvailable {
                    addr: self.addr.clone(),
                    wait: self.conf.idle_connection_wait,
                });
            }
        }
    }

    /// Returns a connection to the idle set. A closed connection only
    /// releases its slot; it is never re-enqueued.
    pub fn idle(&self, conn: Arc<Connection>) {
        let mut state = self.state.lock();
        if state.dead {
            state.open_count = state.open_count.saturating_sub(1);
            drop(state);
            conn.close();
        } else if conn.is_closed() {
            state.open_count = state.open_count.saturating_sub(1);
            drop(state);
        } else {
            state.idle.push_back(conn);
            drop(state);
        }
        self.returned.notify_one();
    }

    /// Pops the first usable idle connection, releasing slots held by
    /// connections that died while idle.
    pub fn take_idle(&self) -> Option<Arc<Connection>> {
        let mut state = self.state.lock();
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_closed() {
                state.open_count = state.open_count.saturating_sub(1);
                self.returned.notify_one();
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn try_reserve(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(Error::Closed);
        }
        if state.open_count < self.conf.connection_limit {
            state.open_count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Dials with a reserved slot. The slot is released again on failure or
    /// if the dialing future is dropped mid-flight.
    async fn dial(&self) -> Result<Arc<Connection>> {
        let mut slot = SlotGuard {
            backend: self,
            armed: true,
        };
        let result = tokio::time::timeout(
            self.conf.dial_timeout,
            self.conf.dialer.dial(&self.addr),
        )
        .await;

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!(addr = %self.addr, error = %source, "cannot dial broker");
                return Err(Error::Dial {
                    addr: self.addr.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(addr = %self.addr, timeout = ?self.conf.dial_timeout, "dial timed out");
                return Err(Error::DialTimeout {
                    addr: self.addr.clone(),
                    timeout: self.conf.dial_timeout,
                });
            }
        };

        // The slot now belongs to the live connection.
        slot.armed = false;
        info!(addr = %self.addr, client_id = %self.client_id, "established new connection");
        Ok(Connection::new(
            stream,
            self.addr.clone(),
            self.client_id.clone(),
            Arc::clone(&self.conf.serializer),
        ))
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.open_count = state.open_count.saturating_sub(1);
        }
        self.returned.notify_one();
    }

    /// Closes every idle connection and marks the backend dead so checked
    /// out connections are closed as they come back.
    fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.dead = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open_count = state.open_count.saturating_sub(drained.len());
            drained
        };
        for conn in drained {
            conn.close();
        }
        self.returned.notify_waiters();
    }
}

/// Releases a reserved connection slot unless disarmed.
struct SlotGuard<'a> {
    backend: &'a Backend,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.backend.release_slot();
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("addr", &self.addr)
            .field("open", &self.num_open_connections())
            .finish_non_exhaustive()
    }
}

/// Endpoint-keyed collection of backends for one (cluster, client id) pair.
pub struct ConnectionPool {
    client_id: String,
    conf: ClusterConnectionConf,
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(client_id: impl Into<String>, conf: ClusterConnectionConf) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            conf,
            backends: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reconciles the pool against `addrs`: new endpoints get a backend,
    /// endpoints no longer present are closed and removed. Surviving
    /// backends keep their idle connections. A closed pool stays empty, no
    /// matter what address sets later refreshes push at it.
    pub fn initialize_addrs(&self, addrs: &[String]) {
        if self.is_closed() {
            return;
        }
        let mut backends = self.backends.write();
        let stale: Vec<String> = backends
            .keys()
            .filter(|addr| !addrs.iter().any(|a| a == *addr))
            .cloned()
            .collect();
        for addr in stale {
            if let Some(backend) = backends.remove(&addr) {
                debug!(addr = %addr, client_id = %self.client_id, "trimming dead backend");
                backend.close();
            }
        }
        for addr in addrs {
            backends.entry(addr.clone()).or_insert_with(|| {
                Backend::new(addr.clone(), self.client_id.clone(), self.conf.clone())
            });
        }
    }

    pub fn get_backend(&self, addr: &str) -> Option<Arc<Backend>> {
        self.backends.read().get(addr).cloned()
    }

    pub fn get_all_addrs(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    /// Connection to a specific endpoint; the endpoint must be part of the
    /// current address set.
    pub async fn get_connection_by_addr(&self, addr: &str) -> Result<Arc<Connection>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.get_backend(addr) {
            Some(backend) => backend.get_connection().await,
            None => Err(Error::UnknownEndpoint(addr.to_string())),
        }
    }

    /// First idle connection found across all backends, in arbitrary order.
    pub fn get_idle_connection(&self) -> Option<Arc<Connection>> {
        let backends: Vec<_> = self.backends.read().values().cloned().collect();
        backends.into_iter().find_map(|backend| backend.take_idle())
    }

    /// Returns `conn` to its owning backend. Connections whose backend was
    /// trimmed in the meantime are closed.
    pub fn idle(&self, conn: Arc<Connection>) {
        match self.get_backend(conn.addr()) {
            Some(backend) => backend.idle(conn),
            None => conn.close(),
        }
    }

    /// Closes every backend; in-flight requests fail with `Closed` and the
    /// pool refuses further checkouts.
    pub fn close(&self) {
        self.initialize_addrs(&[]);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection checked out of a pool, returned to it on drop.
///
/// Keeps retry loops cancellation-safe: however a request future unwinds,
/// the connection (and with it the backend's slot accounting) goes back to
/// its owner.
pub(crate) struct Leased<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Arc<Connection>>,
}

impl<'a> Leased<'a> {
    pub(crate) fn new(pool: &'a ConnectionPool, conn: Arc<Connection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl std::ops::Deref for Leased<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("leased connection present")
    }
}

impl Drop for Leased<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle(conn);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("client_id", &self.client_id)
            .field("addrs", &self.get_all_addrs())
            .finish_non_exhaustive()
    }
}
