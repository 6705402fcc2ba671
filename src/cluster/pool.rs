//! The per-host connection pool: warmup, least-loaded borrowing, and reconnection.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
    RwLock,
};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{HostDistance, TopologyMessage};
use crate::{
    connection::{Connection, ConnectionEstablisher},
    error::{Error, ErrorKind, Result},
    options::{EndPoint, PoolSize},
    policies::ReconnectionPolicy,
    prepared::PreparedCache,
    runtime,
};

/// A fixed-size set of multiplexed connections to one host.
///
/// There is exactly one pool per host. Its size follows the host's distance; an
/// ignored host holds zero connections.
#[derive(Clone, Debug)]
pub(crate) struct HostConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    endpoint: EndPoint,
    establisher: ConnectionEstablisher,
    reconnection: Arc<dyn ReconnectionPolicy>,
    prepared: Arc<PreparedCache>,
    topology: Option<mpsc::UnboundedSender<TopologyMessage>>,

    /// Copy-on-write so borrows read a consistent set without holding a lock across
    /// awaits.
    connections: RwLock<Arc<Vec<Connection>>>,

    /// The connection count this pool aims for, from the host's distance.
    target: AtomicUsize,

    /// Serializes creation so concurrent `ensure` callers collapse into one attempt.
    ensure_lock: tokio::sync::Mutex<()>,

    reconnecting: AtomicBool,
    /// The running reconnection task, aborted on shutdown so no timer outlives the
    /// pool.
    reconnect_task: std::sync::Mutex<Option<crate::runtime::AsyncJoinHandle<()>>>,
    closed: AtomicBool,
}

impl HostConnectionPool {
    pub(crate) fn new(
        endpoint: EndPoint,
        establisher: ConnectionEstablisher,
        reconnection: Arc<dyn ReconnectionPolicy>,
        prepared: Arc<PreparedCache>,
        topology: mpsc::UnboundedSender<TopologyMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                establisher,
                reconnection,
                prepared,
                topology: Some(topology),
                connections: RwLock::new(Arc::new(Vec::new())),
                target: AtomicUsize::new(0),
                ensure_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                reconnect_task: std::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(endpoint: EndPoint, options: &crate::options::ClientOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                establisher: ConnectionEstablisher::new(options),
                reconnection: Arc::clone(&options.reconnection),
                prepared: Arc::new(PreparedCache::new()),
                topology: None,
                connections: RwLock::new(Arc::new(Vec::new())),
                target: AtomicUsize::new(0),
                ensure_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                reconnect_task: std::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Applies the host's distance, resizing the target. Ignored hosts drop every
    /// connection.
    pub(crate) async fn set_distance(&self, distance: HostDistance, sizes: PoolSize) {
        let target = match distance {
            HostDistance::Local => sizes.local,
            HostDistance::Remote => sizes.remote,
            HostDistance::Ignored => 0,
        };
        self.inner.target.store(target, Ordering::SeqCst);
        if target == 0 {
            self.close_connections().await;
        }
    }

    /// Opens connections in parallel up to the target. Any successful connection makes
    /// the pool usable; an error is returned only when the pool would otherwise be
    /// empty.
    pub(crate) async fn ensure(&self) -> Result<()> {
        let _guard = self.inner.ensure_lock.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }

        self.prune_closed();
        let current = self.size();
        let target = self.inner.target.load(Ordering::SeqCst);
        if current >= target {
            return Ok(());
        }

        let was_empty = current == 0;
        let attempts = (0..target - current).map(|_| self.open_connection());
        let results = join_all(attempts).await;

        let mut failures: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
        if self.size() > 0 || failures.is_empty() {
            if !failures.is_empty() {
                debug!(
                    endpoint = %self.inner.endpoint,
                    failed = failures.len(),
                    "pool warmed up partially"
                );
            }
            if was_empty && self.size() > 0 {
                // Crossing from empty to usable is what flips the host UP.
                if let Some(ref topology) = self.inner.topology {
                    let _ = topology.send(TopologyMessage::PoolUp(self.inner.endpoint.clone()));
                }
            }
            Ok(())
        } else {
            #[allow(clippy::unwrap_used)]
            Err(failures.pop().unwrap())
        }
    }

    /// Returns the open connection with the fewest requests in flight that still has
    /// a free stream id.
    pub(crate) fn borrow(&self) -> Result<Connection> {
        let snapshot = self.connections_snapshot();
        let mut open = 0usize;
        let mut best: Option<&Connection> = None;
        for connection in snapshot.iter().filter(|c| !c.is_closed()) {
            open += 1;
            if !connection.has_free_stream_id() {
                continue;
            }
            match best {
                Some(current) if current.in_flight() <= connection.in_flight() => {}
                _ => best = Some(connection),
            }
        }

        match best {
            Some(connection) => Ok(connection.clone()),
            None if open > 0 => Err(ErrorKind::ConnectionBusy.into()),
            None => Err(Error::connection_closed(format!(
                "no open connections to {}",
                self.inner.endpoint
            ))),
        }
    }

    pub(crate) fn connections(&self) -> Vec<Connection> {
        self.connections_snapshot()
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    pub(crate) fn size(&self) -> usize {
        self.connections_snapshot()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Drains and closes every connection; the pool stays usable for a later
    /// `ensure` unless the client is shutting down.
    pub(crate) async fn close_connections(&self) {
        let connections = {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.inner.connections.write().unwrap();
            std::mem::take(&mut *guard)
        };
        join_all(connections.iter().map(|c| c.shutdown())).await;
    }

    /// Permanently closes the pool.
    pub(crate) async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        {
            #[allow(clippy::unwrap_used)]
            let mut task = self.inner.reconnect_task.lock().unwrap();
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.close_connections().await;
    }

    async fn open_connection(&self) -> Result<()> {
        let connection = self
            .inner
            .establisher
            .establish(&self.inner.endpoint, None)
            .await?;
        self.register(connection);
        Ok(())
    }

    fn register(&self, connection: Connection) {
        {
            #[allow(clippy::unwrap_used)]
            let mut guard = self.inner.connections.write().unwrap();
            let mut connections = guard.as_ref().clone();
            connections.push(connection.clone());
            *guard = Arc::new(connections);
        }

        // Watch for the connection dying so the pool can react.
        let pool = self.clone();
        runtime::spawn(async move {
            let error = connection.closed().await;
            pool.handle_closed(&connection, error);
        });
    }

    fn handle_closed(&self, connection: &Connection, error: Error) {
        self.remove(connection.id());
        // Any query ids prepared over that session are gone with it.
        self.inner.prepared.remove_connection(connection.id());

        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        debug!(endpoint = %self.inner.endpoint, %error, "pool lost a connection");

        if self.size() == 0 {
            if let Some(ref topology) = self.inner.topology {
                let _ = topology.send(TopologyMessage::PoolDown(self.inner.endpoint.clone()));
            }
            self.start_reconnecting();
        } else {
            // Still serving traffic; replace the lost connection in the background.
            let pool = self.clone();
            runtime::spawn(async move {
                let _ = pool.ensure().await;
            });
        }
    }

    /// Runs the reconnection schedule until one connection comes up, then refills the
    /// rest of the pool in the background.
    fn start_reconnecting(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.target.load(Ordering::SeqCst) == 0 {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        let pool = self.clone();
        let task = runtime::spawn(async move {
            let mut schedule = pool.inner.reconnection.new_schedule();
            loop {
                let delay = schedule.next_delay();
                tokio::time::sleep(delay).await;
                if pool.inner.closed.load(Ordering::SeqCst)
                    || pool.inner.target.load(Ordering::SeqCst) == 0
                {
                    break;
                }

                match pool
                    .inner
                    .establisher
                    .establish(&pool.inner.endpoint, None)
                    .await
                {
                    Ok(connection) => {
                        info!(endpoint = %pool.inner.endpoint, "reconnected");
                        pool.register(connection);
                        if let Some(ref topology) = pool.inner.topology {
                            let _ = topology
                                .send(TopologyMessage::PoolUp(pool.inner.endpoint.clone()));
                        }
                        // Bring the pool back to full size without blocking the
                        // up-transition.
                        let refill = pool.clone();
                        runtime::spawn(async move {
                            let _ = refill.ensure().await;
                        });
                        break;
                    }
                    Err(error) => {
                        warn!(
                            endpoint = %pool.inner.endpoint,
                            %error,
                            "reconnection attempt failed"
                        );
                    }
                }
            }
            pool.inner.reconnecting.store(false, Ordering::SeqCst);
        });
        #[allow(clippy::unwrap_used)]
        let mut slot = self.inner.reconnect_task.lock().unwrap();
        *slot = Some(task);
    }

    fn remove(&self, connection_id: u64) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.connections.write().unwrap();
        if guard.iter().any(|c| c.id() == connection_id) {
            let mut connections = guard.as_ref().clone();
            connections.retain(|c| c.id() != connection_id);
            *guard = Arc::new(connections);
        }
    }

    fn prune_closed(&self) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.connections.write().unwrap();
        if guard.iter().any(|c| c.is_closed()) {
            let mut connections = guard.as_ref().clone();
            connections.retain(|c| !c.is_closed());
            *guard = Arc::new(connections);
        }
    }

    fn connections_snapshot(&self) -> Arc<Vec<Connection>> {
        #[allow(clippy::unwrap_used)]
        Arc::clone(&self.inner.connections.read().unwrap())
    }
}
