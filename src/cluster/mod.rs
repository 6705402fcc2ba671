//! Cluster state: hosts, the host map, per-host connection pools, token metadata,
//! and the control connection that keeps them fresh.

pub(crate) mod control;
mod host;
pub(crate) mod pool;
pub(crate) mod token;

use std::sync::{Arc, RwLock};

pub use host::{Host, HostDistance};
pub(crate) use host::HostMetadata;
pub use token::Token;

use crate::{
    frame::response::ServerEvent,
    options::EndPoint,
};
use token::TokenMap;

/// Messages serialized through the topology worker, which is the only writer of
/// host liveness.
#[derive(Debug)]
pub(crate) enum TopologyMessage {
    /// A pool opened its first connection to a downed host.
    PoolUp(EndPoint),
    /// A pool lost its last connection.
    PoolDown(EndPoint),
    /// A pushed event from the control connection.
    Server(ServerEvent),
    /// The control connection itself went down and needs to fail over.
    ControlConnectionDead,
    /// Control failover found a new home.
    ControlReattached(crate::connection::Connection, EndPoint),
    /// The client is shutting down; stop the worker.
    Shutdown(crate::runtime::ShutdownRequest),
}

/// Insertion-ordered map of endpoint to host, behind copy-on-write so query plans
/// iterate a consistent snapshot while the control connection mutates the map.
#[derive(Debug, Default)]
pub(crate) struct HostMap {
    inner: RwLock<Arc<Vec<Arc<Host>>>>,
}

impl HostMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<Host>>> {
        #[allow(clippy::unwrap_used)]
        Arc::clone(&self.inner.read().unwrap())
    }

    /// Clusters are small, so lookups scan the ordered vector rather than keeping a
    /// second index in sync.
    pub(crate) fn get(&self, endpoint: &EndPoint) -> Option<Arc<Host>> {
        self.snapshot()
            .iter()
            .find(|host| host.endpoint() == endpoint)
            .cloned()
    }

    /// Adds a host, preserving insertion order. Returns `false` if the endpoint is
    /// already present.
    pub(crate) fn insert(&self, host: Arc<Host>) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.write().unwrap();
        if guard.iter().any(|h| h.endpoint() == host.endpoint()) {
            return false;
        }
        let mut hosts = guard.as_ref().clone();
        hosts.push(host);
        *guard = Arc::new(hosts);
        true
    }

    pub(crate) fn remove(&self, endpoint: &EndPoint) -> Option<Arc<Host>> {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.write().unwrap();
        let index = guard.iter().position(|h| h.endpoint() == endpoint)?;
        let mut hosts = guard.as_ref().clone();
        let removed = hosts.remove(index);
        *guard = Arc::new(hosts);
        Some(removed)
    }
}

/// A point-in-time view of the cluster handed to load balancing policies. Hosts are
/// in insertion order; the token map, when present, answers replica lookups.
#[derive(Clone, Debug)]
pub struct ClusterSnapshot {
    hosts: Arc<Vec<Arc<Host>>>,
    token_map: Option<Arc<TokenMap>>,
}

impl ClusterSnapshot {
    pub(crate) fn new(hosts: Arc<Vec<Arc<Host>>>, token_map: Option<Arc<TokenMap>>) -> Self {
        Self { hosts, token_map }
    }

    /// Every known host, up or down, in insertion order.
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// The distinct replicas for a token, in ring order. Empty when token metadata is
    /// unavailable (for example under an unsupported partitioner).
    pub fn replicas(&self, token: Token) -> Vec<Arc<Host>> {
        match self.token_map {
            Some(ref map) => map.replicas(token),
            None => Vec::new(),
        }
    }
}

/// The shared cluster state: the host map plus the current token metadata.
#[derive(Debug)]
pub(crate) struct Cluster {
    pub(crate) hosts: HostMap,
    token_map: RwLock<Option<Arc<TokenMap>>>,
    replication_factor: usize,
}

impl Cluster {
    pub(crate) fn new(replication_factor: usize) -> Self {
        Self {
            hosts: HostMap::new(),
            token_map: RwLock::new(None),
            replication_factor,
        }
    }

    pub(crate) fn snapshot(&self) -> ClusterSnapshot {
        #[allow(clippy::unwrap_used)]
        let token_map = self.token_map.read().unwrap().clone();
        ClusterSnapshot::new(self.hosts.snapshot(), token_map)
    }

    /// Rebuilds the token ring from the current hosts. Called by the topology worker
    /// after metadata refreshes.
    pub(crate) fn rebuild_token_map(&self, partitioner: Option<&str>) {
        let map = match partitioner {
            Some(token::MURMUR3_PARTITIONER) | None => Some(Arc::new(TokenMap::build(
                &self.hosts.snapshot(),
                self.replication_factor,
            ))),
            // Unknown partitioner: token-aware routing quietly disables itself.
            Some(_) => None,
        };
        #[allow(clippy::unwrap_used)]
        let mut guard = self.token_map.write().unwrap();
        *guard = map;
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use super::{host::HostMetadata, pool::HostConnectionPool, ClusterSnapshot, Host};
    use crate::options::{ClientOptions, EndPoint};

    pub(crate) fn host_in_dc(name: &str, datacenter: &str, up: bool) -> Arc<Host> {
        let host = host_with_metadata(
            name,
            HostMetadata {
                datacenter: Some(datacenter.to_string()),
                ..Default::default()
            },
        );
        host.set_up(up);
        host
    }

    pub(crate) fn host_with_metadata(name: &str, metadata: HostMetadata) -> Arc<Host> {
        let options = ClientOptions::default();
        let endpoint = EndPoint::new(name, 9042);
        Arc::new(Host::new(
            endpoint.clone(),
            metadata,
            HostConnectionPool::new_for_test(endpoint, &options),
        ))
    }

    pub(crate) fn snapshot_of(hosts: Vec<Arc<Host>>) -> ClusterSnapshot {
        ClusterSnapshot::new(Arc::new(hosts), None)
    }

    pub(crate) fn snapshot_with_ring(
        hosts: Vec<Arc<Host>>,
        replication_factor: usize,
    ) -> ClusterSnapshot {
        let ring = super::token::TokenMap::build(&hosts, replication_factor);
        ClusterSnapshot::new(Arc::new(hosts), Some(Arc::new(ring)))
    }
}

#[cfg(test)]
mod test {
    use super::{test_util::*, *};

    #[test]
    fn host_map_preserves_insertion_order() {
        let map = HostMap::new();
        for name in ["c", "a", "b"] {
            assert!(map.insert(host_in_dc(name, "dc1", true)));
        }
        assert!(!map.insert(host_in_dc("a", "dc1", true)));

        let order: Vec<_> = map
            .snapshot()
            .iter()
            .map(|h| h.endpoint().host.clone())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn snapshots_survive_mutation() {
        let map = HostMap::new();
        map.insert(host_in_dc("a", "dc1", true));
        map.insert(host_in_dc("b", "dc1", true));

        let before = map.snapshot();
        map.remove(&EndPoint::new("a", 9042));

        assert_eq!(before.len(), 2);
        assert_eq!(map.snapshot().len(), 1);
    }
}
