use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use uuid::Uuid;

use crate::{cluster::pool::HostConnectionPool, options::EndPoint};

/// The load balancing policy's classification of a host, which also determines its
/// pool size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostDistance {
    /// Same datacenter; gets the `local` pool size.
    Local,
    /// Another datacenter; gets the `remote` pool size.
    Remote,
    /// Never queried; holds no connections.
    Ignored,
}

/// What `system.local`/`system.peers` report about a node.
#[derive(Clone, Debug, Default)]
pub(crate) struct HostMetadata {
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) release_version: Option<String>,
    pub(crate) host_id: Option<Uuid>,
    pub(crate) tokens: Vec<i64>,
}

/// One coordinator node, with its single connection pool.
///
/// The endpoint (after address translation) uniquely identifies a host; the topology
/// worker is the only writer of metadata and liveness, which keeps `is_up` transitions
/// serialized.
pub struct Host {
    endpoint: EndPoint,
    metadata: RwLock<HostMetadata>,
    up: AtomicBool,
    pool: HostConnectionPool,
}

impl Host {
    pub(crate) fn new(endpoint: EndPoint, metadata: HostMetadata, pool: HostConnectionPool) -> Self {
        Self {
            endpoint,
            metadata: RwLock::new(metadata),
            up: AtomicBool::new(false),
            pool,
        }
    }

    /// The translated address the driver connects to.
    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// The datacenter reported by the cluster, if known.
    pub fn datacenter(&self) -> Option<String> {
        self.read_metadata(|m| m.datacenter.clone())
    }

    /// The rack reported by the cluster, if known.
    pub fn rack(&self) -> Option<String> {
        self.read_metadata(|m| m.rack.clone())
    }

    /// The Cassandra release version reported by the cluster, if known.
    pub fn release_version(&self) -> Option<String> {
        self.read_metadata(|m| m.release_version.clone())
    }

    /// The cluster-assigned host id, if known.
    pub fn host_id(&self) -> Option<Uuid> {
        self.read_metadata(|m| m.host_id)
    }

    /// Whether the host currently has (or is assumed to have) at least one live
    /// connection.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub(crate) fn tokens(&self) -> Vec<i64> {
        self.read_metadata(|m| m.tokens.clone())
    }

    pub(crate) fn pool(&self) -> &HostConnectionPool {
        &self.pool
    }

    /// Marks the host up or down, returning whether the flag changed. Called only
    /// from the topology worker.
    pub(crate) fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::SeqCst) != up
    }

    pub(crate) fn update_metadata(&self, metadata: HostMetadata) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.metadata.write().unwrap();
        *guard = metadata;
    }

    fn read_metadata<T>(&self, f: impl FnOnce(&HostMetadata) -> T) -> T {
        #[allow(clippy::unwrap_used)]
        let guard = self.metadata.read().unwrap();
        f(&guard)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("endpoint", &self.endpoint)
            .field("datacenter", &self.datacenter())
            .field("up", &self.is_up())
            .finish_non_exhaustive()
    }
}
