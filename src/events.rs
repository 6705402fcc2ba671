//! Typed cluster events surfaced to applications.

use crate::options::EndPoint;

pub use crate::frame::response::SchemaChangeEvent;

/// Event emitted when a host transitions to UP.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HostUpEvent {
    /// The address of the host.
    pub endpoint: EndPoint,
}

/// Event emitted when a host transitions to DOWN.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HostDownEvent {
    /// The address of the host.
    pub endpoint: EndPoint,
}

/// Event emitted when a new host joins the cluster.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HostAddedEvent {
    /// The address of the host.
    pub endpoint: EndPoint,
}

/// Event emitted when a host leaves the cluster.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HostRemovedEvent {
    /// The address of the host.
    pub endpoint: EndPoint,
}

/// Applications implement this to observe cluster state changes. All methods default
/// to no-ops; implement only the ones of interest.
///
/// Handlers are called from driver worker tasks and must not block.
pub trait EventHandler: Send + Sync {
    /// A host transitioned to UP.
    fn handle_host_up(&self, _event: HostUpEvent) {}

    /// A host transitioned to DOWN.
    fn handle_host_down(&self, _event: HostDownEvent) {}

    /// A host joined the cluster.
    fn handle_host_added(&self, _event: HostAddedEvent) {}

    /// A host left the cluster.
    fn handle_host_removed(&self, _event: HostRemovedEvent) {}

    /// The schema changed.
    fn handle_schema_change(&self, _event: SchemaChangeEvent) {}
}
