//! The control connection: a single privileged session used for topology and schema
//! discovery, event subscription, and metadata refreshes.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Cluster, Host, HostMetadata, TopologyMessage};
use crate::{
    cluster::pool::HostConnectionPool,
    connection::{Connection, ConnectionEstablisher, SendOptions},
    error::{Error, NoHostAvailableError, Result},
    events::{
        HostAddedEvent,
        HostDownEvent,
        HostRemovedEvent,
        HostUpEvent,
    },
    frame::{
        request::{QueryParameters, Request},
        response::{
            CqlResult,
            Response,
            ServerEvent,
            StatusChangeType,
            TopologyChangeType,
        },
    },
    options::{ClientOptions, Consistency, EndPoint},
    prepared::PreparedCache,
    results::{QueryResult, Row},
    runtime::{self, ShutdownRequest},
};

const SELECT_LOCAL: &str = "SELECT * FROM system.local";
const SELECT_PEERS: &str = "SELECT * FROM system.peers";

/// How long bursts of topology events are coalesced before one refresh runs.
const TOPOLOGY_DEBOUNCE: Duration = Duration::from_millis(200);

const SUBSCRIBED_EVENTS: [&str; 3] = ["TOPOLOGY_CHANGE", "STATUS_CHANGE", "SCHEMA_CHANGE"];

/// Handle used by the client to reach the topology worker.
#[derive(Clone, Debug)]
pub(crate) struct ControlHandle {
    sender: mpsc::UnboundedSender<TopologyMessage>,
}

impl ControlHandle {
    pub(crate) async fn shutdown(&self) {
        let (request, done) = ShutdownRequest::channel();
        if self.sender.send(TopologyMessage::Shutdown(request)).is_ok() {
            done.wait().await;
        }
    }
}

pub(crate) struct ControlConnection {
    cluster: Arc<Cluster>,
    options: Arc<ClientOptions>,
    establisher: ConnectionEstablisher,
    prepared: Arc<PreparedCache>,
    sender: mpsc::UnboundedSender<TopologyMessage>,
    receiver: mpsc::UnboundedReceiver<TopologyMessage>,
    connection: Option<Connection>,
    control_host: Option<EndPoint>,
    reconnecting: bool,
}

impl ControlConnection {
    /// Connects to the first reachable contact point, performs the initial topology
    /// refresh and pool warmup, and starts the topology worker.
    pub(crate) async fn start(
        cluster: Arc<Cluster>,
        options: Arc<ClientOptions>,
        establisher: ConnectionEstablisher,
        prepared: Arc<PreparedCache>,
    ) -> Result<ControlHandle> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut control = ControlConnection {
            cluster,
            options,
            establisher,
            prepared,
            sender: sender.clone(),
            receiver,
            connection: None,
            control_host: None,
            reconnecting: false,
        };

        control.initial_connect().await?;
        control.refresh_hosts().await?;
        control.warm_up_pools().await;

        runtime::spawn(control.run());
        Ok(ControlHandle { sender })
    }

    async fn initial_connect(&mut self) -> Result<()> {
        let mut errors: Vec<(EndPoint, Error)> = Vec::new();
        let contact_points = self.options.contact_points.clone();
        for endpoint in &contact_points {
            match self.attach(endpoint).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(%endpoint, %error, "could not connect to contact point");
                    errors.push((endpoint.clone(), error));
                }
            }
        }
        Err(NoHostAvailableError { errors }.into())
    }

    /// Establishes a control session to `endpoint`, subscribes to events, and starts
    /// watching for its death.
    async fn attach(&mut self, endpoint: &EndPoint) -> Result<()> {
        let connection = connect_control(
            &self.establisher,
            &self.sender,
            self.options.read_timeout,
            endpoint,
        )
        .await?;
        info!(%endpoint, "control connection established");
        self.connection = Some(connection);
        self.control_host = Some(endpoint.clone());
        Ok(())
    }

    async fn run(mut self) {
        let mut pending_refresh = false;

        let shutdown_request = loop {
            let message = if pending_refresh {
                match runtime::timeout(TOPOLOGY_DEBOUNCE, self.receiver.recv()).await {
                    Some(message) => message,
                    None => {
                        pending_refresh = false;
                        if let Err(error) = self.refresh_hosts().await {
                            warn!(%error, "topology refresh failed");
                        }
                        continue;
                    }
                }
            } else {
                self.receiver.recv().await
            };

            let Some(message) = message else { break None };
            match message {
                TopologyMessage::PoolUp(endpoint) => self.handle_pool_up(endpoint).await,
                TopologyMessage::PoolDown(endpoint) => self.handle_pool_down(endpoint),
                TopologyMessage::Server(event) => {
                    pending_refresh |= self.handle_server_event(event).await;
                }
                TopologyMessage::ControlConnectionDead => self.handle_control_dead(),
                TopologyMessage::ControlReattached(connection, endpoint) => {
                    self.reconnecting = false;
                    self.install_reattached(connection, endpoint);
                    pending_refresh = true;
                }
                TopologyMessage::Shutdown(request) => break Some(request),
            }
        };

        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
        if let Some(request) = shutdown_request {
            request.complete();
        }
    }

    /// A pool opened its first connection to a host that was down: bring the host's
    /// prepared statements up to date, then flip it UP.
    async fn handle_pool_up(&mut self, endpoint: EndPoint) {
        let Some(host) = self.cluster.hosts.get(&endpoint) else {
            return;
        };
        if !self.prepared.texts().is_empty() {
            info!(
                "Re-preparing all queries on host {} before setting it as UP",
                endpoint
            );
            for connection in host.pool().connections() {
                if let Err(error) = self
                    .prepared
                    .re_prepare_all(&connection, Some(self.options.read_timeout))
                    .await
                {
                    warn!(%endpoint, %error, "re-preparation failed");
                }
            }
        }
        if host.set_up(true) {
            info!(%endpoint, "host is UP");
            self.emit(|handler| {
                handler.handle_host_up(HostUpEvent {
                    endpoint: endpoint.clone(),
                })
            });
        }
    }

    fn handle_pool_down(&mut self, endpoint: EndPoint) {
        let Some(host) = self.cluster.hosts.get(&endpoint) else {
            return;
        };
        if host.set_up(false) {
            info!(%endpoint, "host is DOWN");
            self.emit(|handler| {
                handler.handle_host_down(HostDownEvent {
                    endpoint: endpoint.clone(),
                })
            });
        }
    }

    /// Applies one pushed event. Returns whether a debounced topology refresh is
    /// wanted.
    async fn handle_server_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::TopologyChange {
                change_type,
                address,
            } => match change_type {
                TopologyChangeType::NewNode | TopologyChangeType::MovedNode => true,
                TopologyChangeType::RemovedNode => {
                    let endpoint = self.translate(address);
                    self.remove_host(&endpoint).await;
                    true
                }
            },
            ServerEvent::StatusChange {
                change_type,
                address,
            } => {
                let endpoint = self.translate(address);
                match change_type {
                    StatusChangeType::Up => {
                        if let Some(host) = self.cluster.hosts.get(&endpoint) {
                            // The UP transition itself happens when the pool reports
                            // its first live connection.
                            let pool = host.pool().clone();
                            runtime::spawn(async move {
                                let _ = pool.ensure().await;
                            });
                        }
                        false
                    }
                    StatusChangeType::Down => {
                        // Trust our own pools over gossip: only mark down hosts we
                        // have no connection to.
                        if let Some(host) = self.cluster.hosts.get(&endpoint) {
                            if host.pool().size() == 0 {
                                self.handle_pool_down(endpoint);
                            }
                        }
                        false
                    }
                }
            }
            ServerEvent::SchemaChange(change) => {
                debug!(?change, "schema change event");
                self.emit(|handler| handler.handle_schema_change(change.clone()));
                false
            }
        }
    }

    /// Kicks off control failover in the background, against the full host list.
    /// After reattaching the control connection stays where it landed; it never fails
    /// back to an earlier host.
    fn handle_control_dead(&mut self) {
        if self.reconnecting {
            return;
        }
        self.reconnecting = true;
        self.connection = None;
        warn!("control connection lost, reconnecting");

        let establisher = self.establisher.clone();
        let cluster = Arc::clone(&self.cluster);
        let contact_points = self.options.contact_points.clone();
        let reconnection = Arc::clone(&self.options.reconnection);
        let dead_host = self.control_host.take();
        let sender = self.sender.clone();

        let read_timeout = self.options.read_timeout;
        runtime::spawn(async move {
            let mut schedule = reconnection.new_schedule();
            loop {
                // Live hosts are preferred; the contact points are only a fallback
                // for when nothing is known to be up.
                let mut candidates: Vec<EndPoint> = cluster
                    .hosts
                    .snapshot()
                    .iter()
                    .filter(|h| h.is_up() && Some(h.endpoint()) != dead_host.as_ref())
                    .map(|h| h.endpoint().clone())
                    .collect();
                if candidates.is_empty() {
                    candidates = contact_points.clone();
                }

                for endpoint in candidates {
                    match connect_control(&establisher, &sender, read_timeout, &endpoint).await {
                        Ok(connection) => {
                            let _ = sender.send(TopologyMessage::ControlReattached(
                                connection, endpoint,
                            ));
                            return;
                        }
                        Err(error) => {
                            debug!(%endpoint, %error, "control failover candidate failed");
                        }
                    }
                }

                tokio::time::sleep(schedule.next_delay()).await;
            }
        });
    }

    /// Completes a control failover: adopts the new session and stays there, even if
    /// an earlier host comes back.
    fn install_reattached(&mut self, connection: Connection, endpoint: EndPoint) {
        info!(%endpoint, "control connection reattached");
        self.connection = Some(connection);
        self.control_host = Some(endpoint);
    }

    async fn remove_host(&mut self, endpoint: &EndPoint) {
        if let Some(host) = self.cluster.hosts.remove(endpoint) {
            info!(%endpoint, "host removed from cluster");
            host.pool().shutdown().await;
            self.emit(|handler| {
                handler.handle_host_removed(HostRemovedEvent {
                    endpoint: endpoint.clone(),
                })
            });
        }
    }

    /// Reloads `system.local` and `system.peers`, reconciling the host map, the
    /// distances, and the token metadata.
    async fn refresh_hosts(&mut self) -> Result<()> {
        let Some(connection) = self.connection.clone() else {
            return Err(Error::connection_closed("no control connection"));
        };
        let control_endpoint = connection.endpoint().clone();

        let local = self.query(&connection, SELECT_LOCAL).await?;
        let peers = self.query(&connection, SELECT_PEERS).await?;

        let mut seen = vec![control_endpoint.clone()];
        let partitioner = local
            .rows()
            .first()
            .and_then(|row| row.get_str("partitioner").map(str::to_string));

        // The control node itself comes from system.local.
        if let Some(row) = local.rows().first() {
            self.upsert_host(&control_endpoint, metadata_from_row(row)).await;
        }

        for row in peers.rows() {
            let Some(endpoint) = self.peer_endpoint(row, control_endpoint.port) else {
                warn!("skipping peer row without a usable address");
                continue;
            };
            self.upsert_host(&endpoint, metadata_from_row(row)).await;
            seen.push(endpoint);
        }

        // Forget hosts gossip no longer knows.
        let stale: Vec<EndPoint> = self
            .cluster
            .hosts
            .snapshot()
            .iter()
            .map(|h| h.endpoint().clone())
            .filter(|e| !seen.contains(e))
            .collect();
        for endpoint in stale {
            self.remove_host(&endpoint).await;
        }

        self.apply_distances().await;
        self.cluster.rebuild_token_map(partitioner.as_deref());
        debug!(hosts = self.cluster.hosts.snapshot().len(), "topology refreshed");
        Ok(())
    }

    async fn upsert_host(&mut self, endpoint: &EndPoint, metadata: HostMetadata) {
        if let Some(host) = self.cluster.hosts.get(endpoint) {
            host.update_metadata(metadata);
            return;
        }

        let pool = HostConnectionPool::new(
            endpoint.clone(),
            self.establisher.clone(),
            Arc::clone(&self.options.reconnection),
            Arc::clone(&self.prepared),
            self.sender.clone(),
        );
        let host = Arc::new(Host::new(endpoint.clone(), metadata, pool));
        // New hosts are assumed up; their pools prove otherwise.
        host.set_up(true);
        if self.cluster.hosts.insert(host) {
            info!(%endpoint, "host added to cluster");
            self.emit(|handler| {
                handler.handle_host_added(HostAddedEvent {
                    endpoint: endpoint.clone(),
                })
            });
        }
    }

    /// Applies the load balancing policy's distances to every pool.
    async fn apply_distances(&self) {
        for host in self.cluster.hosts.snapshot().iter() {
            let distance = self.options.load_balancing.distance(host);
            host.pool()
                .set_distance(distance, self.options.pool_size)
                .await;
        }
    }

    /// Opens the configured number of connections to every non-ignored host, in
    /// parallel. Partial failures leave the affected pools to their reconnection
    /// schedules.
    async fn warm_up_pools(&self) {
        let pools: Vec<(EndPoint, HostConnectionPool)> = self
            .cluster
            .hosts
            .snapshot()
            .iter()
            .map(|h| (h.endpoint().clone(), h.pool().clone()))
            .collect();

        let warmups = pools.into_iter().map(|(endpoint, pool)| async move {
            if let Err(error) = pool.ensure().await {
                warn!(%endpoint, %error, "pool warmup failed");
            }
        });
        futures_util::future::join_all(warmups).await;
    }

    async fn query(&self, connection: &Connection, cql: &str) -> Result<QueryResult> {
        let response = connection
            .send(
                Request::Query {
                    query: cql.to_string(),
                    parameters: QueryParameters {
                        consistency: Consistency::One,
                        ..Default::default()
                    },
                },
                SendOptions {
                    read_timeout: Some(self.options.read_timeout),
                    ..Default::default()
                },
            )
            .await?;

        match response.kind {
            Response::Result(CqlResult::Rows(rows)) => {
                Ok(QueryResult::from_rows(rows, connection.endpoint().clone()))
            }
            other => Err(Error::protocol(format!(
                "expected rows from {}, got {:?}",
                cql, other
            ))),
        }
    }

    fn peer_endpoint(&self, row: &Row, port: u16) -> Option<EndPoint> {
        let address = match row.get_inet("rpc_address") {
            Some(ip) if !ip.is_unspecified() => ip,
            // An unspecified rpc_address means "use the internal address".
            _ => row.get_inet("peer")?,
        };
        Some(self.translate(SocketAddr::new(address, port)))
    }

    fn translate(&self, address: SocketAddr) -> EndPoint {
        self.options.address_translator.translate(address)
    }

    fn emit(&self, f: impl Fn(&dyn crate::events::EventHandler)) {
        if let Some(ref handler) = self.options.event_handler {
            f(handler.as_ref());
        }
    }
}

/// Establishes a control session: connect, REGISTER for events, forward pushed events
/// into the topology queue, and watch for the session dying.
async fn connect_control(
    establisher: &ConnectionEstablisher,
    sender: &mpsc::UnboundedSender<TopologyMessage>,
    read_timeout: Duration,
    endpoint: &EndPoint,
) -> Result<Connection> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let connection = establisher.establish(endpoint, Some(event_tx)).await?;

    connection
        .send(
            Request::Register {
                events: SUBSCRIBED_EVENTS.iter().map(|s| s.to_string()).collect(),
            },
            SendOptions {
                read_timeout: Some(read_timeout),
                ..Default::default()
            },
        )
        .await?;

    let forward = sender.clone();
    runtime::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if forward.send(TopologyMessage::Server(event)).is_err() {
                break;
            }
        }
    });

    let notify = sender.clone();
    let watched = connection.clone();
    runtime::spawn(async move {
        let _ = watched.closed().await;
        let _ = notify.send(TopologyMessage::ControlConnectionDead);
    });

    Ok(connection)
}

fn metadata_from_row(row: &Row) -> HostMetadata {
    HostMetadata {
        datacenter: row.get_str("data_center").map(str::to_string),
        rack: row.get_str("rack").map(str::to_string),
        release_version: row.get_str("release_version").map(str::to_string),
        host_id: row.get_uuid("host_id"),
        tokens: row
            .get_string_collection("tokens")
            .unwrap_or_default()
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect(),
    }
}
