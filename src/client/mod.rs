//! Contains the [`Client`] type and the request execution machinery behind it.

pub(crate) mod auth;
mod executor;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tracing::info;

use crate::{
    cluster::{control::{ControlConnection, ControlHandle}, Cluster},
    connection::ConnectionEstablisher,
    error::{ErrorKind, NoHostAvailableError, Result},
    options::ClientOptions,
    prepared::{PreparedCache, PreparedStatement},
    results::{QueryResult, Row},
    statement::{Batch, Statement},
};
use executor::Payload;

/// The entry point to the driver: a session holding connection pools to every
/// reachable coordinator of the cluster.
///
/// `Client` is cheap to clone; clones share the same pools, topology state, and
/// prepared-statement cache.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) options: Arc<ClientOptions>,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) prepared: Arc<PreparedCache>,
    establisher: ConnectionEstablisher,
    control: OnceCell<ControlHandle>,
    shutdown: AtomicBool,
}

impl Client {
    /// Creates a client. No connection is attempted until [`connect`](Client::connect)
    /// or the first request.
    pub fn new(options: ClientOptions) -> Result<Client> {
        options.validate()?;
        let options = Arc::new(options);
        Ok(Client {
            inner: Arc::new(ClientInner {
                cluster: Arc::new(Cluster::new(options.replication_factor)),
                prepared: Arc::new(PreparedCache::new()),
                establisher: ConnectionEstablisher::new(&options),
                control: OnceCell::new(),
                shutdown: AtomicBool::new(false),
                options,
            }),
        })
    }

    /// Creates a client and connects it to the cluster.
    pub async fn connect_with(options: ClientOptions) -> Result<Client> {
        let client = Client::new(options)?;
        client.connect().await?;
        Ok(client)
    }

    /// Connects to the cluster: establishes the control connection, discovers peers,
    /// and warms up the connection pools.
    ///
    /// Safe to call concurrently and repeatedly; all callers share a single
    /// initialization.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        self.inner
            .control
            .get_or_try_init(|| {
                ControlConnection::start(
                    Arc::clone(&self.inner.cluster),
                    Arc::clone(&self.inner.options),
                    self.inner.establisher.clone(),
                    Arc::clone(&self.inner.prepared),
                )
            })
            .await?;
        Ok(())
    }

    async fn connected(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(ErrorKind::Shutdown.into());
        }
        self.connect().await
    }

    /// Executes a statement and returns its result.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.connected().await?;
        self.run_request(Payload::Statement(statement)).await
    }

    /// Executes a plain query string with default options.
    pub async fn query(&self, cql: impl AsRef<str>) -> Result<QueryResult> {
        self.execute(&Statement::new(cql.as_ref())).await
    }

    /// Prepares a query, returning a handle that executes it prepared on any host.
    pub async fn prepare(&self, query: impl AsRef<str>) -> Result<PreparedStatement> {
        self.connected().await?;
        let query = query.as_ref();

        let snapshot = self.inner.cluster.snapshot();
        let plan = self
            .inner
            .options
            .load_balancing
            .new_query_plan(&Default::default(), &snapshot);

        let mut errors = Vec::new();
        for host in plan {
            let connection = match host.pool().borrow() {
                Ok(connection) => connection,
                Err(error) => {
                    errors.push((host.endpoint().clone(), error));
                    continue;
                }
            };
            match self
                .inner
                .prepared
                .prepare_on(&connection, query, Some(self.inner.options.read_timeout))
                .await
            {
                Ok(prepared) => {
                    return Ok(PreparedStatement {
                        text: query.to_string(),
                        pk_indexes: prepared.pk_indexes,
                    })
                }
                Err(error) => {
                    if error.is_fatal_for_request() {
                        return Err(error);
                    }
                    errors.push((host.endpoint().clone(), error));
                }
            }
        }
        Err(NoHostAvailableError { errors }.into())
    }

    /// Executes a batch of statements as one request.
    pub async fn batch(&self, batch: &Batch) -> Result<QueryResult> {
        self.connected().await?;
        self.run_request(Payload::Batch(batch)).await
    }

    /// Fetches the server-side trace of a request executed with
    /// [`Statement::trace`](crate::Statement::trace), using the tracing id from its
    /// [`QueryResult`].
    pub async fn query_trace(&self, tracing_id: uuid::Uuid) -> Result<crate::results::QueryTrace> {
        let sessions = self
            .execute(
                &Statement::new(
                    "SELECT request, coordinator, duration, started_at FROM \
                     system_traces.sessions WHERE session_id = ?",
                )
                .bind([tracing_id.into()])
                .consistency(crate::options::Consistency::One)
                .idempotent(true),
            )
            .await?;

        let mut trace = match sessions.rows().first() {
            Some(row) => crate::results::QueryTrace {
                request_type: row.get_str("request").map(str::to_string),
                coordinator: row.get_inet("coordinator"),
                duration_micros: row.get_i32("duration"),
                started_at: row.get_i64("started_at"),
                events: Vec::new(),
            },
            None => {
                return Err(crate::error::Error::invalid_argument(format!(
                    "no trace session {}",
                    tracing_id
                )))
            }
        };

        let events = self
            .execute(
                &Statement::new(
                    "SELECT activity, source, source_elapsed, thread FROM \
                     system_traces.events WHERE session_id = ?",
                )
                .bind([tracing_id.into()])
                .consistency(crate::options::Consistency::One)
                .idempotent(true),
            )
            .await?;
        trace.events = events
            .rows()
            .iter()
            .map(|row| crate::results::TraceEvent {
                activity: row.get_str("activity").map(str::to_string),
                source: row.get_inet("source"),
                source_elapsed: row.get_i32("source_elapsed"),
                thread: row.get_str("thread").map(str::to_string),
            })
            .collect();
        Ok(trace)
    }

    /// Returns a pager that fetches the statement's result page by page.
    pub fn execute_iter(&self, statement: Statement) -> QueryPager {
        QueryPager {
            client: self.clone(),
            statement,
            current: Vec::new().into_iter(),
            paging_state: None,
            started: false,
            finished: false,
        }
    }

    /// Shuts the client down: stops the topology worker, closes every connection, and
    /// rejects subsequent requests with a shutdown error. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down client");

        if let Some(control) = self.inner.control.get() {
            control.shutdown().await;
        }

        let pools: Vec<_> = self
            .inner
            .cluster
            .hosts
            .snapshot()
            .iter()
            .map(|host| host.pool().clone())
            .collect();
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
    }
}

/// Pages through a statement's results, refetching with the paging state as rows run
/// out.
#[derive(Debug)]
pub struct QueryPager {
    client: Client,
    statement: Statement,
    current: std::vec::IntoIter<Row>,
    paging_state: Option<Vec<u8>>,
    started: bool,
    finished: bool,
}

impl QueryPager {
    /// Adapts the pager into a [`Stream`](futures_core::Stream) of rows. The stream
    /// ends after the last page, or after yielding one error.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = Result<Row>> {
        futures_util::stream::unfold(self, |mut pager| async move {
            match pager.next_row().await {
                Ok(Some(row)) => Some((Ok(row), pager)),
                Ok(None) => None,
                Err(error) => {
                    pager.finished = true;
                    pager.current = Vec::new().into_iter();
                    Some((Err(error), pager))
                }
            }
        })
    }

    /// The next row, fetching the next page when the current one is exhausted.
    /// Returns `None` once every page was consumed.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.current.next() {
                return Ok(Some(row));
            }
            if self.finished {
                return Ok(None);
            }

            let mut statement = self.statement.clone();
            if self.started {
                match self.paging_state.take() {
                    Some(state) => statement.options.paging_state = Some(state),
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }

            let result = self.client.execute(&statement).await?;
            self.started = true;
            self.paging_state = result.paging_state().map(|s| s.to_vec());
            if self.paging_state.is_none() {
                self.finished = true;
            }
            self.current = result.into_rows().into_iter();
        }
    }
}
