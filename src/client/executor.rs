//! The request handler: drives one application request through the query plan,
//! consulting the retry and speculative execution policies until a result is
//! delivered or every host has failed.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, trace};

use super::Client;
use crate::{
    cluster::Host,
    connection::{Connection, SendOptions},
    error::{DbError, Error, ErrorKind, NoHostAvailableError, Result},
    frame::{
        request::{BatchRequest, BatchStatement, QueryParameters, Request},
        response::{CqlResult, ParsedResponse, Response},
    },
    options::{Consistency, EndPoint, ExecutionProfile},
    policies::{QueryPlan, RequestInfo, RetryContext, RetryDecision, RetryPolicy},
    results::QueryResult,
    statement::{Batch, ExecutionOptions, Statement, StatementKind},
};

/// What one request (statement or batch) looks like to the handler.
#[derive(Clone, Copy)]
pub(crate) enum Payload<'a> {
    Statement(&'a Statement),
    Batch(&'a Batch),
}

impl<'a> Payload<'a> {
    fn options(&self) -> &'a ExecutionOptions {
        match *self {
            Payload::Statement(s) => &s.options,
            Payload::Batch(b) => &b.options,
        }
    }

    fn routing(&self) -> RequestInfo {
        match *self {
            Payload::Statement(s) => RequestInfo {
                keyspace: s.options.keyspace.clone(),
                token: s.routing_token(),
            },
            Payload::Batch(b) => RequestInfo {
                keyspace: b.options.keyspace.clone(),
                token: b
                    .statements
                    .first()
                    .and_then(|s| s.routing_token()),
            },
        }
    }
}

/// State shared between the sibling executions of one request.
struct ExecutionState {
    /// The single-pass query plan; executions pull their next host from it.
    plan: Mutex<QueryPlan>,
    /// Per-host failures, accumulated across every execution and attempt.
    errors: Mutex<Vec<(EndPoint, Error)>>,
    /// Retries performed so far, counted only when the policy decided to retry.
    nb_retry: AtomicU32,
}

impl ExecutionState {
    fn next_host(&self) -> Option<Arc<Host>> {
        #[allow(clippy::unwrap_used)]
        self.plan.lock().unwrap().next()
    }

    fn record(&self, endpoint: &EndPoint, error: Error) {
        #[allow(clippy::unwrap_used)]
        self.errors.lock().unwrap().push((endpoint.clone(), error));
    }

    fn no_host_available(&self) -> Error {
        #[allow(clippy::unwrap_used)]
        let errors = self.errors.lock().unwrap().clone();
        NoHostAvailableError { errors }.into()
    }
}

enum ExecutionOutcome {
    Done(QueryResult),
    Fatal(Error),
    Exhausted,
}

impl Client {
    /// Runs a request to completion: plans, attempts, retries, and speculates.
    pub(crate) async fn run_request(&self, payload: Payload<'_>) -> Result<QueryResult> {
        let options = payload.options();
        let profile = self.resolve_profile(options)?;
        let state = Arc::new(ExecutionState {
            plan: Mutex::new(self.new_plan(&payload)?),
            errors: Mutex::new(Vec::new()),
            nb_retry: AtomicU32::new(0),
        });

        // Non-idempotent requests never speculate.
        let mut speculative = if options.is_idempotent {
            Some(
                self.inner
                    .options
                    .speculative_execution
                    .new_plan(options.keyspace.as_deref()),
            )
        } else {
            None
        };

        let mut executions = FuturesUnordered::new();
        executions.push(self.run_execution(Arc::clone(&state), payload, &profile));

        // One timer is reused for every speculative tick; it is re-armed after each
        // firing with the plan's next delay.
        let tick = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(tick);
        let mut tick_armed = match speculative.as_mut().and_then(|plan| plan.next_execution()) {
            Some(delay) => {
                tick.as_mut().reset(tokio::time::Instant::now() + delay);
                true
            }
            None => false,
        };

        loop {
            if executions.is_empty() {
                return Err(state.no_host_available());
            }

            let outcome = tokio::select! {
                Some(outcome) = executions.next() => Some(outcome),
                _ = &mut tick, if tick_armed => {
                    trace!("starting speculative execution");
                    executions.push(self.run_execution(Arc::clone(&state), payload, &profile));
                    match speculative.as_mut().and_then(|plan| plan.next_execution()) {
                        Some(delay) => {
                            tick.as_mut().reset(tokio::time::Instant::now() + delay);
                        }
                        None => tick_armed = false,
                    }
                    None
                }
            };

            match outcome {
                // First completion wins; dropping the rest cancels them.
                Some(ExecutionOutcome::Done(result)) => return Ok(result),
                Some(ExecutionOutcome::Fatal(error)) => return Err(error),
                Some(ExecutionOutcome::Exhausted) | None => {}
            }
        }
    }

    fn new_plan(&self, payload: &Payload<'_>) -> Result<QueryPlan> {
        let options = payload.options();
        let snapshot = self.inner.cluster.snapshot();

        // A pinned host bypasses the load balancing policy entirely.
        if let Some(ref endpoint) = options.host {
            let host = self.inner.cluster.hosts.get(endpoint).ok_or_else(|| {
                Error::invalid_argument(format!("host {} is not part of the cluster", endpoint))
            })?;
            return Ok(Box::new(std::iter::once(host)));
        }

        Ok(self
            .inner
            .options
            .load_balancing
            .new_query_plan(&payload.routing(), &snapshot))
    }

    /// One execution: walks the shared plan host by host until a result, a fatal
    /// error, or exhaustion.
    async fn run_execution(
        &self,
        state: Arc<ExecutionState>,
        payload: Payload<'_>,
        profile: &Option<ExecutionProfile>,
    ) -> ExecutionOutcome {
        let options = payload.options();
        let retry_policy: Arc<dyn RetryPolicy> = options
            .retry
            .clone()
            .or_else(|| profile.as_ref().and_then(|p| p.retry.clone()))
            .unwrap_or_else(|| Arc::clone(&self.inner.options.retry));
        let ctx = RetryContext {
            is_idempotent: options.is_idempotent,
        };
        let mut consistency_override: Option<Consistency> = None;

        'plan: while let Some(host) = state.next_host() {
            'host: loop {
                let connection = match host.pool().borrow() {
                    Ok(connection) => connection,
                    Err(error) => {
                        trace!(endpoint = %host.endpoint(), %error, "host not usable, advancing plan");
                        if !error.is_busy() {
                            // An empty pool heals in the background while the plan
                            // moves on.
                            let pool = host.pool().clone();
                            crate::runtime::spawn(async move {
                                let _ = pool.ensure().await;
                            });
                        }
                        state.record(host.endpoint(), error);
                        continue 'plan;
                    }
                };

                match self
                    .attempt(&connection, payload, profile, consistency_override)
                    .await
                {
                    Ok(result) => return ExecutionOutcome::Done(result),
                    Err(error) => {
                        if error.is_fatal_for_request() {
                            return ExecutionOutcome::Fatal(error);
                        }

                        let nb_retry = state.nb_retry.load(Ordering::SeqCst);
                        let decision = decide(&retry_policy, &ctx, &error, nb_retry);
                        debug!(
                            endpoint = %host.endpoint(),
                            %error,
                            ?decision,
                            nb_retry,
                            "attempt failed"
                        );
                        state.record(host.endpoint(), error.clone());

                        match decision {
                            RetryDecision::Retry {
                                consistency,
                                use_current_host,
                            } => {
                                state.nb_retry.fetch_add(1, Ordering::SeqCst);
                                if let Some(consistency) = consistency {
                                    consistency_override = Some(consistency);
                                }
                                if use_current_host {
                                    // Re-borrow from the same host; if it has no
                                    // usable connection the loop above falls through
                                    // to the next host.
                                    continue 'host;
                                }
                                continue 'plan;
                            }
                            RetryDecision::Rethrow => return ExecutionOutcome::Fatal(error),
                            RetryDecision::Ignore => {
                                return ExecutionOutcome::Done(QueryResult::empty(
                                    connection.endpoint().clone(),
                                ))
                            }
                        }
                    }
                }
            }
        }

        ExecutionOutcome::Exhausted
    }

    /// One attempt on one connection, including the transparent re-prepare on
    /// `unprepared` responses.
    async fn attempt(
        &self,
        connection: &Connection,
        payload: Payload<'_>,
        profile: &Option<ExecutionProfile>,
        consistency_override: Option<Consistency>,
    ) -> Result<QueryResult> {
        let options = payload.options();
        let send_options = SendOptions {
            read_timeout: Some(
                options
                    .read_timeout
                    .or_else(|| profile.as_ref().and_then(|p| p.read_timeout))
                    .unwrap_or(self.inner.options.read_timeout),
            ),
            custom_payload: if options.custom_payload.is_empty() {
                None
            } else {
                Some(options.custom_payload.clone())
            },
            tracing: options.trace_query,
        };

        let request = self
            .build_request(connection, payload, profile, consistency_override, send_options.read_timeout)
            .await?;

        let response = match connection.send(request, send_options.clone()).await {
            Ok(response) => response,
            Err(error) if matches!(error.server_code(), Some(DbError::Unprepared { .. })) => {
                // The coordinator lost the prepared statement (for example after a
                // restart). Re-prepare on this very connection and replay once.
                self.re_prepare(connection, payload, send_options.read_timeout)
                    .await?;
                let request = self
                    .build_request(connection, payload, profile, consistency_override, send_options.read_timeout)
                    .await?;
                connection.send(request, send_options).await?
            }
            Err(error) => return Err(error),
        };

        into_query_result(response, connection.endpoint().clone())
    }

    async fn build_request(
        &self,
        connection: &Connection,
        payload: Payload<'_>,
        profile: &Option<ExecutionProfile>,
        consistency_override: Option<Consistency>,
        read_timeout: Option<Duration>,
    ) -> Result<Request> {
        match payload {
            Payload::Statement(statement) => {
                let parameters = self.parameters(statement, profile, consistency_override);
                match statement.kind {
                    StatementKind::Simple { ref query } if !statement.options.prepare => {
                        Ok(Request::Query {
                            query: query.clone(),
                            parameters,
                        })
                    }
                    _ => {
                        let id = self
                            .resolve_prepared(connection, statement.query_text(), read_timeout)
                            .await?;
                        Ok(Request::Execute { id, parameters })
                    }
                }
            }
            Payload::Batch(batch) => {
                let mut statements = Vec::with_capacity(batch.statements.len());
                for statement in &batch.statements {
                    let values: Vec<Option<Vec<u8>>> =
                        statement.values.iter().map(|v| v.0.clone()).collect();
                    match statement.kind {
                        StatementKind::Simple { ref query } if !statement.options.prepare => {
                            statements.push(BatchStatement::Query {
                                query: query.clone(),
                                values,
                            });
                        }
                        _ => {
                            let id = self
                                .resolve_prepared(
                                    connection,
                                    statement.query_text(),
                                    read_timeout,
                                )
                                .await?;
                            statements.push(BatchStatement::Prepared { id, values });
                        }
                    }
                }
                Ok(Request::Batch(BatchRequest {
                    batch_type: batch.batch_type.as_wire(),
                    statements,
                    consistency: consistency_override
                        .or(batch.options.consistency)
                        .or_else(|| profile.as_ref().and_then(|p| p.consistency))
                        .unwrap_or(Consistency::LocalOne),
                    serial_consistency: batch
                        .options
                        .serial_consistency
                        .or_else(|| profile.as_ref().and_then(|p| p.serial_consistency)),
                    timestamp: self.timestamp_for(&batch.options),
                }))
            }
        }
    }

    fn parameters(
        &self,
        statement: &Statement,
        profile: &Option<ExecutionProfile>,
        consistency_override: Option<Consistency>,
    ) -> QueryParameters {
        QueryParameters {
            consistency: consistency_override
                .or(statement.options.consistency)
                .or_else(|| profile.as_ref().and_then(|p| p.consistency))
                .unwrap_or(Consistency::LocalOne),
            values: statement.values.iter().map(|v| v.0.clone()).collect(),
            skip_metadata: false,
            page_size: statement.options.page_size,
            paging_state: statement.options.paging_state.clone(),
            serial_consistency: statement
                .options
                .serial_consistency
                .or_else(|| profile.as_ref().and_then(|p| p.serial_consistency)),
            timestamp: self.timestamp_for(&statement.options),
        }
    }

    /// Looks up the statement's named execution profile. An unknown name is an
    /// argument error, raised before any host is tried.
    fn resolve_profile(&self, options: &ExecutionOptions) -> Result<Option<ExecutionProfile>> {
        match options.execution_profile {
            Some(ref name) => match self.inner.options.execution_profiles.get(name) {
                Some(profile) => Ok(Some(profile.clone())),
                None => Err(Error::invalid_argument(format!(
                    "unknown execution profile: {}",
                    name
                ))),
            },
            None => Ok(None),
        }
    }

    fn timestamp_for(&self, options: &ExecutionOptions) -> Option<i64> {
        options
            .timestamp
            .or_else(|| self.inner.options.timestamp_generator.next())
    }

    /// The query id of `text` on this connection, preparing it there on first use.
    async fn resolve_prepared(
        &self,
        connection: &Connection,
        text: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if let Some(id) = self.inner.prepared.binding(text, connection.id()) {
            return Ok(id);
        }
        let prepared = self
            .inner
            .prepared
            .prepare_on(connection, text, read_timeout)
            .await?;
        Ok(prepared.id)
    }

    /// Invalidates and re-prepares every prepared text of the payload on one
    /// connection.
    async fn re_prepare(
        &self,
        connection: &Connection,
        payload: Payload<'_>,
        read_timeout: Option<Duration>,
    ) -> Result<()> {
        let texts: Vec<&str> = match payload {
            Payload::Statement(statement) => vec![statement.query_text()],
            Payload::Batch(batch) => batch
                .statements
                .iter()
                .filter(|s| {
                    s.options.prepare || matches!(s.kind, StatementKind::Prepared { .. })
                })
                .map(|s| s.query_text())
                .collect(),
        };
        for text in texts {
            self.inner.prepared.invalidate(text, connection.id());
            self.inner
                .prepared
                .prepare_on(connection, text, read_timeout)
                .await?;
        }
        Ok(())
    }
}

/// Maps a driver error to the matching retry-policy callback.
fn decide(
    policy: &Arc<dyn RetryPolicy>,
    ctx: &RetryContext,
    error: &Error,
    nb_retry: u32,
) -> RetryDecision {
    match error.server_code() {
        Some(DbError::Unavailable {
            consistency,
            required,
            alive,
        }) => policy.on_unavailable(ctx, *consistency, *required, *alive, nb_retry),
        Some(DbError::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
        }) => policy.on_read_timeout(
            ctx,
            *consistency,
            *received,
            *block_for,
            *data_present,
            nb_retry,
        ),
        Some(DbError::WriteTimeout {
            consistency,
            received,
            block_for,
            ref write_type,
        }) => policy.on_write_timeout(
            ctx,
            *consistency,
            *received,
            *block_for,
            write_type,
            nb_retry,
        ),
        _ if error.tries_next_host()
            || error.is_network_error()
            || error.is_timeout()
            || matches!(error.kind.as_ref(), ErrorKind::ShuttingDown) =>
        {
            policy.on_request_error(ctx, error, nb_retry)
        }
        // Remaining server errors (read/write failures, function failures, ...) and
        // anything unclassified surface as-is.
        _ => RetryDecision::Rethrow,
    }
}

fn into_query_result(response: ParsedResponse, endpoint: EndPoint) -> Result<QueryResult> {
    let result = match response.kind {
        Response::Result(CqlResult::Rows(rows)) => QueryResult::from_rows(rows, endpoint),
        Response::Result(CqlResult::Void) => QueryResult::empty(endpoint),
        Response::Result(CqlResult::SetKeyspace(keyspace)) => {
            QueryResult::empty(endpoint).with_keyspace(keyspace)
        }
        Response::Result(CqlResult::SchemaChange(change)) => {
            QueryResult::empty(endpoint).with_schema_change(change)
        }
        Response::Result(CqlResult::Prepared(_)) => {
            return Err(Error::protocol("unexpected prepared result for a query"))
        }
        other => {
            return Err(Error::protocol(format!(
                "unexpected response to a query: {:?}",
                other
            )))
        }
    };
    Ok(result.with_envelope(response.tracing_id, response.warnings))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policies::{DefaultRetryPolicy, IdempotenceAwareRetryPolicy};
    use crate::error::ServerError;

    fn overloaded() -> Error {
        Error::new(ErrorKind::Server(ServerError {
            code: DbError::Overloaded,
            message: "coordinator overloaded".to_string(),
        }))
    }

    #[test]
    fn overloaded_rethrows_for_non_idempotent_requests() {
        let policy: Arc<dyn RetryPolicy> = Arc::new(IdempotenceAwareRetryPolicy::new(Arc::new(
            DefaultRetryPolicy,
        )));
        let decision = decide(
            &policy,
            &RetryContext {
                is_idempotent: false,
            },
            &overloaded(),
            0,
        );
        assert_eq!(decision, RetryDecision::Rethrow);

        let decision = decide(
            &policy,
            &RetryContext { is_idempotent: true },
            &overloaded(),
            0,
        );
        assert_eq!(decision, RetryDecision::retry_next_host());
    }

    #[test]
    fn read_timeout_errors_reach_the_read_timeout_callback() {
        let policy: Arc<dyn RetryPolicy> = Arc::new(DefaultRetryPolicy);
        let error = Error::new(ErrorKind::Server(ServerError {
            code: DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 2,
                block_for: 2,
                data_present: false,
            },
            message: "timed out".to_string(),
        }));
        let ctx = RetryContext {
            is_idempotent: false,
        };
        assert_eq!(
            decide(&policy, &ctx, &error, 0),
            RetryDecision::retry_current_host()
        );
        assert_eq!(decide(&policy, &ctx, &error, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn unclassified_server_errors_rethrow() {
        let policy: Arc<dyn RetryPolicy> = Arc::new(DefaultRetryPolicy);
        let error = Error::new(ErrorKind::Server(ServerError {
            code: DbError::SyntaxError,
            message: "syntax".to_string(),
        }));
        let ctx = RetryContext { is_idempotent: true };
        assert_eq!(decide(&policy, &ctx, &error, 0), RetryDecision::Rethrow);
    }
}
