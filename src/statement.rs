//! Statements, batches, and per-request execution options.

use std::{sync::Arc, time::Duration};

use crate::{
    cluster::Token,
    options::{Consistency, EndPoint},
    policies::RetryPolicy,
    prepared::PreparedStatement,
};

/// A CQL value already encoded for the wire, or null. The driver deliberately keeps
/// parameter encoding thin; richer codecs live outside the core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Value(pub(crate) Option<Vec<u8>>);

impl Value {
    /// An SQL-style null.
    pub fn null() -> Self {
        Value(None)
    }

    /// A raw, pre-encoded value.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Value(Some(bytes))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value(Some(v.to_be_bytes().to_vec()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value(Some(v.to_be_bytes().to_vec()))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value(Some(v.to_be_bytes().to_vec()))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value(Some(v.to_be_bytes().to_vec()))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value(Some(vec![u8::from(v)]))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value(Some(v.as_bytes().to_vec()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value(Some(v.into_bytes()))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value(Some(v))
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value(Some(v.as_bytes().to_vec()))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value(None),
        }
    }
}

/// The kinds of batches the protocol knows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchType {
    /// Atomic through the batch log (the default).
    Logged,
    /// No batch log; no atomicity across partitions.
    Unlogged,
    /// For counter updates only.
    Counter,
}

impl BatchType {
    pub(crate) fn as_wire(self) -> u8 {
        match self {
            BatchType::Logged => 0,
            BatchType::Unlogged => 1,
            BatchType::Counter => 2,
        }
    }
}

/// Per-request execution options, shared by statements and batches.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ExecutionOptions {
    /// Consistency level; the profile default applies when unset.
    pub consistency: Option<Consistency>,
    /// Serial consistency for LWT rounds.
    pub serial_consistency: Option<Consistency>,
    /// Page size (fetch size) for rows results.
    pub page_size: Option<i32>,
    /// Resume token from a previous page.
    pub paging_state: Option<Vec<u8>>,
    /// Prepare the query on first use and execute it prepared.
    pub prepare: bool,
    /// Whether the request can be safely applied twice.
    pub is_idempotent: bool,
    /// Explicit routing key for token-aware routing.
    pub routing_key: Option<Vec<u8>>,
    /// Indexes of bound values forming the partition key, for statements whose key
    /// the driver cannot infer.
    pub routing_indexes: Option<Vec<u16>>,
    /// Explicit token, overriding the routing key.
    pub token: Option<Token>,
    /// Opaque key/value bag forwarded to the server.
    pub custom_payload: Vec<(String, Vec<u8>)>,
    /// Pin the request to one host, bypassing the load balancing policy.
    pub host: Option<EndPoint>,
    /// Per-attempt read timeout override.
    pub read_timeout: Option<Duration>,
    /// Retry policy override.
    pub retry: Option<Arc<dyn RetryPolicy>>,
    /// Keyspace the statement routes against (for token metadata lookups).
    pub keyspace: Option<String>,
    /// Name of a client-registered execution profile to apply.
    pub execution_profile: Option<String>,
    /// Ask the server to trace this request.
    pub trace_query: bool,
    /// Explicit write timestamp in microseconds.
    pub timestamp: Option<i64>,
}

pub(crate) const PROXY_EXECUTE_PAYLOAD_KEY: &str = "ProxyExecute";

/// One executable statement: a query string or a prepared statement, its bound
/// values, and execution options.
#[derive(Clone, Debug)]
pub struct Statement {
    pub(crate) kind: StatementKind,
    pub(crate) values: Vec<Value>,
    pub(crate) options: ExecutionOptions,
}

#[derive(Clone, Debug)]
pub(crate) enum StatementKind {
    Simple { query: String },
    Prepared { prepared: PreparedStatement },
}

impl Statement {
    /// A simple (unprepared) statement.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Simple {
                query: query.into(),
            },
            values: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }

    /// Binds positional values.
    pub fn bind(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.values = values.into_iter().collect();
        self
    }

    /// Sets the consistency level.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.options.consistency = Some(consistency);
        self
    }

    /// Sets the serial consistency level.
    pub fn serial_consistency(mut self, consistency: Consistency) -> Self {
        self.options.serial_consistency = Some(consistency);
        self
    }

    /// Sets the page size.
    pub fn page_size(mut self, page_size: i32) -> Self {
        self.options.page_size = Some(page_size);
        self
    }

    /// Resumes from a paging state returned by a previous result.
    pub fn paging_state(mut self, paging_state: Vec<u8>) -> Self {
        self.options.paging_state = Some(paging_state);
        self
    }

    /// Prepares the query on first use.
    pub fn prepare(mut self) -> Self {
        self.options.prepare = true;
        self
    }

    /// Declares the request idempotent, unlocking speculative execution and
    /// unconditional retries.
    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.options.is_idempotent = is_idempotent;
        self
    }

    /// Sets an explicit routing key for token-aware routing.
    pub fn routing_key(mut self, routing_key: Vec<u8>) -> Self {
        self.options.routing_key = Some(routing_key);
        self
    }

    /// Names the bound values that form the partition key, by position.
    pub fn routing_indexes(mut self, indexes: Vec<u16>) -> Self {
        self.options.routing_indexes = Some(indexes);
        self
    }

    /// Selects a named execution profile registered on the client.
    pub fn execution_profile(mut self, name: impl Into<String>) -> Self {
        self.options.execution_profile = Some(name.into());
        self
    }

    /// Attaches a custom payload entry.
    pub fn custom_payload(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.options.custom_payload.push((key.into(), value));
        self
    }

    /// Runs the request as another user via the `ProxyExecute` payload.
    pub fn execute_as(self, user: impl AsRef<str>) -> Self {
        let user = user.as_ref().as_bytes().to_vec();
        self.custom_payload(PROXY_EXECUTE_PAYLOAD_KEY, user)
    }

    /// Pins the request to one host.
    pub fn host(mut self, endpoint: EndPoint) -> Self {
        self.options.host = Some(endpoint);
        self
    }

    /// Overrides the per-attempt read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = Some(timeout);
        self
    }

    /// Overrides the retry policy.
    pub fn retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.options.retry = Some(policy);
        self
    }

    /// Sets the keyspace used for routing metadata.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.options.keyspace = Some(keyspace.into());
        self
    }

    /// Requests server-side tracing.
    pub fn trace(mut self) -> Self {
        self.options.trace_query = true;
        self
    }

    /// Sets an explicit write timestamp.
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.options.timestamp = Some(timestamp);
        self
    }

    /// The token this statement routes to, if it can be derived.
    pub(crate) fn routing_token(&self) -> Option<Token> {
        if let Some(token) = self.options.token {
            return Some(token);
        }
        if let Some(ref key) = self.options.routing_key {
            return Some(Token::from_routing_key(key));
        }
        if let Some(ref indexes) = self.options.routing_indexes {
            let key = compose_routing_key(indexes, &self.values)?;
            return Some(Token::from_routing_key(&key));
        }
        if let StatementKind::Prepared { ref prepared } = self.kind {
            let key = compose_routing_key(&prepared.pk_indexes, &self.values)?;
            return Some(Token::from_routing_key(&key));
        }
        None
    }

    pub(crate) fn query_text(&self) -> &str {
        match self.kind {
            StatementKind::Simple { ref query } => query,
            StatementKind::Prepared { ref prepared } => &prepared.text,
        }
    }
}

impl From<&PreparedStatement> for Statement {
    fn from(prepared: &PreparedStatement) -> Self {
        Self {
            kind: StatementKind::Prepared {
                prepared: prepared.clone(),
            },
            values: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }
}

/// The partition key as the partitioner sees it: the single component's bytes, or
/// for composite keys each component as u16 length + bytes + zero byte.
fn compose_routing_key(pk_indexes: &[u16], values: &[Value]) -> Option<Vec<u8>> {
    if pk_indexes.is_empty() {
        return None;
    }
    if pk_indexes.len() == 1 {
        let Value(bytes) = values.get(pk_indexes[0] as usize)?;
        return bytes.clone();
    }
    let mut key = Vec::new();
    for index in pk_indexes {
        let Value(bytes) = values.get(*index as usize)?;
        let component = bytes.as_deref()?;
        key.extend_from_slice(&(component.len() as u16).to_be_bytes());
        key.extend_from_slice(component);
        key.push(0);
    }
    Some(key)
}

/// A group of statements executed as one BATCH request.
#[derive(Clone, Debug)]
pub struct Batch {
    pub(crate) batch_type: BatchType,
    pub(crate) statements: Vec<Statement>,
    pub(crate) options: ExecutionOptions,
}

impl Batch {
    /// A new batch of the given type.
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }

    /// Appends a statement. Its per-statement options are ignored; the batch's
    /// options govern the request.
    pub fn add(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Sets the consistency level.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.options.consistency = Some(consistency);
        self
    }

    /// Sets the serial consistency level.
    pub fn serial_consistency(mut self, consistency: Consistency) -> Self {
        self.options.serial_consistency = Some(consistency);
        self
    }

    /// Declares every statement in the batch idempotent.
    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.options.is_idempotent = is_idempotent;
        self
    }

    /// Sets an explicit write timestamp for the whole batch.
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.options.timestamp = Some(timestamp);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_component_routing_key_is_the_raw_value() {
        let key = compose_routing_key(&[0], &[Value::from(7i32)]).unwrap();
        assert_eq!(key, 7i32.to_be_bytes().to_vec());
    }

    #[test]
    fn composite_routing_key_frames_each_component() {
        let key = compose_routing_key(&[0, 1], &[Value::from("ab"), Value::from(1i32)]).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&2u16.to_be_bytes());
        expected.extend_from_slice(b"ab");
        expected.push(0);
        expected.extend_from_slice(&4u16.to_be_bytes());
        expected.extend_from_slice(&1i32.to_be_bytes());
        expected.push(0);
        assert_eq!(key, expected);
    }

    #[test]
    fn null_partition_key_component_disables_routing() {
        assert_eq!(compose_routing_key(&[0], &[Value::null()]), None);
        assert_eq!(compose_routing_key(&[0, 1], &[Value::from(1i32)]), None);
    }

    #[test]
    fn explicit_token_wins_over_routing_key() {
        let statement = Statement::new("SELECT * FROM t WHERE k = ?");
        assert_eq!(statement.routing_token(), None);

        let mut statement = statement.routing_key(vec![1, 2, 3]);
        statement.options.token = Some(Token(42));
        assert_eq!(statement.routing_token(), Some(Token(42)));
    }
}
