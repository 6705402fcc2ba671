//! Contains the types of results returned by a [`Client`](crate::Client) operation.

use std::{
    net::IpAddr,
    sync::Arc,
};

use uuid::Uuid;

use crate::{
    error::{Error, Result},
    frame::response::{RawRows, SchemaChangeEvent},
    options::EndPoint,
};

pub use crate::frame::response::{ColumnSpec, ColumnType};

/// The outcome of a successful request.
#[derive(Debug)]
#[non_exhaustive]
pub struct QueryResult {
    rows: Vec<Row>,
    columns: Arc<Vec<ColumnSpec>>,
    paging_state: Option<Vec<u8>>,
    keyspace: Option<String>,
    schema_change: Option<SchemaChangeEvent>,
    queried_host: EndPoint,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

impl QueryResult {
    pub(crate) fn empty(queried_host: EndPoint) -> Self {
        Self {
            rows: Vec::new(),
            columns: Arc::new(Vec::new()),
            paging_state: None,
            keyspace: None,
            schema_change: None,
            queried_host,
            tracing_id: None,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn from_rows(raw: RawRows, queried_host: EndPoint) -> Self {
        let columns = Arc::new(raw.metadata.columns);
        let rows = raw
            .rows
            .into_iter()
            .map(|values| Row {
                columns: Arc::clone(&columns),
                values,
            })
            .collect();
        Self {
            rows,
            columns,
            paging_state: raw.metadata.paging_state,
            keyspace: None,
            schema_change: None,
            queried_host,
            tracing_id: None,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn with_keyspace(mut self, keyspace: String) -> Self {
        self.keyspace = Some(keyspace);
        self
    }

    pub(crate) fn with_schema_change(mut self, change: SchemaChangeEvent) -> Self {
        self.schema_change = Some(change);
        self
    }

    pub(crate) fn with_envelope(
        mut self,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        self.tracing_id = tracing_id;
        self.warnings = warnings;
        self
    }

    /// The rows returned by the request; empty for non-rows results.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the result, yielding its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// The column metadata of a rows result.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// The token to pass back to fetch the next page, when more pages exist.
    pub fn paging_state(&self) -> Option<&[u8]> {
        self.paging_state.as_deref()
    }

    /// The keyspace set by a `USE` statement.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// The schema change produced by a DDL statement.
    pub fn schema_change(&self) -> Option<&SchemaChangeEvent> {
        self.schema_change.as_ref()
    }

    /// The coordinator that served the winning attempt.
    pub fn queried_host(&self) -> &EndPoint {
        &self.queried_host
    }

    /// The server-side tracing session id, when tracing was requested.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Warnings the coordinator attached to the response.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// One row of a rows result, with cells kept in wire encoding.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<Vec<ColumnSpec>>,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    /// The raw bytes of a cell by column name, or `None` for null cells and unknown
    /// columns.
    pub fn column_bytes(&self, name: &str) -> Option<&[u8]> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)?.as_deref()
    }

    /// The number of cells in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no cells.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decodes a text cell.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        std::str::from_utf8(self.column_bytes(name)?).ok()
    }

    /// Decodes an `int` cell.
    pub fn get_i32(&self, name: &str) -> Option<i32> {
        let bytes = self.column_bytes(name)?;
        Some(i32::from_be_bytes(bytes.try_into().ok()?))
    }

    /// Decodes a `bigint` cell.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        let bytes = self.column_bytes(name)?;
        Some(i64::from_be_bytes(bytes.try_into().ok()?))
    }

    /// Decodes a `uuid` or `timeuuid` cell.
    pub fn get_uuid(&self, name: &str) -> Option<Uuid> {
        let bytes: [u8; 16] = self.column_bytes(name)?.try_into().ok()?;
        Some(Uuid::from_bytes(bytes))
    }

    /// Decodes an `inet` cell (raw 4- or 16-byte address).
    pub fn get_inet(&self, name: &str) -> Option<IpAddr> {
        match self.column_bytes(name)? {
            bytes if bytes.len() == 4 => {
                let octets: [u8; 4] = bytes.try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            bytes if bytes.len() == 16 => {
                let octets: [u8; 16] = bytes.try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            _ => None,
        }
    }

    /// Decodes a `set<text>` or `list<text>` cell.
    pub fn get_string_collection(&self, name: &str) -> Option<Vec<String>> {
        decode_string_collection(self.column_bytes(name)?).ok()
    }
}

/// A server-side trace of one request, read back from `system_traces`.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct QueryTrace {
    /// What kind of request was traced.
    pub request_type: Option<String>,
    /// The coordinator that served the request.
    pub coordinator: Option<IpAddr>,
    /// Total server-side duration in microseconds.
    pub duration_micros: Option<i32>,
    /// When the request started, in milliseconds since the epoch.
    pub started_at: Option<i64>,
    /// The individual trace events, in order.
    pub events: Vec<TraceEvent>,
}

/// One event of a query trace.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TraceEvent {
    /// What happened.
    pub activity: Option<String>,
    /// The node the event happened on.
    pub source: Option<IpAddr>,
    /// Microseconds elapsed on the source when the event was recorded.
    pub source_elapsed: Option<i32>,
    /// The thread the event was recorded on.
    pub thread: Option<String>,
}

/// Collections are encoded as an `int` element count followed by `int`-length-framed
/// elements.
fn decode_string_collection(bytes: &[u8]) -> Result<Vec<String>> {
    let mut cursor = bytes;
    let mut read_i32 = |cursor: &mut &[u8]| -> Result<i32> {
        if cursor.len() < 4 {
            return Err(Error::protocol("collection cell ended early"));
        }
        let (head, tail) = cursor.split_at(4);
        *cursor = tail;
        #[allow(clippy::unwrap_used)]
        Ok(i32::from_be_bytes(head.try_into().unwrap()))
    };

    let count = read_i32(&mut cursor)?;
    let mut out = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let len = read_i32(&mut cursor)?;
        if len < 0 {
            continue;
        }
        let len = len as usize;
        if cursor.len() < len {
            return Err(Error::protocol("collection cell ended early"));
        }
        let (head, tail) = cursor.split_at(len);
        cursor = tail;
        out.push(
            String::from_utf8(head.to_vec())
                .map_err(|_| Error::protocol("collection element is not valid UTF-8"))?,
        );
    }
    Ok(out)
}
