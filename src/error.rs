//! Contains the `Error` and `Result` types that `cassandra` uses.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use thiserror::Error;

use crate::options::{Consistency, EndPoint};

/// The result type for all methods that can return an error in the `cassandra` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `cassandra` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is boxed to keep `Error` cheap to move; I/O errors
/// are reference counted so that `Error` stays `Clone` and a single failure can be
/// delivered to every waiter on a connection.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    /// Creates an authentication error for the given mechanism with the provided reason.
    pub(crate) fn authentication_error(mechanism_name: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism_name, reason),
        }
        .into()
    }

    /// A malformed or unexpected frame. Always connection-fatal.
    pub(crate) fn protocol(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn connection_closed(message: impl Into<String>) -> Error {
        ErrorKind::ConnectionClosed {
            message: message.into(),
        }
        .into()
    }

    #[allow(unused)]
    pub(crate) fn with_source<E: Into<Option<Error>>>(mut self, source: E) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    #[allow(unused)]
    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
            || matches!(self.server_code(), Some(DbError::AuthenticationError))
    }

    pub(crate) fn is_busy(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionBusy)
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionClosed { .. }
        )
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::OperationTimedOut { .. })
    }

    /// Whether this error originated from a server ERROR response.
    #[allow(unused)]
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Server(_))
    }

    /// Errors that poison the whole plan rather than a single host: retrying the same
    /// statement elsewhere cannot succeed.
    pub(crate) fn is_fatal_for_request(&self) -> bool {
        match self.server_code() {
            Some(DbError::SyntaxError)
            | Some(DbError::Unauthorized)
            | Some(DbError::Invalid)
            | Some(DbError::AlreadyExists { .. })
            | Some(DbError::ConfigError) => true,
            _ => matches!(self.kind.as_ref(), ErrorKind::Authentication { .. }),
        }
    }

    /// Host-level errors that advance the query plan without consulting the retry
    /// policy's timeout/unavailable callbacks.
    pub(crate) fn tries_next_host(&self) -> bool {
        matches!(
            self.server_code(),
            Some(DbError::Overloaded)
                | Some(DbError::IsBootstrapping)
                | Some(DbError::TruncateError)
                | Some(DbError::ServerError)
        )
    }

    /// The server error payload, if this error is an ERROR response.
    pub(crate) fn server_code(&self) -> Option<&DbError> {
        match self.kind.as_ref() {
            ErrorKind::Server(e) => Some(&e.code),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl From<ServerError> for ErrorKind {
    fn from(err: ServerError) -> Self {
        Self::Server(err)
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while the driver attempted to authenticate a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server sent a malformed or unexpected frame. Connection-fatal: every pending
    /// request on the connection is failed with this error.
    #[error("Protocol error: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The server returned an ERROR response to a request.
    #[error("Server error: {0}")]
    Server(ServerError),

    /// All stream ids on the connection are in use.
    #[error("Connection is busy: no stream id available")]
    ConnectionBusy,

    /// The connection was closed (RST/FIN or defuncted) while requests were pending.
    #[error("Connection closed: {message}")]
    #[non_exhaustive]
    ConnectionClosed { message: String },

    /// The per-attempt read timeout elapsed before a response arrived. The stream id
    /// stays reserved until the late response shows up or the connection is defuncted.
    #[error("Operation timed out waiting for a response from {endpoint}")]
    #[non_exhaustive]
    OperationTimedOut { endpoint: EndPoint },

    /// The connection is draining and refused the request.
    #[error("Connection is shutting down")]
    ShuttingDown,

    /// Every host in the query plan was tried and failed.
    #[error("{0}")]
    NoHostAvailable(NoHostAvailableError),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// A method was called on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

/// Aggregated per-host failures surfaced when a query plan is exhausted.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct NoHostAvailableError {
    /// The error observed on each host that was tried, in plan order. Empty when the
    /// plan yielded no hosts at all.
    pub errors: Vec<(EndPoint, Error)>,
}

impl Display for NoHostAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "No host was tried (query plan was empty)");
        }
        write!(
            f,
            "All {} host(s) tried for query failed (",
            self.errors.len()
        )?;
        for (i, (endpoint, error)) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", endpoint, error)?;
        }
        write!(f, ")")
    }
}

impl From<NoHostAvailableError> for Error {
    fn from(err: NoHostAvailableError) -> Self {
        Error::new(ErrorKind::NoHostAvailable(err))
    }
}

/// An ERROR response from a coordinator, categorized by its error code.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerError {
    /// The categorized error code and its payload.
    pub code: DbError,

    /// The human-readable message sent by the server.
    pub message: String,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes returned by the server, with their code-specific payloads.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum DbError {
    ServerError,
    ProtocolError,
    AuthenticationError,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: WriteType,
    },
    SyntaxError,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    /// The coordinator does not know the query id in an EXECUTE. Invalidates the
    /// prepared binding for that connection only.
    Unprepared {
        id: Vec<u8>,
    },
    /// A code this driver version does not know about.
    Other(i32),
}

impl DbError {
    /// The numeric error code as it appears on the wire.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// The type of write reported in a WriteTimeout or WriteFailure error.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    pub(crate) fn parse(s: &str) -> WriteType {
        match s {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_string()),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(s) => s,
        }
    }
}
