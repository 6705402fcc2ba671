//! Contains the options for a [`Client`](crate::Client) and the types they are built from.

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::Duration,
};

use derive_more::Display;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    events::EventHandler,
    policies::{
        AddressTranslator,
        ConstantSpeculativeExecutionPolicy,
        DefaultLoadBalancingPolicy,
        DefaultRetryPolicy,
        ExponentialReconnectionPolicy,
        IdempotenceAwareRetryPolicy,
        IdentityAddressTranslator,
        LoadBalancingPolicy,
        MonotonicTimestampGenerator,
        NoSpeculativeExecutionPolicy,
        ReconnectionPolicy,
        RetryPolicy,
        SpeculativeExecutionPolicy,
        TimestampGenerator,
    },
};

/// The default port of a CQL native transport endpoint.
pub const DEFAULT_PORT: u16 = 9042;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(12);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_REQUESTS_PER_CONNECTION: usize = 2048;
pub(crate) const DEFAULT_DEFUNCT_READ_TIMEOUT_THRESHOLD: usize = 64;

/// The absolute ceiling on in-flight requests per connection imposed by the 15-bit
/// stream id space.
pub(crate) const MAX_STREAM_IDS: usize = 1 << 15;

/// The address of a coordinator node that the driver can connect to.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct EndPoint {
    /// The hostname or IP address.
    pub host: String,

    /// The native transport port.
    pub port: u16,
}

impl EndPoint {
    /// Creates an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an endpoint from a `host` or `host:port` string.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        // An IPv6 literal with a port is written [addr]:port.
        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| Error::invalid_argument(format!("invalid endpoint: {}", s)))?;
            let port = match rest.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid port in: {}", s)))?,
                None => DEFAULT_PORT,
            };
            return Ok(Self::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid port in: {}", s)))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The consistency level of a request.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

impl Consistency {
    pub(crate) fn to_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
        }
    }

    pub(crate) fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            other => {
                return Err(Error::protocol(format!(
                    "unknown consistency code: 0x{:04x}",
                    other
                )))
            }
        })
    }
}

/// The native protocol versions this driver can speak.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum ProtocolVersion {
    /// Version 3, the floor for this driver.
    V3,
    /// Version 4, the default.
    V4,
}

impl ProtocolVersion {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V3 => 0x03,
            ProtocolVersion::V4 => 0x04,
        }
    }

    /// The next lower version to fall back to when a node rejects this one.
    pub(crate) fn downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }
}

/// The compression algorithms the driver can negotiate in STARTUP.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Compression {
    /// LZ4 block compression.
    #[cfg(feature = "lz4-compression")]
    Lz4,
    /// Snappy compression.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compression {
    /// The algorithm name as it appears in STARTUP/SUPPORTED option maps.
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "lz4-compression")]
            Compression::Lz4 => "lz4",
            #[cfg(feature = "snappy-compression")]
            Compression::Snappy => "snappy",
        }
    }
}

/// Plain username/password credentials for SASL PLAIN authentication.
#[derive(Clone)]
pub struct Credential {
    /// The username.
    pub username: String,

    /// The password.
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"...")
            .finish()
    }
}

/// The number of connections a pool holds for a host at a given distance. Hosts at
/// distance `ignored` always hold zero connections.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolSize {
    /// Connections per host the load balancing policy marks local.
    pub local: usize,

    /// Connections per host the load balancing policy marks remote.
    pub remote: usize,
}

impl Default for PoolSize {
    fn default() -> Self {
        Self {
            local: 2,
            remote: 1,
        }
    }
}

/// TLS configuration for connections to the cluster.
#[cfg(feature = "rustls-tls")]
#[derive(Clone)]
pub struct TlsOptions {
    /// The rustls client configuration to use. When `None`, a configuration trusting
    /// the webpki roots is built.
    pub config: Option<Arc<rustls::ClientConfig>>,
}

#[cfg(feature = "rustls-tls")]
impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions").finish_non_exhaustive()
    }
}

/// A named bundle of request settings, selected per statement by name. Unset fields
/// fall back to the client-wide defaults.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ExecutionProfile {
    /// Default consistency for requests using this profile.
    pub consistency: Option<Consistency>,
    /// Default serial consistency for requests using this profile.
    pub serial_consistency: Option<Consistency>,
    /// Per-attempt read timeout for requests using this profile.
    pub read_timeout: Option<Duration>,
    /// Retry policy for requests using this profile.
    pub retry: Option<Arc<dyn crate::policies::RetryPolicy>>,
}

/// Contains the options that can be used to create a [`Client`](crate::Client).
#[derive(Clone)]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial seed nodes used to discover the rest of the cluster.
    pub contact_points: Vec<EndPoint>,

    /// The keyspace every new connection binds to with `USE`.
    pub keyspace: Option<String>,

    /// Credentials for SASL PLAIN authentication, if the cluster requires it.
    pub credential: Option<Credential>,

    /// A custom authenticator provider. Takes precedence over `credential`.
    pub authenticator_provider: Option<Arc<dyn crate::AuthenticatorProvider>>,

    /// The highest protocol version to propose. The driver downgrades one version at a
    /// time if a contact node rejects it.
    pub protocol_version: ProtocolVersion,

    /// The compression algorithm to negotiate, if any.
    pub compression: Option<Compression>,

    /// The number of connections to open per host, by distance.
    pub pool_size: PoolSize,

    /// The maximum number of concurrent requests multiplexed on one connection.
    /// Bounded by the 15-bit stream id space.
    pub max_requests_per_connection: usize,

    /// The timeout for establishing and handshaking one connection.
    pub connect_timeout: Duration,

    /// The per-attempt timeout waiting for a response.
    pub read_timeout: Duration,

    /// How long a connection may stay silent before the driver probes it with OPTIONS.
    pub heartbeat_interval: Duration,

    /// How many responses may be outstanding past their read timeout before the
    /// connection is considered defunct and torn down.
    pub defunct_read_timeout_threshold: usize,

    /// The load balancing policy producing query plans and host distances.
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,

    /// The schedule used when reconnecting to a downed host.
    pub reconnection: Arc<dyn ReconnectionPolicy>,

    /// The policy consulted on retryable request errors.
    pub retry: Arc<dyn RetryPolicy>,

    /// The policy scheduling speculative executions for idempotent requests.
    pub speculative_execution: Arc<dyn SpeculativeExecutionPolicy>,

    /// Translates addresses reported in `system.peers` before the driver connects to
    /// them. Contact points are never translated.
    pub address_translator: Arc<dyn AddressTranslator>,

    /// Generates the client-side default timestamp attached to requests.
    pub timestamp_generator: Arc<dyn TimestampGenerator>,

    /// The handler notified of cluster events (hosts up/down/added/removed, schema
    /// changes).
    pub event_handler: Option<Arc<dyn EventHandler>>,

    /// Named execution profiles selectable per statement.
    pub execution_profiles: std::collections::HashMap<String, ExecutionProfile>,

    /// The replication factor assumed when computing token replicas.
    pub replication_factor: usize,

    /// A name identifying the application, sent in the STARTUP options.
    pub application_name: Option<String>,

    /// The application version, sent in the STARTUP options.
    pub application_version: Option<String>,

    /// A unique id for this client instance, sent in the STARTUP options.
    pub client_id: Uuid,

    /// TLS configuration. `None` disables TLS.
    #[cfg(feature = "rustls-tls")]
    pub tls: Option<TlsOptions>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("contact_points", &self.contact_points)
            .field("keyspace", &self.keyspace)
            .field("protocol_version", &self.protocol_version)
            .field("compression", &self.compression)
            .field("pool_size", &self.pool_size)
            .field("max_requests_per_connection", &self.max_requests_per_connection)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Creates a builder seeded with the given contact points.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder {
            options: ClientOptions::default(),
        }
    }

    /// Parses a comma-separated list of `host[:port]` contact points into options with
    /// all defaults.
    pub fn parse(contact_points: impl AsRef<str>) -> Result<Self> {
        let mut options = ClientOptions::default();
        for part in contact_points.as_ref().split(',') {
            let part = part.trim();
            if !part.is_empty() {
                options.contact_points.push(EndPoint::parse(part)?);
            }
        }
        if options.contact_points.is_empty() {
            return Err(Error::invalid_argument("no contact points provided"));
        }
        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.contact_points.is_empty() {
            return Err(Error::invalid_argument("no contact points provided"));
        }
        if self.max_requests_per_connection == 0
            || self.max_requests_per_connection > MAX_STREAM_IDS
        {
            return Err(Error::invalid_argument(format!(
                "max_requests_per_connection must be in [1, {}]",
                MAX_STREAM_IDS
            )));
        }
        if self.replication_factor == 0 {
            return Err(Error::invalid_argument(
                "replication_factor must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            contact_points: Vec::new(),
            keyspace: None,
            credential: None,
            authenticator_provider: None,
            protocol_version: ProtocolVersion::V4,
            compression: None,
            pool_size: PoolSize::default(),
            max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            defunct_read_timeout_threshold: DEFAULT_DEFUNCT_READ_TIMEOUT_THRESHOLD,
            load_balancing: Arc::new(DefaultLoadBalancingPolicy::new(None)),
            reconnection: Arc::new(ExponentialReconnectionPolicy::default()),
            retry: Arc::new(IdempotenceAwareRetryPolicy::new(Arc::new(DefaultRetryPolicy))),
            speculative_execution: Arc::new(NoSpeculativeExecutionPolicy),
            address_translator: Arc::new(IdentityAddressTranslator),
            timestamp_generator: Arc::new(MonotonicTimestampGenerator::new()),
            event_handler: None,
            execution_profiles: std::collections::HashMap::new(),
            replication_factor: 1,
            application_name: None,
            application_version: None,
            client_id: Uuid::new_v4(),
            #[cfg(feature = "rustls-tls")]
            tls: None,
        }
    }
}

/// Builder for [`ClientOptions`].
#[derive(Debug)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Adds a contact point.
    pub fn contact_point(mut self, endpoint: EndPoint) -> Self {
        self.options.contact_points.push(endpoint);
        self
    }

    /// Sets the keyspace every connection binds to.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.options.keyspace = Some(keyspace.into());
        self
    }

    /// Sets plain credentials.
    pub fn credential(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.credential = Some(Credential {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Sets a custom authenticator provider.
    pub fn authenticator_provider(
        mut self,
        provider: Arc<dyn crate::AuthenticatorProvider>,
    ) -> Self {
        self.options.authenticator_provider = Some(provider);
        self
    }

    /// Sets the compression algorithm to negotiate.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.options.compression = Some(compression);
        self
    }

    /// Sets the per-distance pool size.
    pub fn pool_size(mut self, pool_size: PoolSize) -> Self {
        self.options.pool_size = pool_size;
        self
    }

    /// Sets the maximum number of in-flight requests per connection.
    pub fn max_requests_per_connection(mut self, max: usize) -> Self {
        self.options.max_requests_per_connection = max;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Sets the per-attempt read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    /// Sets the load balancing policy.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.options.load_balancing = policy;
        self
    }

    /// Sets the reconnection policy.
    pub fn reconnection(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.options.reconnection = policy;
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.options.retry = policy;
        self
    }

    /// Sets the speculative execution policy.
    pub fn speculative_execution(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.options.speculative_execution = policy;
        self
    }

    /// Enables constant speculative executions with the given delay and cap.
    pub fn constant_speculative_execution(self, delay: Duration, max_executions: usize) -> Self {
        self.speculative_execution(Arc::new(ConstantSpeculativeExecutionPolicy {
            delay,
            max_executions,
        }))
    }

    /// Sets the address translator.
    pub fn address_translator(mut self, translator: Arc<dyn AddressTranslator>) -> Self {
        self.options.address_translator = translator;
        self
    }

    /// Sets the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.options.event_handler = Some(handler);
        self
    }

    /// Sets the application name sent in STARTUP.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.options.application_name = Some(name.into());
        self
    }

    /// Sets the application version sent in STARTUP.
    pub fn application_version(mut self, version: impl Into<String>) -> Self {
        self.options.application_version = Some(version.into());
        self
    }

    /// Registers a named execution profile.
    pub fn execution_profile(
        mut self,
        name: impl Into<String>,
        profile: ExecutionProfile,
    ) -> Self {
        self.options.execution_profiles.insert(name.into(), profile);
        self
    }

    /// Sets the assumed replication factor for token-aware routing.
    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.options.replication_factor = rf;
        self
    }

    /// Sets the TLS configuration.
    #[cfg(feature = "rustls-tls")]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.options.tls = Some(tls);
        self
    }

    /// Finalizes the options.
    pub fn build(self) -> Result<ClientOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            EndPoint::parse("10.0.0.1").unwrap(),
            EndPoint::new("10.0.0.1", DEFAULT_PORT)
        );
        assert_eq!(
            EndPoint::parse("db.example.com:9043").unwrap(),
            EndPoint::new("db.example.com", 9043)
        );
        assert_eq!(
            EndPoint::parse("[::1]:9042").unwrap(),
            EndPoint::new("::1", 9042)
        );
        assert_eq!(
            EndPoint::parse("::1").unwrap(),
            EndPoint::new("::1", DEFAULT_PORT)
        );
        assert!(EndPoint::parse("[::1]:notaport").is_err());
    }

    #[test]
    fn parses_contact_point_list() {
        let options = ClientOptions::parse("a, b:9043 ,c").unwrap();
        assert_eq!(
            options.contact_points,
            vec![
                EndPoint::new("a", DEFAULT_PORT),
                EndPoint::new("b", 9043),
                EndPoint::new("c", DEFAULT_PORT),
            ]
        );
    }

    #[test]
    fn rejects_oversized_stream_window() {
        let err = ClientOptions::builder()
            .contact_point(EndPoint::new("a", DEFAULT_PORT))
            .max_requests_per_connection(MAX_STREAM_IDS + 1)
            .build()
            .unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::InvalidArgument { .. }
        ));
    }

    #[test]
    fn consistency_round_trips() {
        for c in [
            Consistency::Any,
            Consistency::One,
            Consistency::Quorum,
            Consistency::LocalQuorum,
            Consistency::Serial,
            Consistency::LocalOne,
        ] {
            assert_eq!(Consistency::from_u16(c.to_u16()).unwrap(), c);
        }
        assert!(Consistency::from_u16(0x00FF).is_err());
    }
}
