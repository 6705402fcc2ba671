//! Connection establishment: transport, protocol negotiation, STARTUP, the
//! authentication loop, and keyspace binding.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info};

use super::{AsyncStream, Connection, StreamOptions};
use crate::{
    client::auth::{AuthenticatorProvider, PlainTextAuthProvider},
    compression::Compressor,
    error::{DbError, Error, ErrorKind, Result},
    frame::{
        request::{QueryParameters, Request},
        response::{CqlResult, ParsedResponse, Response, ServerEvent},
        Frame,
        FrameReader,
    },
    options::{ClientOptions, Compression, EndPoint, ProtocolVersion},
    runtime,
};

/// The outcome of protocol negotiation for one connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NegotiatedSettings {
    pub(crate) version: ProtocolVersion,
    pub(crate) compressor: Option<Compressor>,
}

/// Contains the logic for "establishing" a connection: opening the transport,
/// negotiating the protocol version and compression, handshaking and authenticating,
/// and binding the keyspace.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    defunct_threshold: usize,
    max_requests: usize,
    compression: Option<Compression>,
    keyspace: Option<String>,
    startup_identity: Vec<(String, String)>,
    auth_provider: Option<Arc<dyn AuthenticatorProvider>>,
    /// The version proposed to new connections. Shared so that a downgrade forced by
    /// one node sticks for the whole cluster.
    version: Arc<Mutex<ProtocolVersion>>,
    #[cfg(feature = "rustls-tls")]
    tls: Option<crate::options::TlsOptions>,
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut startup_identity = vec![
            ("DRIVER_NAME".to_string(), crate::DRIVER_NAME.to_string()),
            ("DRIVER_VERSION".to_string(), crate::DRIVER_VERSION.to_string()),
            ("CLIENT_ID".to_string(), options.client_id.to_string()),
        ];
        if let Some(ref name) = options.application_name {
            startup_identity.push(("APPLICATION_NAME".to_string(), name.clone()));
        }
        if let Some(ref version) = options.application_version {
            startup_identity.push(("APPLICATION_VERSION".to_string(), version.clone()));
        }

        let auth_provider: Option<Arc<dyn AuthenticatorProvider>> =
            options.authenticator_provider.clone().or_else(|| {
                options.credential.clone().map(|credential| {
                    Arc::new(PlainTextAuthProvider::new(credential))
                        as Arc<dyn AuthenticatorProvider>
                })
            });

        Self {
            connect_timeout: options.connect_timeout,
            heartbeat_interval: options.heartbeat_interval,
            defunct_threshold: options.defunct_read_timeout_threshold,
            max_requests: options.max_requests_per_connection,
            compression: options.compression,
            keyspace: options.keyspace.clone(),
            startup_identity,
            auth_provider,
            version: Arc::new(Mutex::new(options.protocol_version)),
            #[cfg(feature = "rustls-tls")]
            tls: options.tls.clone(),
        }
    }

    /// Opens and handshakes a connection to `endpoint`. On a server rejecting the
    /// proposed protocol version the next-lower version is locked in and the whole
    /// startup sequence is re-issued.
    pub(crate) async fn establish(
        &self,
        endpoint: &EndPoint,
        event_sender: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Result<Connection> {
        loop {
            let version = self.proposed_version();
            let result = runtime::timeout(self.connect_timeout, self.try_once(endpoint, version))
                .await
                .unwrap_or_else(|| {
                    Err(Error::connection_closed(format!(
                        "timed out handshaking with {}",
                        endpoint
                    )))
                });

            match result {
                Ok((stream, settings)) => {
                    debug!(%endpoint, version = ?settings.version, "connection established");
                    return Ok(Connection::start(
                        stream,
                        endpoint.clone(),
                        settings,
                        self.max_requests,
                        self.heartbeat_interval,
                        self.defunct_threshold,
                        event_sender,
                    ));
                }
                Err(error) if is_version_rejection(&error) => {
                    let Some(lower) = version.downgrade() else {
                        return Err(error);
                    };
                    info!(
                        %endpoint,
                        proposed = ?version,
                        downgraded = ?lower,
                        "node rejected protocol version, retrying with the lower one"
                    );
                    self.lock_version(lower);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn proposed_version(&self) -> ProtocolVersion {
        #[allow(clippy::unwrap_used)]
        *self.version.lock().unwrap()
    }

    fn lock_version(&self, version: ProtocolVersion) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.version.lock().unwrap();
        if version < *guard {
            *guard = version;
        }
    }

    async fn try_once(
        &self,
        endpoint: &EndPoint,
        version: ProtocolVersion,
    ) -> Result<(AsyncStream, NegotiatedSettings)> {
        let stream = AsyncStream::connect(StreamOptions {
            endpoint: endpoint.clone(),
            connect_timeout: self.connect_timeout,
            #[cfg(feature = "rustls-tls")]
            tls: self.tls.clone(),
        })
        .await?;

        let mut handshake = Handshake {
            stream,
            reader: FrameReader::new(),
            version,
            compressor: None,
        };

        // OPTIONS → SUPPORTED tells us which of our compression algorithms the server
        // speaks.
        let supported = match handshake.exchange(Request::Options).await?.kind {
            Response::Supported { options } => options,
            other => {
                return Err(Error::protocol(format!(
                    "expected SUPPORTED in response to OPTIONS, got {:?}",
                    other
                )))
            }
        };
        let compression = self.compression.filter(|algorithm| {
            supported
                .get("COMPRESSION")
                .is_some_and(|list| list.iter().any(|name| name == algorithm.name()))
        });

        let mut startup_options = vec![("CQL_VERSION".to_string(), "3.0.0".to_string())];
        if let Some(algorithm) = compression {
            startup_options.push(("COMPRESSION".to_string(), algorithm.name().to_string()));
        }
        startup_options.extend(self.startup_identity.iter().cloned());

        // The server compresses everything after it processes STARTUP, so the
        // decompressor has to be armed before its response is read.
        handshake.compressor = compression.map(Compressor::new);
        let startup_response = handshake
            .exchange(Request::Startup {
                options: startup_options,
            })
            .await?;

        match startup_response.kind {
            Response::Ready => {}
            Response::Authenticate { authenticator } => {
                self.authenticate(&mut handshake, endpoint, &authenticator)
                    .await?;
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected READY or AUTHENTICATE after STARTUP, got {:?}",
                    other
                )))
            }
        }

        if let Some(ref keyspace) = self.keyspace {
            handshake.use_keyspace(keyspace).await?;
        }

        let settings = NegotiatedSettings {
            version: handshake.version,
            compressor: handshake.compressor,
        };
        Ok((handshake.stream, settings))
    }

    async fn authenticate(
        &self,
        handshake: &mut Handshake,
        endpoint: &EndPoint,
        authenticator_name: &str,
    ) -> Result<()> {
        let Some(ref provider) = self.auth_provider else {
            return Err(Error::authentication_error(
                authenticator_name,
                "the cluster requires authentication but no credentials were configured",
            ));
        };
        let mut authenticator = provider.new_authenticator(endpoint, authenticator_name)?;

        let mut token = authenticator.initial_response()?;
        loop {
            let response = handshake
                .exchange(Request::AuthResponse { token })
                .await?;
            match response.kind {
                Response::AuthSuccess { token } => {
                    authenticator.on_authentication_success(token.as_deref())?;
                    return Ok(());
                }
                Response::AuthChallenge { token: challenge } => {
                    token = authenticator.evaluate_challenge(challenge.as_deref())?;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "expected AUTH_CHALLENGE or AUTH_SUCCESS, got {:?}",
                        other
                    )))
                }
            }
        }
    }
}

/// Whether a STARTUP error means "I don't speak that protocol version".
fn is_version_rejection(error: &Error) -> bool {
    matches!(error.server_code(), Some(DbError::ProtocolError))
}

/// A not-yet-multiplexed connection: requests go out one at a time on stream id 0.
struct Handshake {
    stream: AsyncStream,
    reader: FrameReader,
    version: ProtocolVersion,
    compressor: Option<Compressor>,
}

impl Handshake {
    async fn exchange(&mut self, request: Request) -> Result<ParsedResponse> {
        let mut body = Vec::new();
        request.write_body(self.version, &mut body)?;
        let bytes =
            Frame::new(0, request.opcode(), body).encode(self.version, self.compressor.as_ref())?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        let frame = self.read_frame().await?;
        if frame.stream != 0 {
            return Err(Error::protocol(format!(
                "expected stream id 0 during the handshake, got {}",
                frame.stream
            )));
        }
        let parsed = Response::deserialize(&frame, self.version)?;
        match parsed.kind {
            Response::Error(server_error) => Err(Error::new(ErrorKind::Server(server_error))),
            _ => Ok(parsed),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            if let Some(frame) = self.reader.next_frame(self.compressor.as_ref())? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::connection_closed(
                    "connection closed during the handshake",
                ));
            }
            self.reader.push(&buf[..n]);
        }
    }

    async fn use_keyspace(&mut self, keyspace: &str) -> Result<()> {
        let response = self
            .exchange(Request::Query {
                query: format!("USE \"{}\"", keyspace),
                parameters: QueryParameters::default(),
            })
            .await?;
        match response.kind {
            Response::Result(CqlResult::SetKeyspace(_)) => Ok(()),
            other => Err(Error::protocol(format!(
                "expected a set-keyspace result from USE, got {:?}",
                other
            ))),
        }
    }
}
