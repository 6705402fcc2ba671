use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::EndPoint,
    runtime,
};

#[cfg(feature = "rustls-tls")]
use std::sync::Arc;
#[cfg(feature = "rustls-tls")]
use tokio_rustls::TlsConnector;

const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// Options for establishing the transport under one connection.
#[derive(Clone, Debug)]
pub(crate) struct StreamOptions {
    pub(crate) endpoint: EndPoint,
    pub(crate) connect_timeout: Duration,
    #[cfg(feature = "rustls-tls")]
    pub(crate) tls: Option<crate::options::TlsOptions>,
}

/// An async stream to a coordinator, possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncStream {
    pub(crate) async fn connect(options: StreamOptions) -> Result<Self> {
        let inner = tcp_connect(&options.endpoint, options.connect_timeout).await?;

        #[cfg(feature = "rustls-tls")]
        if let Some(ref tls) = options.tls {
            let config = match tls.config {
                Some(ref config) => Arc::clone(config),
                None => Arc::new(default_tls_config()),
            };
            let name = rustls::pki_types::ServerName::try_from(options.endpoint.host.clone())
                .map_err(|e| {
                    Error::invalid_argument(format!(
                        "invalid TLS server name {}: {}",
                        options.endpoint.host, e
                    ))
                })?;
            let connector: TlsConnector = config.into();
            let session = connector.connect(name, inner).await?;
            return Ok(Self::Tls(session));
        }

        Ok(Self::Tcp(inner))
    }
}

#[cfg(feature = "rustls-tls")]
fn default_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

async fn tcp_connect(endpoint: &EndPoint, connect_timeout: Duration) -> Result<TcpStream> {
    let mut socket_addrs: Vec<SocketAddr> =
        tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .collect();

    if socket_addrs.is_empty() {
        return Err(Error::connection_closed(format!(
            "no addresses resolved for {}",
            endpoint
        )));
    }

    // Try each of the addresses in sequence with a preference for IPv4.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;
    for address in &socket_addrs {
        connect_error = match try_connect(address, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    Err(connect_error
        .unwrap_or_else(|| Error::connection_closed(format!("could not connect to {}", endpoint))))
}

async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = runtime::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .ok_or_else(|| Error::from(ErrorKind::from(std::io::ErrorKind::TimedOut)))??;

    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    Ok(TcpStream::from_std(std_stream)?)
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
