//! Plain-TCP and TLS listener/dialer wrappers.
//!
//! Two transport modes on the listen side (plain TCP, or implicit TLS
//! beginning immediately on accept) and two on the upstream dial side,
//! chosen by configuration. StartTLS is handled one layer up in
//! [`crate::pair`] — it is rejected outright, never negotiated here.

use std::net::SocketAddr;
use std::pin::Pin;

use openssl::ssl::{Ssl, SslAcceptor, SslConnector};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

use crate::error::ProxyError;

/// Either side of a Connection Pair's sockets is one of these, erased
/// behind a trait object so [`crate::pair::ConnectionPair`] doesn't need to
/// be generic over plain-vs-TLS.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::ListenBindFailed(e.to_string()))
}

/// Wraps a freshly accepted client socket in TLS if `ssl` is enabled for
/// the listener, negotiating immediately (implicit TLS, not StartTLS).
pub async fn accept_stream(
    raw: TcpStream,
    acceptor: Option<&SslAcceptor>,
) -> Result<Box<dyn Stream>, ProxyError> {
    match acceptor {
        None => Ok(Box::new(raw)),
        Some(acceptor) => {
            let ssl = Ssl::new(acceptor.context())
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            let mut stream = SslStream::new(ssl, raw)
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            Pin::new(&mut stream)
                .accept()
                .await
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}

/// Dials the upstream directory, selecting TLS per `upstream_ssl`. Failure
/// here is never retried — the pair moves straight to `Closing` and the
/// client is left to reconnect.
pub async fn dial_upstream(
    addr: SocketAddr,
    connector: Option<&SslConnector>,
) -> Result<Box<dyn Stream>, ProxyError> {
    let raw = TcpStream::connect(addr)
        .await
        .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;

    match connector {
        None => Ok(Box::new(raw)),
        Some(connector) => {
            let ssl = Ssl::new(connector.context())
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            let mut stream = SslStream::new(ssl, raw)
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            Pin::new(&mut stream)
                .connect()
                .await
                .map_err(|e| ProxyError::UpstreamDialFailed(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}
