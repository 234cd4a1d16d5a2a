//! Outbound transport abstraction.
//!
//! A [`Transport`] turns a destination `host:port` into a duplex byte
//! stream. The direct transport fails fast: if a destination does not accept
//! within the configured timeout the caller is told to retry through the
//! tunnel instead of receiving an error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;

/// Boxed duplex stream returned by transports.
pub type ProxyStream = Box<dyn ProxyIo>;

pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Outcome of a dial attempt.
///
/// `RetryWithTunnel` is an explicit value rather than an error: the
/// destination did not answer a direct connection in time and the request
/// should be re-dispatched through the tunnel.
pub enum Dialed {
    Stream(ProxyStream),
    RetryWithTunnel,
}

/// A pluggable outbound dialer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<Dialed>;

    /// Short label for request logs.
    fn name(&self) -> &'static str;
}

/// Conventional outbound dialer with a short fixed connect timeout.
pub struct DirectTransport {
    timeout: Duration,
}

impl DirectTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<Dialed> {
        // Tuple form so unbracketed IPv6 hosts resolve correctly.
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(Dialed::Stream(Box::new(stream))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                debug!("direct dial to {}:{} timed out, retry with tunnel", host, port);
                Ok(Dialed::RetryWithTunnel)
            }
        }
    }

    fn name(&self) -> &'static str {
        "DIRECT"
    }
}
