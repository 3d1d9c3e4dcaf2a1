//! Proxy request hand-off types
//!
//! Defines the request value delivered to user handlers, the stream
//! object it carries, and the capability traits an embedding application
//! can supply (connect/associate handlers and a custom upstream dialer).

use crate::addr::TargetAddr;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Object-safe duplex byte stream.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

/// Blanket implementation: any type implementing the required traits is a ProxyStream.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// A fully parsed proxy request, ready for hand-off
///
/// Handed to a [`UserHandler`] after the protocol handshake has completed
/// and the success reply has been written to the client. The handler owns
/// `conn` and is responsible for closing it.
pub struct ProxyRequest {
    /// The client connection, positioned at the start of payload data.
    /// For UDP associations this is a datagram-preserving relay stream.
    pub conn: Box<dyn ProxyStream>,
    /// `"tcp"` or `"udp"`
    pub network: &'static str,
    /// Destination as a `host:port` string
    pub destination: String,
    /// Destination host (IP literal or domain name)
    pub dest_host: String,
    /// Destination port
    pub dest_port: u16,
    /// Username from the SOCKS4 request, if any. Never verified.
    pub username: Option<String>,
}

impl ProxyRequest {
    /// Build a request from a connection and a parsed destination address.
    pub fn new(conn: Box<dyn ProxyStream>, network: &'static str, dest: &TargetAddr) -> Self {
        ProxyRequest {
            conn,
            network,
            destination: dest.to_string(),
            dest_host: dest.host(),
            dest_port: dest.port(),
            username: None,
        }
    }
}

impl fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("network", &self.network)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// User-supplied handler for proxy requests
///
/// Implemented automatically for async closures taking a [`ProxyRequest`].
#[async_trait]
pub trait UserHandler: Send + Sync {
    /// Take ownership of the request and serve it to completion.
    async fn handle(&self, request: ProxyRequest) -> Result<()>;
}

#[async_trait]
impl<F, Fut> UserHandler for F
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, request: ProxyRequest) -> Result<()> {
        self(request).await
    }
}

/// User-supplied upstream dialer
///
/// Returns the dialed stream together with its local socket address, if
/// the transport has one. The local address is reported to SOCKS clients
/// in bind replies; `None` falls back to the zero bind.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `address` (`host:port`) over `network` (`"tcp"` or `"udp"`).
    async fn dial(
        &self,
        network: &str,
        address: &str,
    ) -> io::Result<(Box<dyn ProxyStream>, Option<SocketAddr>)>;
}

/// Default dialer backed by [`TcpStream::connect`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDialer;

#[async_trait]
impl Dialer for DefaultDialer {
    async fn dial(
        &self,
        network: &str,
        address: &str,
    ) -> io::Result<(Box<dyn ProxyStream>, Option<SocketAddr>)> {
        if network != "tcp" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network: {}", network),
            ));
        }
        let stream = TcpStream::connect(address).await?;
        let local_addr = stream.local_addr().ok();
        Ok((Box::new(stream), local_addr))
    }
}
