//! Mixed-protocol proxy server
//!
//! Accepts TCP connections on a single endpoint and detects the protocol
//! from the first byte without consuming it: `0x05` is SOCKS5, `0x04` is
//! SOCKS4, anything else is treated as HTTP. The connection is then owned
//! by exactly one protocol engine.

pub mod peek;

use crate::http;
use crate::request::{Dialer, UserHandler};
use crate::socks4;
use crate::socks5;
use crate::socks5::PacketForwardFn;
use crate::tunnel::BytesPool;
use self::peek::PeekStream;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default listening endpoint
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:1080";

/// Mixed SOCKS5 / SOCKS4 / HTTP proxy server
pub struct Proxy {
    bind: String,
    socks5: Arc<socks5::Server>,
    socks4: Arc<socks4::Server>,
    http: Arc<http::Server>,
    cancel: CancellationToken,
}

/// Builder for [`Proxy`]
///
/// All options are optional; the default is a plain dial-and-tunnel proxy
/// on [`DEFAULT_BIND_ADDRESS`].
#[derive(Default)]
pub struct ProxyBuilder {
    bind: Option<String>,
    tcp_handler: Option<Arc<dyn UserHandler>>,
    udp_handler: Option<Arc<dyn UserHandler>>,
    dialer: Option<Arc<dyn Dialer>>,
    cancel: Option<CancellationToken>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    packet_forward_address: Option<PacketForwardFn>,
    allow_udp: Option<bool>,
    request_timeout: Option<Duration>,
}

impl ProxyBuilder {
    /// Start a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// TCP endpoint to listen on (default `127.0.0.1:1080`).
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind = Some(addr.into());
        self
    }

    /// One handler for both TCP and UDP proxy requests.
    pub fn user_handler(mut self, handler: Arc<dyn UserHandler>) -> Self {
        self.tcp_handler = Some(handler.clone());
        self.udp_handler = Some(handler);
        self
    }

    /// Handler for TCP proxy requests only.
    pub fn user_tcp_handler(mut self, handler: Arc<dyn UserHandler>) -> Self {
        self.tcp_handler = Some(handler);
        self
    }

    /// Handler for UDP proxy requests only.
    pub fn user_udp_handler(mut self, handler: Arc<dyn UserHandler>) -> Self {
        self.udp_handler = Some(handler);
        self
    }

    /// Custom upstream dialer for all engines.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Parent cancellation token; cancelling it stops the accept loop.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Buffer pool shared by all tunnel copiers.
    pub fn bytes_pool(mut self, pool: Arc<dyn BytesPool>) -> Self {
        self.bytes_pool = Some(pool);
        self
    }

    /// Override the SOCKS5 ASSOCIATE bind-reply address.
    pub fn packet_forward_address(mut self, f: PacketForwardFn) -> Self {
        self.packet_forward_address = Some(f);
        self
    }

    /// Allow or reject the SOCKS5 UDP ASSOCIATE command (allowed by default).
    pub fn allow_udp(mut self, allow: bool) -> Self {
        self.allow_udp = Some(allow);
        self
    }

    /// Deadline for upstream dials in all engines.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Assemble the proxy.
    pub fn build(self) -> Proxy {
        let mut socks5 = socks5::Server::new();
        let mut socks4 = socks4::Server::new();
        let mut http = http::Server::new();

        if let Some(dialer) = self.dialer {
            socks5 = socks5.with_dialer(dialer.clone());
            socks4 = socks4.with_dialer(dialer.clone());
            http = http.with_dialer(dialer);
        }
        if let Some(handler) = self.tcp_handler {
            socks5 = socks5.with_connect_handler(handler.clone());
            socks4 = socks4.with_connect_handler(handler.clone());
            http = http.with_connect_handler(handler);
        }
        if let Some(handler) = self.udp_handler {
            socks5 = socks5.with_associate_handler(handler);
        }
        if let Some(pool) = self.bytes_pool {
            socks5 = socks5.with_bytes_pool(pool.clone());
            socks4 = socks4.with_bytes_pool(pool.clone());
            http = http.with_bytes_pool(pool);
        }
        if let Some(forward) = self.packet_forward_address {
            socks5 = socks5.with_packet_forward_address(forward);
        }
        if let Some(allow) = self.allow_udp {
            socks5 = socks5.with_allow_udp(allow);
        }
        if let Some(timeout) = self.request_timeout {
            socks5 = socks5.with_request_timeout(timeout);
            socks4 = socks4.with_request_timeout(timeout);
            http = http.with_request_timeout(timeout);
        }

        Proxy {
            bind: self.bind.unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            socks5: Arc::new(socks5),
            socks4: Arc::new(socks4),
            http: Arc::new(http),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

impl Proxy {
    /// Start building a proxy.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// The configured listening endpoint.
    pub fn bind_address(&self) -> &str {
        &self.bind
    }

    /// Bind the configured endpoint and serve until cancelled.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("Failed to listen on {}", self.bind))?;
        debug!("Serving on {}", self.bind);
        self.serve_listener(listener).await
    }

    /// Serve connections from an already-bound listener until cancelled.
    ///
    /// Accept errors are logged and the loop continues; per-connection
    /// errors never abort the listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Accept loop cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let socks5 = self.socks5.clone();
                    let socks4 = self.socks4.clone();
                    let http = self.http.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socks5, socks4, http, stream).await {
                            error!("Connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

/// Peek the first byte and dispatch to the matching engine.
async fn serve_connection(
    socks5: Arc<socks5::Server>,
    socks4: Arc<socks4::Server>,
    http: Arc<http::Server>,
    stream: TcpStream,
) -> Result<()> {
    let local_addr = stream.local_addr().ok();
    let mut conn = PeekStream::new(stream);

    match conn.peek_byte().await? {
        0x05 => socks5.serve_conn(conn, local_addr).await,
        0x04 => socks4.serve_conn(conn).await,
        _ => http.serve_conn(conn).await,
    }
}
