//! SOCKS4/4a protocol engine
//!
//! Implements the classic SOCKS4 server side: CONNECT and BIND, with the
//! SOCKS4a hostname extension. The username is read and forwarded in the
//! hand-off request but never verified (no identd lookup).

pub mod wire;

use crate::addr::TargetAddr;
use crate::error::{ProxyError, Socks4Error, Socks4Reply};
use crate::request::{DefaultDialer, Dialer, ProxyRequest, ProxyStream, UserHandler};
use crate::tunnel::{tunnel_with_pool, BytesPool};
use self::wire::{SOCKS4_CMD_BIND, SOCKS4_CMD_CONNECT, SOCKS4_VERSION};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Deadline for the client to complete the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long BIND waits for the inbound peer connection
const BIND_ACCEPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for the upstream dial
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS4 server engine
pub struct Server {
    dialer: Arc<dyn Dialer>,
    connect_handler: Option<Arc<dyn UserHandler>>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    request_timeout: Duration,
}

impl Server {
    /// Create a new engine with the default dialer and no handler.
    pub fn new() -> Self {
        Server {
            dialer: Arc::new(DefaultDialer),
            connect_handler: None,
            bytes_pool: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set a custom upstream dialer.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Hand CONNECT requests off to a user handler.
    pub fn with_connect_handler(mut self, handler: Arc<dyn UserHandler>) -> Self {
        self.connect_handler = Some(handler);
        self
    }

    /// Use a buffer pool for the tunnel copiers.
    pub fn with_bytes_pool(mut self, pool: Arc<dyn BytesPool>) -> Self {
        self.bytes_pool = Some(pool);
        self
    }

    /// Set the upstream dial deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Serve one SOCKS4 connection to completion.
    pub async fn serve_conn<S>(&self, mut conn: S) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut conn))
            .await
            .map_err(|_| ProxyError::Timeout("SOCKS4 handshake".to_string()))?;

        let (command, dest, username) = match handshake {
            Ok(parsed) => parsed,
            Err(err) => {
                // A replyable protocol violation gets the rejection code
                // before the connection is dropped.
                if let Some(ProxyError::Socks4(Socks4Error::InvalidAddress(_))) =
                    err.downcast_ref::<ProxyError>()
                {
                    wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                }
                return Err(err);
            }
        };

        debug!("SOCKS4 command {:#04x} to {} (user {:?})", command, dest, username);

        match command {
            SOCKS4_CMD_CONNECT => self.handle_connect(conn, dest, username).await,
            SOCKS4_CMD_BIND => self.handle_bind(conn, dest).await,
            other => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                Err(ProxyError::Socks4(Socks4Error::CommandNotSupported(other)).into())
            }
        }
    }

    async fn handle_connect<S>(
        &self,
        mut conn: S,
        dest: TargetAddr,
        username: String,
    ) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        if let Some(handler) = &self.connect_handler {
            wire::send_reply(&mut conn, Socks4Reply::Granted, None).await?;
            let mut request = ProxyRequest::new(Box::new(conn), "tcp", &dest);
            if !username.is_empty() {
                request.username = Some(username);
            }
            return handler.handle(request).await;
        }

        let dest_str = dest.to_string();
        let dial = self.dialer.dial("tcp", &dest_str);
        let (target, local_addr) = match tokio::time::timeout(self.request_timeout, dial).await {
            Ok(Ok(dialed)) => dialed,
            Ok(Err(e)) => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                return Err(e).with_context(|| format!("connect to {} failed", dest));
            }
            Err(_) => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                return Err(ProxyError::Timeout(format!("connect to {}", dest)).into());
            }
        };

        let bind = local_addr.map(TargetAddr::Ip);
        wire::send_reply(&mut conn, Socks4Reply::Granted, bind.as_ref()).await?;

        info!("SOCKS4 tunnel established to {}", dest);

        tunnel_with_pool(target, conn, self.bytes_pool.as_ref())
            .await
            .map_err(Into::into)
    }

    /// BIND: listen at the requested address, report the listener, accept
    /// exactly one connection, report the peer, then tunnel.
    async fn handle_bind<S>(&self, mut conn: S, dest: TargetAddr) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let listener = match TcpListener::bind(dest.to_string()).await {
            Ok(listener) => listener,
            Err(e) => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                return Err(e).with_context(|| format!("bind at {} failed", dest));
            }
        };
        let local = listener.local_addr()?;
        wire::send_reply(&mut conn, Socks4Reply::Granted, Some(&TargetAddr::Ip(local))).await?;

        let accepted = tokio::time::timeout(BIND_ACCEPT_TIMEOUT, listener.accept()).await;
        let (peer, peer_addr) = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                return Err(e).context("BIND accept failed");
            }
            Err(_) => {
                wire::send_reply(&mut conn, Socks4Reply::Rejected, None).await?;
                return Err(ProxyError::Timeout("BIND accept".to_string()).into());
            }
        };
        drop(listener);

        // Second reply, reporting the connected peer.
        wire::send_reply(&mut conn, Socks4Reply::Granted, Some(&TargetAddr::Ip(peer_addr)))
            .await?;

        info!("SOCKS4 BIND accepted peer {}", peer_addr);

        tunnel_with_pool(peer, conn, self.bytes_pool.as_ref())
            .await
            .map_err(Into::into)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the version byte, command and address record.
async fn handshake<S>(conn: &mut S) -> Result<(u8, TargetAddr, String)>
where
    S: ProxyStream,
{
    let version = conn.read_u8().await.context("Failed to read version")?;
    if version != SOCKS4_VERSION {
        return Err(ProxyError::Socks4(Socks4Error::UnsupportedVersion(version)).into());
    }

    let command = conn.read_u8().await?;
    let (dest, username) = wire::read_addr_and_user(conn).await?;
    Ok((command, dest, username))
}
