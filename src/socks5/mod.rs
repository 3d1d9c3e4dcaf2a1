//! SOCKS5 protocol engine
//!
//! Implements the RFC 1928 server side: method negotiation (no-auth
//! only), request parsing, CONNECT and UDP ASSOCIATE. BIND is rejected
//! with `commandNotSupported`. Each accepted connection runs exactly one
//! request and then either tunnels or hands off to a user handler.

pub mod consts;
pub mod udp;
pub mod wire;

use crate::addr::TargetAddr;
use crate::error::{ProxyError, ReplyCode, Socks5Error};
use crate::request::{DefaultDialer, Dialer, ProxyRequest, ProxyStream, UserHandler};
use crate::tunnel::{tunnel_with_pool, BytesPool};
use self::consts::*;
use self::udp::UdpConn;
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Deadline for the client to complete the handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the upstream dial
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chooses the bind address reported in the ASSOCIATE reply.
///
/// Receives the local address of the control connection (if known) and
/// the local address of the relay socket.
pub type PacketForwardFn =
    Arc<dyn Fn(Option<SocketAddr>, SocketAddr) -> io::Result<SocketAddr> + Send + Sync>;

/// SOCKS5 command parsed from the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    UdpAssociate,
    Other(u8),
}

impl From<u8> for Command {
    fn from(byte: u8) -> Self {
        match byte {
            SOCKS5_CMD_CONNECT => Command::Connect,
            SOCKS5_CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            other => Command::Other(other),
        }
    }
}

/// SOCKS5 server engine
pub struct Server {
    dialer: Arc<dyn Dialer>,
    connect_handler: Option<Arc<dyn UserHandler>>,
    associate_handler: Option<Arc<dyn UserHandler>>,
    packet_forward_address: Option<PacketForwardFn>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    allow_udp: bool,
    request_timeout: Duration,
}

impl Server {
    /// Create a new engine with the default dialer and no handlers.
    pub fn new() -> Self {
        Server {
            dialer: Arc::new(DefaultDialer),
            connect_handler: None,
            associate_handler: None,
            packet_forward_address: None,
            bytes_pool: None,
            allow_udp: true,
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

    /// Hand UDP ASSOCIATE requests off to a user handler.
    pub fn with_associate_handler(mut self, handler: Arc<dyn UserHandler>) -> Self {
        self.associate_handler = Some(handler);
        self
    }

    /// Override the ASSOCIATE bind-reply address.
    pub fn with_packet_forward_address(mut self, f: PacketForwardFn) -> Self {
        self.packet_forward_address = Some(f);
        self
    }

    /// Use a buffer pool for the tunnel copiers.
    pub fn with_bytes_pool(mut self, pool: Arc<dyn BytesPool>) -> Self {
        self.bytes_pool = Some(pool);
        self
    }

    /// Allow or reject the UDP ASSOCIATE command (allowed by default).
    pub fn with_allow_udp(mut self, allow: bool) -> Self {
        self.allow_udp = allow;
        self
    }

    /// Set the upstream dial deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Serve one SOCKS5 connection to completion.
    ///
    /// `local_addr` is the local address of the accepted connection; it
    /// seeds the default ASSOCIATE bind reply.
    pub async fn serve_conn<S>(&self, mut conn: S, local_addr: Option<SocketAddr>) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let (command, dest) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut conn))
                .await
                .map_err(|_| ProxyError::Timeout("SOCKS5 handshake".to_string()))??;

        debug!("SOCKS5 {:?} request to {}", command, dest);

        match command {
            Command::Connect => self.handle_connect(conn, dest).await,
            Command::UdpAssociate if self.allow_udp => {
                self.handle_associate(conn, dest, local_addr).await
            }
            Command::UdpAssociate => {
                warn!("UDP ASSOCIATE not allowed by configuration");
                wire::send_reply(&mut conn, ReplyCode::CommandNotSupported, None).await?;
                Err(ProxyError::Socks5(Socks5Error::CommandNotSupported(
                    SOCKS5_CMD_UDP_ASSOCIATE,
                ))
                .into())
            }
            Command::Other(byte) => {
                wire::send_reply(&mut conn, ReplyCode::CommandNotSupported, None).await?;
                Err(ProxyError::Socks5(Socks5Error::CommandNotSupported(byte)).into())
            }
        }
    }

    /// Run method negotiation and parse the request.
    async fn handshake<S>(&self, conn: &mut S) -> Result<(Command, TargetAddr)>
    where
        S: ProxyStream,
    {
        let version = conn.read_u8().await.context("Failed to read version")?;
        if version != SOCKS5_VERSION {
            return Err(ProxyError::Socks5(Socks5Error::UnsupportedVersion(version)).into());
        }

        let nmethods = conn.read_u8().await?;
        let mut methods = vec![0u8; nmethods as usize];
        conn.read_exact(&mut methods).await?;

        if methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
            conn.write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
                .await?;
            conn.flush().await?;
        } else {
            conn.write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                .await?;
            conn.flush().await?;
            return Err(ProxyError::Socks5(Socks5Error::NoSupportedAuth).into());
        }

        let mut header = [0u8; 3];
        conn.read_exact(&mut header)
            .await
            .context("Failed to read request header")?;
        if header[0] != SOCKS5_VERSION {
            return Err(ProxyError::Socks5(Socks5Error::UnsupportedVersion(header[0])).into());
        }
        let command = Command::from(header[1]);

        let dest = match wire::read_addr(conn).await {
            Ok(dest) => dest,
            Err(err) => {
                if let ProxyError::Socks5(Socks5Error::AddressTypeNotSupported(_)) = &err {
                    wire::send_reply(conn, ReplyCode::AddressTypeNotSupported, None).await?;
                }
                return Err(err.into());
            }
        };

        Ok((command, dest))
    }

    async fn handle_connect<S>(&self, mut conn: S, dest: TargetAddr) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        if let Some(handler) = &self.connect_handler {
            wire::send_reply(&mut conn, ReplyCode::Succeeded, None).await?;
            let request = ProxyRequest::new(Box::new(conn), "tcp", &dest);
            return handler.handle(request).await;
        }

        let dest_str = dest.to_string();
        let dial = self.dialer.dial("tcp", &dest_str);
        let (target, local_addr) = match tokio::time::timeout(self.request_timeout, dial).await {
            Ok(Ok(dialed)) => dialed,
            Ok(Err(e)) => {
                wire::send_reply(&mut conn, ReplyCode::from(&e), None).await?;
                return Err(e).with_context(|| format!("connect to {} failed", dest));
            }
            Err(_) => {
                wire::send_reply(&mut conn, ReplyCode::HostUnreachable, None).await?;
                return Err(ProxyError::Timeout(format!("connect to {}", dest)).into());
            }
        };

        let bind = local_addr.map(TargetAddr::Ip);
        wire::send_reply(&mut conn, ReplyCode::Succeeded, bind.as_ref()).await?;

        info!("SOCKS5 tunnel established to {}", dest);

        tunnel_with_pool(target, conn, self.bytes_pool.as_ref())
            .await
            .map_err(Into::into)
    }

    async fn handle_associate<S>(
        &self,
        mut conn: S,
        dest: TargetAddr,
        local_addr: Option<SocketAddr>,
    ) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let udp_socket = match UdpSocket::bind(dest.to_string()).await {
            Ok(socket) => socket,
            Err(e) => {
                wire::send_reply(&mut conn, ReplyCode::from(&e), None).await?;
                return Err(e).with_context(|| format!("bind relay for {} failed", dest));
            }
        };
        let udp_local = udp_socket.local_addr()?;

        let bind = match &self.packet_forward_address {
            Some(forward) => forward(local_addr, udp_local)?,
            None => default_packet_forward(local_addr, udp_local),
        };
        wire::send_reply(&mut conn, ReplyCode::Succeeded, Some(&TargetAddr::Ip(bind))).await?;

        info!("SOCKS5 UDP association on {}", udp_local);

        if let Some(handler) = &self.associate_handler {
            let udp_conn = UdpConn::wait_first(udp_socket, Box::new(conn)).await?;
            let target = TargetAddr::Ip(udp_conn.target_addr());
            let request = ProxyRequest::new(Box::new(udp_conn), "udp", &target);
            return handler.handle(request).await;
        }

        udp::run_relay(conn, udp_socket).await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Default ASSOCIATE bind reply: control-connection IP + relay port.
fn default_packet_forward(tcp_local: Option<SocketAddr>, udp_local: SocketAddr) -> SocketAddr {
    match tcp_local {
        Some(tcp) => SocketAddr::new(tcp.ip(), udp_local.port()),
        None => udp_local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::duplex;

    #[test]
    fn test_command_from_byte() {
        assert_eq!(Command::from(0x01), Command::Connect);
        assert_eq!(Command::from(0x03), Command::UdpAssociate);
        assert_eq!(Command::from(0x02), Command::Other(0x02));
        assert_eq!(Command::from(0x99), Command::Other(0x99));
    }

    #[test]
    fn test_default_packet_forward() {
        let tcp: SocketAddr = "192.168.1.10:1080".parse().unwrap();
        let udp: SocketAddr = "0.0.0.0:4444".parse().unwrap();

        let bind = default_packet_forward(Some(tcp), udp);
        assert_eq!(bind.ip(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(bind.port(), 4444);

        let bind = default_packet_forward(None, udp);
        assert_eq!(bind, udp);
    }

    #[tokio::test]
    async fn test_no_acceptable_auth_method() {
        let (mut client, server) = duplex(256);
        let engine = Server::new();

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        // offer only username/password auth
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_command_replies_07() {
        let (mut client, server) = duplex(256);
        let engine = Server::new();

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // BIND request
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], 0x07);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_atyp_replies_08() {
        let (mut client, server) = duplex(256);
        let engine = Server::new();

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x99, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x08);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_udp_disallowed_replies_07() {
        let (mut client, server) = duplex(256);
        let engine = Server::new().with_allow_udp(false);

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (mut client, server) = duplex(256);
        let engine = Server::new();

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::AsyncWriteExt;
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_dial_failure_maps_reply() {
        let (mut client, server) = duplex(512);
        let engine = Server::new();

        let task = tokio::spawn(async move { engine.serve_conn(server, None).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // connect to a port that is almost certainly closed
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x09])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert!(
            [0x01, 0x03, 0x04, 0x05].contains(&reply[1]),
            "unexpected reply code {:#04x}",
            reply[1]
        );

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }
}
