//! HTTP proxy engine
//!
//! Serves one HTTP/1.1 request per connection: either a CONNECT
//! handshake followed by a raw tunnel, or an absolute-form request that
//! is replayed verbatim to the upstream with the response flowing back
//! through the tunnel. No keep-alive across requests.

pub mod response;

use crate::addr::TargetAddr;
use crate::error::ProxyError;
use crate::mixed::peek::PeekStream;
use crate::request::{DefaultDialer, Dialer, ProxyRequest, ProxyStream, UserHandler};
use crate::tunnel::{tunnel_with_pool, BytesPool};
use self::response::ResponseWriter;
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Read/write deadline covering the whole connection, applied on accept
const CONNECTION_DEADLINE: Duration = Duration::from_secs(300);

/// Default deadline for the upstream dial
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the request head (request line + headers)
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Reply sent after a successful CONNECT handshake
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// HTTP server engine
pub struct Server {
    dialer: Arc<dyn Dialer>,
    connect_handler: Option<Arc<dyn UserHandler>>,
    bytes_pool: Option<Arc<dyn BytesPool>>,
    request_timeout: Duration,
}

/// One parsed request plus every byte read from the wire so far
struct ParsedRequest {
    is_connect: bool,
    host: String,
    port: u16,
    /// All bytes consumed from the connection
    buf: Vec<u8>,
    /// Offset where the head ends and payload bytes begin
    head_len: usize,
}

impl ParsedRequest {
    fn dest(&self) -> TargetAddr {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(std::net::SocketAddr::new(ip, self.port)),
            Err(_) => TargetAddr::domain(self.host.clone(), self.port),
        }
    }
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

    /// Hand requests off to a user handler.
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

    /// Serve one HTTP connection to completion.
    ///
    /// The whole exchange, including any tunnel that follows the
    /// handshake, runs under a single five-minute deadline.
    pub async fn serve_conn<S>(&self, conn: S) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        tokio::time::timeout(CONNECTION_DEADLINE, self.serve_inner(conn))
            .await
            .map_err(|_| ProxyError::Timeout("HTTP connection deadline".to_string()))?
    }

    async fn serve_inner<S>(&self, mut conn: S) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let parsed = read_request(&mut conn).await?;

        let dest = parsed.dest();
        debug!(
            "HTTP {} request for {}",
            if parsed.is_connect { "CONNECT" } else { "forward" },
            dest
        );

        if let Some(handler) = &self.connect_handler {
            return self.hand_off(conn, parsed, dest, handler).await;
        }
        self.serve_builtin(conn, parsed, dest).await
    }

    /// Reply (CONNECT) or replay (forward), then hand the wrapped
    /// connection to the user handler.
    async fn hand_off<S>(
        &self,
        mut conn: S,
        parsed: ParsedRequest,
        dest: TargetAddr,
        handler: &Arc<dyn UserHandler>,
    ) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let wrapped = if parsed.is_connect {
            conn.write_all(CONNECT_ESTABLISHED).await?;
            conn.flush().await?;
            // bytes past the head belong to the tunnel
            PeekStream::with_prefix(conn, &parsed.buf[parsed.head_len..])
        } else {
            // the handler must see the request again, from the first byte
            PeekStream::with_prefix(conn, &parsed.buf)
        };

        let request = ProxyRequest::new(Box::new(wrapped), "tcp", &dest);
        handler.handle(request).await
    }

    /// Send a 503 with a short plain-text body.
    async fn reply_unavailable<S>(&self, conn: &mut S, message: &str) -> std::io::Result<()>
    where
        S: ProxyStream,
    {
        let mut writer = ResponseWriter::new(conn);
        writer.insert_header("Content-Type", "text/plain; charset=utf-8");
        writer.insert_header("Connection", "close");
        writer.write_header(503).await?;
        writer.write(format!("{}\n", message).as_bytes()).await
    }

    /// Dial the destination and run the built-in tunnel.
    async fn serve_builtin<S>(&self, mut conn: S, parsed: ParsedRequest, dest: TargetAddr) -> Result<()>
    where
        S: ProxyStream + 'static,
    {
        let dest_str = dest.to_string();
        let dial = self.dialer.dial("tcp", &dest_str);
        let (mut target, _local_addr) = match tokio::time::timeout(self.request_timeout, dial).await
        {
            Ok(Ok(dialed)) => dialed,
            Ok(Err(e)) => {
                self.reply_unavailable(&mut conn, &e.to_string()).await?;
                return Err(e).with_context(|| format!("connect to {} failed", dest));
            }
            Err(_) => {
                self.reply_unavailable(&mut conn, "upstream connect timed out").await?;
                return Err(ProxyError::Timeout(format!("connect to {}", dest)).into());
            }
        };

        info!("HTTP tunnel established to {}", dest);

        if parsed.is_connect {
            conn.write_all(CONNECT_ESTABLISHED).await?;
            conn.flush().await?;
            let client = PeekStream::with_prefix(conn, &parsed.buf[parsed.head_len..]);
            tunnel_with_pool(target, client, self.bytes_pool.as_ref())
                .await
                .map_err(Into::into)
        } else {
            // replay the request verbatim; the remaining body, if any,
            // flows through the tunnel
            target.write_all(&parsed.buf).await?;
            target.flush().await?;
            tunnel_with_pool(target, conn, self.bytes_pool.as_ref())
                .await
                .map_err(Into::into)
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulate bytes until httparse sees a complete head, then extract the
/// destination.
async fn read_request<S>(conn: &mut S) -> Result<ParsedRequest>
where
    S: ProxyStream,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            bail!(ProxyError::Http("client closed before request head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_SIZE {
                    bail!(ProxyError::Http("request head too large".to_string()));
                }
                continue;
            }
            Err(e) => bail!(ProxyError::Http(format!("malformed request: {}", e))),
        };

        let method = req.method.unwrap_or_default();
        let path = req.path.unwrap_or_default();
        let is_connect = method.eq_ignore_ascii_case("CONNECT");

        let (host, port) = if is_connect {
            if path.is_empty() {
                bail!(ProxyError::Http("CONNECT without authority".to_string()));
            }
            split_host_port(path, 443)
        } else {
            match parse_absolute_uri(path) {
                Some(target) => target,
                None => {
                    // origin-form: fall back to the Host header
                    let host_header = req
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case("host"))
                        .map(|h| String::from_utf8_lossy(h.value).into_owned());
                    match host_header {
                        Some(host) => split_host_port(&host, 80),
                        None => bail!(ProxyError::Http("no host in request".to_string())),
                    }
                }
            }
        };

        if host.is_empty() {
            bail!(ProxyError::Http("empty host".to_string()));
        }

        return Ok(ParsedRequest {
            is_connect,
            host,
            port,
            buf,
            head_len,
        });
    }
}

/// Extract host and port from an absolute-form request target.
///
/// Returns `None` for origin-form targets (those starting with `/`).
fn parse_absolute_uri(path: &str) -> Option<(String, u16)> {
    let (rest, default_port) = if let Some(rest) = path.strip_prefix("http://") {
        (rest, 80)
    } else if let Some(rest) = path.strip_prefix("https://") {
        (rest, 443)
    } else {
        return None;
    };

    let authority = match rest.find('/') {
        Some(slash) => &rest[..slash],
        None => rest,
    };
    Some(split_host_port(authority, default_port))
}

/// Split `host:port`, keeping IPv6 bracket literals intact.
fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6 literal
        if let Some(close) = rest.find(']') {
            let host = rest[..close].to_string();
            let port = rest[close + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
        return (authority.to_string(), default_port);
    }

    // more than one colon without brackets: a raw IPv6 literal
    if authority.matches(':').count() > 1 {
        return (authority.to_string(), default_port);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:8080", 80),
            ("example.com".to_string(), 8080)
        );
        assert_eq!(
            split_host_port("example.com", 443),
            ("example.com".to_string(), 443)
        );
        assert_eq!(split_host_port("[::1]:70", 80), ("::1".to_string(), 70));
        assert_eq!(split_host_port("[::1]", 80), ("::1".to_string(), 80));
    }

    #[test]
    fn test_parse_absolute_uri() {
        assert_eq!(
            parse_absolute_uri("http://example.com/index.html"),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(
            parse_absolute_uri("https://example.com"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_absolute_uri("http://example.com:8080/x"),
            Some(("example.com".to_string(), 8080))
        );
        assert_eq!(parse_absolute_uri("/index.html"), None);
    }

    #[tokio::test]
    async fn test_read_request_connect() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let parsed = read_request(&mut server).await.unwrap();
        assert!(parsed.is_connect);
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.head_len, parsed.buf.len());
    }

    #[tokio::test]
    async fn test_read_request_absolute_form() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let parsed = read_request(&mut server).await.unwrap();
        assert!(!parsed.is_connect);
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
    }

    #[tokio::test]
    async fn test_read_request_origin_form_uses_host_header() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"GET /path HTTP/1.1\r\nHost: internal:3000\r\n\r\n")
            .await
            .unwrap();

        let parsed = read_request(&mut server).await.unwrap();
        assert_eq!(parsed.host, "internal");
        assert_eq!(parsed.port, 3000);
    }

    #[tokio::test]
    async fn test_read_request_split_across_reads() {
        let (mut client, mut server) = duplex(1024);

        let reader = tokio::spawn(async move { read_request(&mut server).await.map(|p| p.host) });

        client.write_all(b"CONNECT example.com:443 HT").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"TP/1.1\r\n\r\n").await.unwrap();

        let host = reader.await.unwrap().unwrap();
        assert_eq!(host, "example.com");
    }

    #[tokio::test]
    async fn test_read_request_malformed() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"\x01\x02garbage\r\n\r\n").await.unwrap();

        assert!(read_request(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_replies_503() {
        let engine = Server::new();
        let (mut client, server) = duplex(4096);

        let task = tokio::spawn(async move { engine.serve_conn(server).await });

        client
            .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            match tokio::time::timeout(Duration::from_secs(2), client.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => response.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
            }
        }

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "got: {}", text);

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }
}
