//! SOCKS4/4a wire codec
//!
//! Requests carry a 2-byte big-endian port, a 4-byte IPv4 address and a
//! NUL-terminated username. The SOCKS4a extension signals "hostname
//! follows" with the sentinel address `0.0.0.x` (x != 0); the hostname is
//! another NUL-terminated string after the username.

use crate::addr::TargetAddr;
use crate::error::{ProxyError, Socks4Error, Socks4Reply};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS4 protocol version
pub const SOCKS4_VERSION: u8 = 0x04;

/// Version field of every SOCKS4 reply
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;

/// TCP CONNECT command
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;

/// TCP BIND command
pub const SOCKS4_CMD_BIND: u8 = 0x02;

/// Upper bound on NUL-terminated strings (username, hostname)
const MAX_CSTRING_LEN: usize = 255;

/// Read a NUL-terminated string, excluding the terminator.
///
/// Capped at 255 bytes; longer strings are a protocol violation.
pub async fn read_cstring<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(bytes);
        }
        if bytes.len() == MAX_CSTRING_LEN {
            return Err(Socks4Error::InvalidAddress("string exceeds 255 bytes".to_string()).into());
        }
        bytes.push(byte);
    }
}

/// Read the destination and username of a SOCKS4/4a request.
///
/// The sentinel address `0.0.0.x` (x != 0) switches to SOCKS4a and an
/// additional NUL-terminated hostname is read.
pub async fn read_addr_and_user<S>(stream: &mut S) -> Result<(TargetAddr, String), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;

    let socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;

    let username = read_cstring(stream).await?;
    let username = String::from_utf8_lossy(&username).into_owned();

    let dest = if socks4a {
        let hostname = read_cstring(stream).await?;
        let hostname = String::from_utf8(hostname)
            .map_err(|e| Socks4Error::InvalidAddress(e.to_string()))?;
        if hostname.is_empty() {
            return Err(Socks4Error::InvalidAddress("empty hostname".to_string()).into());
        }
        TargetAddr::domain(hostname, port)
    } else {
        TargetAddr::ipv4(Ipv4Addr::from(ip), port)
    };

    Ok((dest, username))
}

/// Write a SOCKS4 address record: 2-byte BE port + 4 IPv4 octets.
///
/// `None` and non-IPv4 addresses encode as zeros.
pub fn addr_to_bytes(addr: Option<&TargetAddr>) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    if let Some(TargetAddr::Ip(SocketAddr::V4(v4))) = addr {
        bytes[..2].copy_from_slice(&v4.port().to_be_bytes());
        bytes[2..].copy_from_slice(&v4.ip().octets());
    } else if let Some(addr) = addr {
        bytes[..2].copy_from_slice(&addr.port().to_be_bytes());
    }
    bytes
}

/// Send a SOCKS4 reply: `VN=0x00, CD, DSTPORT, DSTIP`.
pub async fn send_reply<S>(
    stream: &mut S,
    code: Socks4Reply,
    bind_addr: Option<&TargetAddr>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = vec![SOCKS4_REPLY_VERSION, code.into()];
    reply.extend_from_slice(&addr_to_bytes(bind_addr));
    stream.write_all(&reply).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_cstring() {
        let mut cursor = Cursor::new(b"user\0rest".to_vec());
        let s = read_cstring(&mut cursor).await.unwrap();
        assert_eq!(s, b"user");
    }

    #[tokio::test]
    async fn test_read_cstring_empty() {
        let mut cursor = Cursor::new(vec![0u8]);
        let s = read_cstring(&mut cursor).await.unwrap();
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_read_cstring_too_long() {
        let mut data = vec![b'a'; 300];
        data.push(0);
        let mut cursor = Cursor::new(data);
        assert!(read_cstring(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_read_cstring_unterminated() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        assert!(read_cstring(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_read_addr_and_user_plain() {
        // port 80, 93.184.216.34, empty user
        let request = vec![0x00, 0x50, 93, 184, 216, 34, 0x00];
        let mut cursor = Cursor::new(request);

        let (dest, user) = read_addr_and_user(&mut cursor).await.unwrap();
        assert_eq!(dest, TargetAddr::ipv4(Ipv4Addr::new(93, 184, 216, 34), 80));
        assert!(user.is_empty());
    }

    #[tokio::test]
    async fn test_read_addr_and_user_socks4a() {
        // port 80, sentinel 0.0.0.1, user "user", hostname "example.com"
        let mut request = vec![0x00, 0x50, 0, 0, 0, 1];
        request.extend_from_slice(b"user\0");
        request.extend_from_slice(b"example.com\0");
        let mut cursor = Cursor::new(request);

        let (dest, user) = read_addr_and_user(&mut cursor).await.unwrap();
        assert_eq!(dest, TargetAddr::domain("example.com".to_string(), 80));
        assert_eq!(user, "user");
    }

    #[tokio::test]
    async fn test_sentinel_requires_nonzero_last_octet() {
        // 0.0.0.0 is not the SOCKS4a sentinel
        let mut request = vec![0x00, 0x50, 0, 0, 0, 0];
        request.extend_from_slice(b"u\0");
        let mut cursor = Cursor::new(request);

        let (dest, _) = read_addr_and_user(&mut cursor).await.unwrap();
        assert_eq!(dest, TargetAddr::ipv4(Ipv4Addr::new(0, 0, 0, 0), 80));
    }

    #[tokio::test]
    async fn test_socks4a_empty_hostname_rejected() {
        let mut request = vec![0x00, 0x50, 0, 0, 0, 7];
        request.extend_from_slice(b"u\0");
        request.push(0);
        let mut cursor = Cursor::new(request);

        assert!(read_addr_and_user(&mut cursor).await.is_err());
    }

    #[test]
    fn test_addr_to_bytes() {
        let addr = TargetAddr::ipv4(Ipv4Addr::new(10, 0, 0, 1), 8080);
        let bytes = addr_to_bytes(Some(&addr));
        assert_eq!(&bytes[..2], &8080u16.to_be_bytes());
        assert_eq!(&bytes[2..], &[10, 0, 0, 1]);

        assert_eq!(addr_to_bytes(None), [0u8; 6]);
    }

    #[test]
    fn test_addr_to_bytes_domain_keeps_port() {
        let addr = TargetAddr::domain("example.com".to_string(), 443);
        let bytes = addr_to_bytes(Some(&addr));
        assert_eq!(&bytes[..2], &443u16.to_be_bytes());
        assert_eq!(&bytes[2..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_send_reply_granted() {
        let mut buf = Vec::new();
        let bind = TargetAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 1080);
        send_reply(&mut buf, Socks4Reply::Granted, Some(&bind))
            .await
            .unwrap();

        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], 0x5A);
        assert_eq!(&buf[2..4], &1080u16.to_be_bytes());
        assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_send_reply_rejected() {
        let mut buf = Vec::new();
        send_reply(&mut buf, Socks4Reply::Rejected, None).await.unwrap();
        assert_eq!(buf, vec![0x00, 0x5B, 0, 0, 0, 0, 0, 0]);
    }
}
