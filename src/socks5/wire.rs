//! SOCKS5 address codec
//!
//! Reads and writes the ATYP-prefixed address records used in requests,
//! replies and UDP packet headers.
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```

use crate::addr::TargetAddr;
use crate::error::{ProxyError, ReplyCode, Socks5Error};
use crate::socks5::consts::*;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read an ATYP-prefixed address and port from the stream.
///
/// An unknown ATYP surfaces as [`Socks5Error::AddressTypeNotSupported`];
/// the engine must reply `0x08` before closing in that case.
pub async fn read_addr<S>(stream: &mut S) -> Result<TargetAddr, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let addr_type = stream.read_u8().await?;

    match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::ipv4(Ipv4Addr::from(octets), port))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(Socks5Error::InvalidDomain("empty domain".to_string()).into());
            }
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let domain = String::from_utf8(name)
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::domain(domain, port))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::ipv6(Ipv6Addr::from(octets), port))
        }

        other => Err(Socks5Error::AddressTypeNotSupported(other).into()),
    }
}

/// Parse an ATYP-prefixed address from a byte slice.
///
/// Returns the address and the number of bytes consumed. Used for the
/// headers of encapsulated UDP packets.
pub fn read_addr_from(buf: &[u8]) -> Result<(TargetAddr, usize), ProxyError> {
    if buf.is_empty() {
        return Err(Socks5Error::InvalidAddress("empty address record".to_string()).into());
    }

    match buf[0] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                return Err(Socks5Error::InvalidAddress("short IPv4 record".to_string()).into());
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((TargetAddr::ipv4(ip, port), 7))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            if buf.len() < 2 {
                return Err(Socks5Error::InvalidAddress("short domain record".to_string()).into());
            }
            let len = buf[1] as usize;
            if len == 0 {
                return Err(Socks5Error::InvalidDomain("empty domain".to_string()).into());
            }
            if buf.len() < 2 + len + 2 {
                return Err(Socks5Error::InvalidAddress("short domain record".to_string()).into());
            }
            let domain = String::from_utf8(buf[2..2 + len].to_vec())
                .map_err(|e| Socks5Error::InvalidDomain(e.to_string()))?;
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok((TargetAddr::domain(domain, port), 2 + len + 2))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.len() < 1 + 16 + 2 {
                return Err(Socks5Error::InvalidAddress("short IPv6 record".to_string()).into());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok((TargetAddr::ipv6(Ipv6Addr::from(octets), port), 19))
        }

        other => Err(Socks5Error::AddressTypeNotSupported(other).into()),
    }
}

/// Serialize an address to its ATYP-prefixed byte form.
///
/// `None` yields the zero bind: `ATYP=IPv4, 0.0.0.0:0`.
pub fn addr_to_bytes(addr: Option<&TargetAddr>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(7);

    match addr {
        None => {
            bytes.push(SOCKS5_ADDR_TYPE_IPV4);
            bytes.extend_from_slice(&[0, 0, 0, 0]);
            bytes.extend_from_slice(&0u16.to_be_bytes());
        }
        Some(TargetAddr::Ip(addr)) => match addr {
            std::net::SocketAddr::V4(v4) => {
                bytes.push(SOCKS5_ADDR_TYPE_IPV4);
                bytes.extend_from_slice(&v4.ip().octets());
                bytes.extend_from_slice(&v4.port().to_be_bytes());
            }
            std::net::SocketAddr::V6(v6) => {
                bytes.push(SOCKS5_ADDR_TYPE_IPV6);
                bytes.extend_from_slice(&v6.ip().octets());
                bytes.extend_from_slice(&v6.port().to_be_bytes());
            }
        },
        Some(TargetAddr::Domain(domain, port)) => {
            let name = domain.as_bytes();
            let len = name.len().min(MAX_DOMAIN_LEN);
            bytes.push(SOCKS5_ADDR_TYPE_DOMAIN);
            bytes.push(len as u8);
            bytes.extend_from_slice(&name[..len]);
            bytes.extend_from_slice(&port.to_be_bytes());
        }
    }

    bytes
}

/// Send a SOCKS5 reply.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// ```
pub async fn send_reply<S>(
    stream: &mut S,
    code: ReplyCode,
    bind_addr: Option<&TargetAddr>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = vec![SOCKS5_VERSION, code.into(), SOCKS5_RESERVED];
    reply.extend_from_slice(&addr_to_bytes(bind_addr));
    stream.write_all(&reply).await?;
    stream.flush().await
}
