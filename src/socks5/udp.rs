//! SOCKS5 UDP ASSOCIATE relay
//!
//! Implements the RFC 1928 §7 encapsulation:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! The relay latches the first datagram sender as the client and the
//! first well-formed header destination as the target; neither is ever
//! re-assigned. The association lives until the controlling TCP
//! connection closes.

use crate::addr::TargetAddr;
use crate::request::ProxyStream;
use crate::socks5::consts::MAX_UDP_PACKET;
use crate::socks5::wire;
use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tracing::debug;

/// Length of the fixed part of the encapsulation header (RSV + FRAG)
const UDP_HEADER_FIXED: usize = 3;

/// Build the cached reply prefix: `00 00 00` followed by the encoded target.
fn reply_prefix(target: &TargetAddr) -> Vec<u8> {
    let mut prefix = vec![0u8, 0, 0];
    prefix.extend_from_slice(&wire::addr_to_bytes(Some(target)));
    prefix
}

/// Run the built-in relay loop until the control connection closes.
///
/// Datagrams from the latched client have their header stripped and the
/// payload forwarded to the latched target; datagrams from the target are
/// prefixed with the cached header and sent back to the client. Anything
/// else is ignored.
pub(crate) async fn run_relay<S>(mut control: S, socket: UdpSocket) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 1];
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    let mut source_addr: Option<SocketAddr> = None;
    // header form and resolved address, latched together
    let mut target: Option<(TargetAddr, SocketAddr)> = None;
    let mut prefix: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            read = control.read(&mut scratch) => {
                match read {
                    Ok(0) => {
                        debug!("Association control connection closed");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Association control connection error: {}", e);
                        break;
                    }
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;

                let source = match source_addr {
                    Some(source) => source,
                    None => {
                        source_addr = Some(from);
                        from
                    }
                };

                if from == source {
                    // client -> target
                    if n < UDP_HEADER_FIXED {
                        continue;
                    }
                    let (addr, consumed) = match wire::read_addr_from(&buf[UDP_HEADER_FIXED..n]) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            debug!("Dropping malformed UDP packet: {}", e);
                            continue;
                        }
                    };

                    let resolved = match &target {
                        None => {
                            let resolved = match addr.resolve().await {
                                Ok(resolved) => resolved,
                                Err(e) => {
                                    debug!("Failed to resolve UDP target {}: {}", addr, e);
                                    continue;
                                }
                            };
                            target = Some((addr, resolved));
                            resolved
                        }
                        Some((header, resolved)) => {
                            if header != &addr {
                                debug!("Ignoring non-target address {}", addr);
                                continue;
                            }
                            *resolved
                        }
                    };

                    socket
                        .send_to(&buf[UDP_HEADER_FIXED + consumed..n], resolved)
                        .await?;
                } else if matches!(&target, Some((_, resolved)) if *resolved == from) {
                    // target -> client
                    let prefix = prefix.get_or_insert_with(|| {
                        reply_prefix(&TargetAddr::Ip(from))
                    });
                    let mut packet = Vec::with_capacity(prefix.len() + n);
                    packet.extend_from_slice(prefix);
                    packet.extend_from_slice(&buf[..n]);
                    socket.send_to(&packet, source).await?;
                }
                // datagrams from anyone else are ignored
            }
        }
    }

    Ok(())
}

/// Datagram-preserving stream over a UDP association, for handler hand-off
///
/// Each read yields the decapsulated payload of one client datagram and
/// returns EOF when the control connection closes; each write is
/// encapsulated with the cached target header and sent to the client.
pub struct UdpConn {
    socket: UdpSocket,
    control: Box<dyn ProxyStream>,
    source: SocketAddr,
    header: TargetAddr,
    target: SocketAddr,
    prefix: Vec<u8>,
    pending: Option<Vec<u8>>,
    recv_buf: Vec<u8>,
}

impl UdpConn {
    /// Wait for the first client datagram and latch the association.
    ///
    /// Loops until a well-formed packet arrives; its sender becomes the
    /// client and its header destination the target. The payload is
    /// buffered and served by the first read.
    pub(crate) async fn wait_first(
        socket: UdpSocket,
        control: Box<dyn ProxyStream>,
    ) -> Result<Self> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if n < UDP_HEADER_FIXED {
                continue;
            }
            let (addr, consumed) = match wire::read_addr_from(&buf[UDP_HEADER_FIXED..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Dropping malformed UDP packet: {}", e);
                    continue;
                }
            };
            let target = match addr.resolve().await {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!("Failed to resolve UDP target {}: {}", addr, e);
                    continue;
                }
            };

            let payload = buf[UDP_HEADER_FIXED + consumed..n].to_vec();
            let prefix = reply_prefix(&TargetAddr::Ip(target));

            return Ok(UdpConn {
                socket,
                control,
                source: from,
                header: addr,
                target,
                prefix,
                pending: Some(payload),
                recv_buf: vec![0u8; MAX_UDP_PACKET],
            });
        }
    }

    /// The resolved target address latched from the first packet.
    pub fn target_addr(&self) -> SocketAddr {
        self.target
    }

    /// The client address latched from the first packet.
    pub fn source_addr(&self) -> SocketAddr {
        self.source
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(payload) = this.pending.take() {
            let n = payload.len().min(buf.remaining());
            buf.put_slice(&payload[..n]);
            return Poll::Ready(Ok(()));
        }

        loop {
            // The association ends when the control connection closes;
            // a closed or failed control read surfaces as EOF here.
            let mut scratch = [0u8; 1];
            let mut control_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut this.control).poll_read(cx, &mut control_buf) {
                Poll::Ready(Ok(())) if control_buf.filled().is_empty() => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
                Poll::Pending => {}
            }

            let mut recv = ReadBuf::new(&mut this.recv_buf);
            let from = match this.socket.poll_recv_from(cx, &mut recv) {
                Poll::Ready(Ok(from)) => from,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let n = recv.filled().len();
            if from != this.source || n < UDP_HEADER_FIXED {
                continue;
            }
            let (addr, consumed) = match wire::read_addr_from(&this.recv_buf[UDP_HEADER_FIXED..n]) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            if addr != this.header {
                continue;
            }

            let payload = &this.recv_buf[UDP_HEADER_FIXED + consumed..n];
            let len = payload.len().min(buf.remaining());
            buf.put_slice(&payload[..len]);
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let mut packet = Vec::with_capacity(this.prefix.len() + buf.len());
        packet.extend_from_slice(&this.prefix);
        packet.extend_from_slice(buf);

        match this.socket.poll_send_to(cx, &packet, this.source) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
