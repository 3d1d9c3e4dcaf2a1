//! Bidirectional tunnel engine
//!
//! Copies bytes between two duplex endpoints with mutual shutdown. Either
//! side terminating (EOF or error) brings the whole tunnel down; SOCKS
//! tunnels are not expected to survive a one-sided FIN.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer size used by the tunnel copiers when no pool is configured
pub const TUNNEL_BUFFER_SIZE: usize = 32 * 1024;

/// Pool of scratch buffers for the tunnel copiers
///
/// `get` must return a buffer of at least [`TUNNEL_BUFFER_SIZE`] bytes.
/// Buffer contents are not preserved across get/put. Implementations must
/// be safe for concurrent callers.
pub trait BytesPool: Send + Sync {
    /// Take a buffer from the pool.
    fn get(&self) -> Vec<u8>;
    /// Return a buffer to the pool for reuse.
    fn put(&self, buf: Vec<u8>);
}

/// Copy `reader` to `writer` through the caller's scratch buffer.
///
/// Returns the number of bytes copied; EOF terminates with Ok.
async fn copy_buf<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(written);
        }
        writer.write_all(&buf[..n]).await?;
        written += n as u64;
    }
}

/// Relay bytes between `c1` and `c2` until either side terminates.
///
/// Two copiers run concurrently: `c2 -> c1` using `buf1` and `c1 -> c2`
/// using `buf2`. The first copier to finish (EOF or error) cancels its
/// sibling, then both write halves are shut down. Returns the first error
/// in the order [finished copier, shutdown c1, shutdown c2]; EOF and
/// cancellation count as success.
pub async fn tunnel<A, B>(c1: A, c2: B, buf1: &mut [u8], buf2: &mut [u8]) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read1, mut write1) = tokio::io::split(c1);
    let (mut read2, mut write2) = tokio::io::split(c2);

    let first = {
        let a = copy_buf(&mut read2, &mut write1, buf1);
        let b = copy_buf(&mut read1, &mut write2, buf2);
        tokio::pin!(a);
        tokio::pin!(b);

        tokio::select! {
            result = &mut a => result,
            result = &mut b => result,
        }
    };

    let close1 = write1.shutdown().await;
    let close2 = write2.shutdown().await;

    first.map(|_| ())?;
    close1?;
    close2?;
    Ok(())
}

/// Run [`tunnel`] with buffers taken from an optional pool.
///
/// Without a pool, two [`TUNNEL_BUFFER_SIZE`] buffers are allocated for
/// the lifetime of the tunnel.
pub async fn tunnel_with_pool<A, B>(
    c1: A,
    c2: B,
    pool: Option<&Arc<dyn BytesPool>>,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match pool {
        Some(pool) => {
            let mut buf1 = pool.get();
            let mut buf2 = pool.get();
            let result = tunnel(c1, c2, &mut buf1, &mut buf2).await;
            pool.put(buf1);
            pool.put(buf2);
            result
        }
        None => {
            let mut buf1 = vec![0u8; TUNNEL_BUFFER_SIZE];
            let mut buf2 = vec![0u8; TUNNEL_BUFFER_SIZE];
            tunnel(c1, c2, &mut buf1, &mut buf2).await
        }
    }
}
