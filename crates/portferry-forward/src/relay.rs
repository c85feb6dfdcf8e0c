//! Bidirectional byte relay
//!
//! Each direction runs on its own task. When a direction ends (EOF or error)
//! only the write side of its destination is shut down, so the opposite
//! direction keeps flowing until it ends too.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

impl RelayStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Relay `a` and `b` until both directions have ended
///
/// Never fails: read and write errors only end their own direction and are
/// logged at debug level. Both streams are shut down and dropped before this
/// returns.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(pump(a_read, b_write, "a->b"));
    let b_to_a = tokio::spawn(pump(b_read, a_write, "b->a"));

    let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);

    let mut stats = RelayStats::default();
    match (a_to_b, b_to_a) {
        (Ok((sent, a_read, b_write)), Ok((received, b_read, a_write))) => {
            stats.a_to_b = sent;
            stats.b_to_a = received;

            // Second shutdown is a no-op on a healthy stream
            let mut a = a_read.unsplit(a_write);
            let mut b = b_read.unsplit(b_write);
            let _ = a.shutdown().await;
            let _ = b.shutdown().await;
        }
        (a_to_b, b_to_a) => {
            // A panicked leg dropped its halves; the survivors drop here
            if let Ok((sent, _, _)) = a_to_b {
                stats.a_to_b = sent;
            }
            if let Ok((received, _, _)) = b_to_a {
                stats.b_to_a = received;
            }
            debug!("Relay leg aborted");
        }
    }

    stats
}

/// Copy `reader` into `writer` until EOF or error, then half-close `writer`
async fn pump<R, W>(mut reader: R, mut writer: W, leg: &'static str) -> (u64, R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(leg, error = %e, "Relay read ended with error");
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!(leg, error = %e, "Relay write failed");
            break;
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        debug!(leg, error = %e, "Relay shutdown failed");
    }

    (total, reader, writer)
}
