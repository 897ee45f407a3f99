//! Bidirectional byte relay between two duplex endpoints.
//!
//! One direction runs on a spawned task, the other on the caller. Whichever
//! direction ends first (EOF or I/O error) tears down both endpoints; there
//! is no half-close and no retry.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved in each direction by one relay. A direction cut short by
/// teardown reports 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// `a` → `b`
    pub forward: u64,
    /// `b` → `a`
    pub reverse: u64,
}

/// Copy bytes between `a` and `b` until either direction ends, then close
/// both.
///
/// Returns once both endpoints have been dropped.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut reverse = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        copied
    });

    let mut stats = RelayStats::default();

    tokio::select! {
        copied = tokio::io::copy(&mut a_read, &mut b_write) => {
            match copied {
                Ok(n) => stats.forward = n,
                Err(e) => debug!(error = %e, "relay forward direction ended with error"),
            }
            // Dropping the task's halves unblocks its pending read.
            reverse.abort();
            if let Ok(Ok(n)) = (&mut reverse).await {
                stats.reverse = n;
            }
        }
        joined = &mut reverse => {
            match joined {
                Ok(Ok(n)) => stats.reverse = n,
                Ok(Err(e)) => debug!(error = %e, "relay reverse direction ended with error"),
                Err(e) => debug!(error = %e, "relay reverse task failed"),
            }
        }
    }

    let _ = b_write.shutdown().await;
    drop(a_read);
    drop(b_write);

    stats
}
