//! Byte-for-byte splicing between two open connections

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Copy bytes both ways between `a` and `b` until either direction ends.
///
/// Whichever copy finishes first (EOF or error) ends the tunnel, and both
/// connections are shut down. Returns the bytes moved `a → b` and `b → a` by
/// the direction that completed, with 0 for the one that was cut short.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
  A: AsyncRead + AsyncWrite + Unpin + Send,
  B: AsyncRead + AsyncWrite + Unpin + Send,
{
  let (mut a_read, mut a_write) = tokio::io::split(a);
  let (mut b_read, mut b_write) = tokio::io::split(b);

  let totals = {
    let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
    let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);

    tokio::select! {
      result = a_to_b => {
        if let Err(e) = &result {
          tracing::debug!("[TUNNEL] Upstream copy ended: {}", e);
        }
        (result.unwrap_or(0), 0)
      },
      result = b_to_a => {
        if let Err(e) = &result {
          tracing::debug!("[TUNNEL] Downstream copy ended: {}", e);
        }
        (0, result.unwrap_or(0))
      },
    }
  };

  let _ = a_write.shutdown().await;
  let _ = b_write.shutdown().await;
  totals
}
