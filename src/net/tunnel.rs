//! Bidirectional byte tunnel.
//!
//! Two copy loops, one per direction. The first loop to finish, by EOF or
//! error, ends the tunnel: the other loop is dropped and both write halves
//! are shut down.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Side of the tunnel whose read half finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Remote,
    Local,
}

/// How a tunnel ended.
#[derive(Debug)]
pub struct TunnelOutcome {
    /// The side that closed (or failed) first.
    pub closed_by: Side,
    /// Bytes copied from that side before it closed.
    pub bytes: u64,
    /// Copy error, if the side failed instead of closing cleanly.
    pub error: Option<std::io::Error>,
}

/// Copy bytes between `remote` and `local` until either side closes.
pub async fn tunnel<R, L>(remote: R, local: L) -> TunnelOutcome
where
    R: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);

    let (closed_by, result) = tokio::select! {
        r = tokio::io::copy(&mut remote_rd, &mut local_wr) => (Side::Remote, r),
        r = tokio::io::copy(&mut local_rd, &mut remote_wr) => (Side::Local, r),
    };

    let _ = local_wr.shutdown().await;
    let _ = remote_wr.shutdown().await;

    let outcome = match result {
        Ok(bytes) => TunnelOutcome {
            closed_by,
            bytes,
            error: None,
        },
        Err(e) => TunnelOutcome {
            closed_by,
            bytes: 0,
            error: Some(e),
        },
    };
    tracing::trace!(closed_by = ?outcome.closed_by, bytes = outcome.bytes, "tunnel closed");
    outcome
}
