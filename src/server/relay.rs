// src/server/relay.rs
//! Byte relay between a client connection and its TUN interface.
//!
//! Two tasks copy in opposite directions. Whichever finishes first, by EOF
//! or error, ends the session: the other task is aborted, which drops its
//! halves and closes both the connection and the interface.

use bytes::Bytes;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Direction a relay task copies in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToInterface,
    InterfaceToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToInterface => f.write_str("client -> interface"),
            Self::InterfaceToClient => f.write_str("interface -> client"),
        }
    }
}

/// How the first relay task to finish ended
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: Direction,
    /// Bytes copied, or the I/O error that stopped the copy
    pub result: io::Result<u64>,
}

/// Relay until either direction ends, writing `pending` to the interface
/// first. Returns the outcome of the direction that ended the session.
pub async fn relay<C, I>(conn: C, interface: I, pending: Bytes) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut conn_read, mut conn_write) = tokio::io::split(conn);
    let (mut iface_read, mut iface_write) = tokio::io::split(interface);

    // One slot per task, so neither send can block
    let (tx, mut rx) = mpsc::channel::<RelayOutcome>(2);

    let upstream_tx = tx.clone();
    let upstream = tokio::spawn(async move {
        let result = forward_with_pending(&mut conn_read, &mut iface_write, pending).await;
        let _ = upstream_tx
            .send(RelayOutcome {
                direction: Direction::ClientToInterface,
                result,
            })
            .await;
    });

    let downstream = tokio::spawn(async move {
        let result = tokio::io::copy(&mut iface_read, &mut conn_write).await;
        let _ = tx
            .send(RelayOutcome {
                direction: Direction::InterfaceToClient,
                result,
            })
            .await;
    });

    let first = rx.recv().await.unwrap_or_else(|| RelayOutcome {
        // Only reachable if both tasks panicked before reporting
        direction: Direction::ClientToInterface,
        result: Err(io::Error::new(
            io::ErrorKind::Other,
            "relay tasks ended without reporting",
        )),
    });
    trace!("Relay {} finished first", first.direction);

    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;

    if let Ok(second) = rx.try_recv() {
        debug!(
            "Relay {} also finished: {:?}",
            second.direction, second.result
        );
    }

    first
}

async fn forward_with_pending<R, W>(reader: &mut R, writer: &mut W, pending: Bytes) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    if !pending.is_empty() {
        writer.write_all(&pending).await?;
        copied += pending.len() as u64;
    }
    copied += tokio::io::copy(reader, writer).await?;
    Ok(copied)
}
