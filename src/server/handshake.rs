// src/server/handshake.rs
//! Hello exchange with a newly accepted client.
//!
//! The client speaks first with a [`ClientHello`]; the server checks the
//! passcode, reserves the blocks the client says it already uses, allocates
//! a block and answers with exactly one [`ServerHello`]. A connection that
//! never produces a readable hello gets no answer at all.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::network::ip_pool::{AddressBlock, AddressPool, PoolError};
use crate::protocol::codec::{CodecError, ServerCodec};
use crate::protocol::types::{ClientHello, HandshakeStatus, ServerHello};
use crate::utils::constant_time_eq;
use crate::utils::logging::log_security_event;

/// Error type for the hello exchange
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Could not read client hello: {0}")]
    Protocol(#[source] CodecError),

    #[error("Connection closed before client hello")]
    Closed,

    #[error("Client presented a wrong passcode")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(#[source] PoolError),

    #[error("No free address blocks")]
    NoFreeIps,

    #[error("Internal error: {0}")]
    Internal(#[source] PoolError),

    #[error("Failed to send server hello: {0}")]
    Transport(#[source] CodecError),
}

impl HandshakeError {
    /// Status of the rejection sent to the client, if one was sent
    pub fn status(&self) -> Option<HandshakeStatus> {
        match self {
            Self::Forbidden => Some(HandshakeStatus::Forbidden),
            Self::BadRequest(_) => Some(HandshakeStatus::BadRequest),
            Self::NoFreeIps => Some(HandshakeStatus::NoFreeIps),
            Self::Internal(_) => Some(HandshakeStatus::InternalError),
            Self::Protocol(_) | Self::Closed | Self::Transport(_) => None,
        }
    }
}

/// Runs one hello exchange against the shared pool
pub struct HandshakeCoordinator<'a> {
    passcode: Option<&'a str>,
    pool: &'a AddressPool,
}

impl<'a> HandshakeCoordinator<'a> {
    pub fn new(passcode: Option<&'a str>, pool: &'a AddressPool) -> Self {
        Self { passcode, pool }
    }

    /// Negotiate a block for the client on the other end of `framed`.
    ///
    /// On success the block has been allocated and the client told its
    /// addresses. Bytes the client sent after its hello stay in the read
    /// buffer of `framed`.
    pub async fn run<S>(&self, framed: &mut Framed<S, ServerCodec>) -> Result<AddressBlock, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello = match framed.next().await {
            Some(Ok(hello)) => hello,
            Some(Err(e)) => return Err(HandshakeError::Protocol(e)),
            None => return Err(HandshakeError::Closed),
        };
        debug!("Received {:?}", hello);

        let outcome = self.negotiate(&hello);
        let reply = match &outcome {
            Ok(block) => ServerHello::ok(block.client_ip(), block.client_gateway()),
            Err(e) => ServerHello::rejected(e.status().unwrap_or(HandshakeStatus::InternalError)),
        };

        match framed.send(reply).await {
            Ok(()) => {
                if let Ok(block) = &outcome {
                    info!(
                        "Handshake complete: assigned {} (client {} via {})",
                        block,
                        block.client_ip(),
                        block.client_gateway()
                    );
                }
                outcome
            }
            Err(e) => match outcome {
                Ok(block) => {
                    warn!("Allocated {} but could not deliver it: {}", block, e);
                    Err(HandshakeError::Transport(e))
                }
                Err(rejection) => {
                    warn!("Failed to deliver {} reply: {}", reply.status, e);
                    Err(rejection)
                }
            },
        }
    }

    fn negotiate(&self, hello: &ClientHello) -> Result<AddressBlock, HandshakeError> {
        if let Some(expected) = self.passcode {
            if !constant_time_eq(expected.as_bytes(), hello.passcode.as_bytes()) {
                log_security_event("AUTH_FAILURE", "Client presented a wrong passcode");
                return Err(HandshakeError::Forbidden);
            }
        }

        for declared in &hello.unavailable_private_ips {
            self.pool.reserve_declared(declared).map_err(|e| match e {
                PoolError::MalformedAddress(_) => HandshakeError::BadRequest(e),
                other => HandshakeError::Internal(other),
            })?;
        }

        self.pool.next().map_err(|e| match e {
            PoolError::PoolExhausted => HandshakeError::NoFreeIps,
            other => HandshakeError::Internal(other),
        })
    }
}
