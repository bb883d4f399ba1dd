//! Client error types.

use seqrpc_protocol::{CodecError, NegotiationError};
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The client was closed or has already failed.
    #[error("connection is shut down")]
    Shutdown,

    /// The server closed the connection while the call was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection failed while the call was pending.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an error header.
    #[error("{0}")]
    Server(String),

    #[error("reading body: {0}")]
    ReadBody(String),

    #[error("call timeout: expect within {0:?}")]
    Timeout(Duration),

    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
}

impl ClientError {
    /// Returns whether the call failed because the connection is gone.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            ClientError::Shutdown | ClientError::ConnectionClosed | ClientError::Transport(_)
        )
    }

    /// Returns whether the same call may succeed on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout(_) => true,
            ClientError::ConnectTimeout(_) => true,
            ClientError::ConnectionClosed => true,
            ClientError::Transport(_) => true,
            _ => false,
        }
    }
}
