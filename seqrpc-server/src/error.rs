//! Server error types.

use seqrpc_protocol::{CodecError, NegotiationError};
use std::time::Duration;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure reported by the service-dispatch collaborator for one request.
///
/// The display text is what the client sees in the response header.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormed(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: read argv err: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),

    #[error("rpc server: service panicked")]
    Panicked,

    #[error("rpc server: request handle timeout: expect within {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_display() {
        assert_eq!(
            ServiceError::MethodNotFound("User.Nope".into()).to_string(),
            "rpc server: can't find method User.Nope"
        );
        assert_eq!(
            ServiceError::IllFormed("Sum".into()).to_string(),
            "rpc server: service/method request ill-formed: Sum"
        );
        assert_eq!(ServiceError::failed("boom").to_string(), "boom");
        assert!(ServiceError::Timeout(Duration::from_millis(5))
            .to_string()
            .contains("5ms"));
        assert!(ServiceError::InvalidArgument("eof".into())
            .to_string()
            .contains("eof"));
    }

    #[test]
    fn test_server_error_from_negotiation() {
        let err: ServerError = NegotiationError::InvalidMagic(7).into();
        assert!(err.to_string().contains("invalid magic number"));
    }
}
