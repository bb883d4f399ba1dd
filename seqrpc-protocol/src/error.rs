//! Protocol error types.

use crate::option::CodecType;
use thiserror::Error;

/// Frame-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame magic: expected 'SRPC', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),
}

/// Errors raised while reading or writing header/body units.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the connection on a message boundary.
    #[error("end of stream")]
    Eof,

    /// The connection ended in the middle of a message.
    #[error("unexpected end of stream ({buffered} bytes of a partial frame buffered)")]
    UnexpectedEof { buffered: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// `read_body` was called without a preceding `read_header`.
    #[error("no body pending")]
    NoPendingBody,

    /// The writer was closed, either explicitly or after a failed write.
    #[error("codec closed")]
    Closed,

    #[error("frame error: {0}")]
    Frame(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Returns whether this error is the clean end-of-stream signal.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Eof)
    }

    /// Returns whether this error means the connection itself is unusable.
    ///
    /// Encode and decode failures concern one value; everything else leaves
    /// the stream desynchronized or gone.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CodecError::Encode(_) | CodecError::Decode(_))
    }
}

/// Errors raised while exchanging the connection option.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("invalid codec type {0}")]
    UnknownCodec(CodecType),

    #[error("malformed option: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("option exceeds {max} bytes")]
    OptionTooLarge { max: usize },

    #[error("connection closed before option was received")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
