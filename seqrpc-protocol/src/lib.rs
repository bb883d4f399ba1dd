//! # seqrpc-protocol
//!
//! Wire protocol for seqrpc.
//!
//! This crate provides:
//! - Connection option negotiation (JSON line carrying magic number and codec tag)
//! - The per-message [`Header`]
//! - The pluggable [`Codec`] trait, the bundled bincode codec and the [`CodecRegistry`]
//! - Binary framing with length prefix and CRC32C validation
//! - Framed header/body reader and writer halves

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod option;
pub mod transport;

pub use codec::{BincodeCodec, BodyVisitor, Codec, CodecRegistry};
pub use error::{CodecError, NegotiationError, ProtocolError};
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, FRAME_MAGIC};
pub use header::Header;
pub use option::{
    accept_option, read_option, write_option, CodecType, Opt, MAGIC_NUMBER, MAX_OPTION_LEN,
};
pub use transport::{split, BoxedReader, BoxedWriter, CodecReader, CodecWriter};

/// Frame format version supported by this implementation.
pub const FRAME_VERSION: u16 = 1;

/// Default port for seqrpc servers.
pub const DEFAULT_PORT: u16 = 7411;

/// Maximum size of one frame's header and body combined (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
