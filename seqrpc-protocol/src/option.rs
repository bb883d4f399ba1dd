//! Connection option negotiation.
//!
//! The initiator writes one [`Opt`] as a newline-terminated JSON document before
//! any codec bytes. The receiver reads exactly that line, checks the magic
//! number and looks the codec tag up in its [`CodecRegistry`]. Everything after
//! the line is framed and encoded by the selected codec.

use crate::codec::{Codec, CodecRegistry};
use crate::error::NegotiationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic number identifying a seqrpc connection.
pub const MAGIC_NUMBER: u32 = 0x34252;

/// Upper bound on the encoded option line, newline included.
pub const MAX_OPTION_LEN: usize = 4096;

/// Tag selecting a codec constructor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecType(String);

impl CodecType {
    /// Tag of the bundled binary codec.
    pub const BINCODE: &'static str = "application/bincode";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn bincode() -> Self {
        Self::new(Self::BINCODE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CodecType {
    fn default() -> Self {
        Self::bincode()
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// One-time negotiation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opt {
    pub magic_number: u32,
    pub codec_type: CodecType,
}

impl Default for Opt {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
        }
    }
}

impl Opt {
    pub fn with_codec(codec_type: impl Into<CodecType>) -> Self {
        Self {
            codec_type: codec_type.into(),
            ..Default::default()
        }
    }

    /// Fills in what a caller may leave out: the magic number is always the
    /// protocol constant and an empty codec tag means the default codec.
    pub fn normalized(opt: Option<Opt>) -> Opt {
        match opt {
            None => Opt::default(),
            Some(mut opt) => {
                opt.magic_number = MAGIC_NUMBER;
                if opt.codec_type.is_empty() {
                    opt.codec_type = CodecType::default();
                }
                opt
            }
        }
    }

    /// Checks the magic number and resolves the codec tag.
    pub fn validate(&self, registry: &CodecRegistry) -> Result<Arc<dyn Codec>, NegotiationError> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(NegotiationError::InvalidMagic(self.magic_number));
        }
        registry
            .get(&self.codec_type)
            .ok_or_else(|| NegotiationError::UnknownCodec(self.codec_type.clone()))
    }
}

/// Writes the option line.
pub async fn write_option<W>(writer: &mut W, opt: &Opt) -> Result<(), NegotiationError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(opt)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the option line.
///
/// Reads one byte at a time so that no byte belonging to the codec stream is
/// consumed.
pub async fn read_option<R>(reader: &mut R) -> Result<Opt, NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(NegotiationError::Closed);
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_OPTION_LEN {
            return Err(NegotiationError::OptionTooLarge {
                max: MAX_OPTION_LEN,
            });
        }
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Receiver side of negotiation: reads and validates the option.
pub async fn accept_option<R>(
    reader: &mut R,
    registry: &CodecRegistry,
) -> Result<(Opt, Arc<dyn Codec>), NegotiationError>
where
    R: AsyncRead + Unpin,
{
    let opt = read_option(reader).await?;
    let codec = opt.validate(registry)?;
    Ok((opt, codec))
}
