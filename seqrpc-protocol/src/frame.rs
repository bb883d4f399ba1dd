//! Binary frame format carrying one header/body unit.
//!
//! Frame layout (20 bytes fixed header + codec-encoded header + codec-encoded body):
//!
//! ```text
//! +--------+---------+--------+------------+----------+--------+
//! | magic  | version | flags  | header_len | body_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  4 bytes   |  4 bytes | 4 bytes|
//! +--------+---------+--------+------------+----------+--------+
//! | header                    | body                           |
//! | header_len bytes          | body_len bytes                 |
//! +---------------------------+--------------------------------+
//! ```
//!
//! The frame layer knows nothing about the negotiated codec: both sections are
//! opaque bytes. Keeping a header and its body inside one frame is what makes a
//! message contiguous on the wire.

use crate::error::ProtocolError;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying seqrpc frames.
pub const FRAME_MAGIC: [u8; 4] = *b"SRPC";

/// Size of the fixed frame header in bytes (4+2+2+4+4+4 = 20).
pub const FRAME_HEADER_SIZE: usize = 20;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;

    /// Valid flags mask for frame version 1.
    const VALID_V1_MASK: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame version.
    pub version: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Codec-encoded message header.
    pub header: Bytes,
    /// Codec-encoded message body.
    pub body: Bytes,
}

impl Frame {
    /// Creates a new frame with CRC enabled.
    pub fn new(header: Bytes, body: Bytes) -> Self {
        Self {
            version: crate::FRAME_VERSION,
            flags: FrameFlags::new().with_crc(),
            header,
            body,
        }
    }

    fn checksum(header: &[u8], body: &[u8]) -> u32 {
        crc32c::crc32c_append(crc32c::crc32c(header), body)
    }

    /// Returns the encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.header.len() + self.body.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let size = self.header.len() + self.body.len();
        if size > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: size as u64,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.header.len() as u32);
        buf.put_u32(self.body.len() as u32);

        let crc = if self.flags.has_crc() {
            Self::checksum(&self.header, &self.body)
        } else {
            0
        };
        buf.put_u32(crc);

        buf.put_slice(&self.header);
        buf.put_slice(&self.body);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the fixed header without consuming
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;
        let header_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let body_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;

        let size = header_len as u64 + body_len as u64;
        if size > MAX_FRAME_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

        let total_len = FRAME_HEADER_SIZE + header_len + body_len;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header = buf.split_to(header_len).freeze();
        let body = buf.split_to(body_len).freeze();

        if flags.has_crc() {
            let crc_actual = Self::checksum(&header, &body);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            header,
            body,
        }))
    }
}
