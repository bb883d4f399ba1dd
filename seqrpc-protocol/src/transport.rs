//! Framed header/body I/O over a byte stream.
//!
//! After negotiation a connection is split into one [`CodecReader`] and one
//! [`CodecWriter`]. The reader yields headers and the body that followed each
//! header; the writer emits a header and its body as a single frame, so a
//! message is always contiguous on the wire.

use crate::codec::Codec;
use crate::error::CodecError;
use crate::frame::Frame;
use crate::header::Header;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Type-erased read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default read buffer capacity (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Splits a negotiated stream into a codec reader and writer.
pub fn split<S>(stream: S, codec: Arc<dyn Codec>) -> (CodecReader, CodecWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        CodecReader::new(Box::new(read_half), codec.clone()),
        CodecWriter::new(Box::new(write_half), codec),
    )
}

/// Reading side of a codec connection.
pub struct CodecReader<R = BoxedReader> {
    reader: R,
    codec: Arc<dyn Codec>,
    buffer: BytesMut,
    pending_body: Option<Bytes>,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, codec: Arc<dyn Codec>) -> Self {
        Self {
            reader,
            codec,
            buffer: BytesMut::with_capacity(DEFAULT_READ_BUFFER_SIZE),
            pending_body: None,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Waits for the next header.
    ///
    /// Returns [`CodecError::Eof`] when the peer closed cleanly between
    /// messages and [`CodecError::UnexpectedEof`] when it closed mid-frame.
    /// Any unread body from the previous message is dropped.
    pub async fn read_header(&mut self) -> Result<Header, CodecError> {
        self.pending_body = None;
        loop {
            if let Some(frame) = Frame::decode(&mut self.buffer)? {
                let header = self.codec.decode_header(&frame.header)?;
                self.pending_body = Some(frame.body);
                return Ok(header);
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(CodecError::Eof);
                }
                return Err(CodecError::UnexpectedEof {
                    buffered: self.buffer.len(),
                });
            }
        }
    }

    /// Decodes the body that followed the last header.
    pub fn read_body<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let body = self.take_body()?;
        self.codec.decode_as(&body)
    }

    /// Hands out the still-encoded body that followed the last header.
    pub fn take_body(&mut self) -> Result<Bytes, CodecError> {
        self.pending_body.take().ok_or(CodecError::NoPendingBody)
    }

    /// Drops the body that followed the last header.
    pub fn discard_body(&mut self) {
        self.pending_body = None;
    }
}

/// Writing side of a codec connection.
///
/// Not synchronized: callers sharing a writer must hold a lock around
/// [`CodecWriter::write`].
pub struct CodecWriter<W = BoxedWriter> {
    writer: W,
    codec: Arc<dyn Codec>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W, codec: Arc<dyn Codec>) -> Self {
        Self {
            writer,
            codec,
            closed: false,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encodes and writes one header/body unit.
    ///
    /// Both parts are encoded before any byte is written, so an encode failure
    /// leaves the stream untouched. A unit too large for one frame is reported
    /// as [`CodecError::Encode`] for the same reason. An I/O failure closes the
    /// writer.
    pub async fn write(
        &mut self,
        header: &Header,
        body: &(dyn erased_serde::Serialize + Sync),
    ) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }

        let header_bytes = self.codec.encode_header(header)?;
        let body_bytes = self.codec.encode_body(body)?;
        let frame = Frame::new(Bytes::from(header_bytes), Bytes::from(body_bytes))
            .encode()
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        let result = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("codec writer: write failed, closing: {}", e);
            let _ = self.close().await;
            return Err(CodecError::Io(e));
        }
        Ok(())
    }

    /// Shuts the write side down. Further calls are no-ops.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}
