//! Length-prefixed frame codec shared by every transport.
//!
//! Wire layout: `[u32 big-endian length][length bytes]`, with
//! `0 < length <= max_message_size`.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::application::ports::Frame;
use crate::error::{Error, Result};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

/// Prepend the 4-byte big-endian length to `payload`.
///
/// # Errors
///
/// Returns `Error::Protocol` if `payload` is empty or longer than
/// `u32::MAX` bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::protocol(format!("frame of {} bytes is too large", payload.len())))?;
    if len == 0 {
        return Err(Error::protocol("refusing to send an empty frame"));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.put_u32(len);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Check a decoded length prefix.
///
/// # Errors
///
/// Returns `Error::Connection` for zero or oversized lengths.
pub fn validate_length(len: usize, max_message_size: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::connection("invalid frame length 0"));
    }
    if len > max_message_size {
        return Err(Error::connection(format!(
            "frame of {len} bytes exceeds limit of {max_message_size}"
        )));
    }
    Ok(())
}

/// Accumulates raw bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_message_size,
        }
    }

    /// Append raw bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` when the pending length prefix is invalid.
    /// The stream is unusable after that.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        validate_length(len, self.max_message_size)?;

        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Buffered bytes not yet forming a complete frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered (a frame boundary).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Reads frames from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader`.
    pub fn new(reader: R, max_message_size: usize) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::new(max_message_size),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` on EOF mid-frame or an invalid length,
    /// and `Error::Io` on read failure.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }
            let spare = self.buffer.buf_mut();
            if spare.capacity() - spare.len() < READ_CHUNK {
                spare.reserve(READ_CHUNK);
            }
            let read = self.reader.read_buf(spare).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::connection(format!(
                    "connection closed mid-frame with {} bytes buffered",
                    self.buffer.len()
                )));
            }
        }
    }
}
