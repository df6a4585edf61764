//! Length-prefixed frame codec.
//!
//! Every frame on the wire is a big-endian `u16` payload length followed by
//! exactly that many payload bytes:
//!
//! ```text
//! +------------------+----------------------+
//! | length: uint16BE | payload: length bytes|
//! +------------------+----------------------+
//! ```
//!
//! The decoder buffers partial frames across reads and yields `Ok(None)`
//! until a whole frame is available, so transport chunking never shifts
//! message boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix in bytes.
pub const LENGTH_FIELD_LEN: usize = 2;

/// Largest payload a `u16` length prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Codec error.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds frame limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec for `u16`-length-prefixed frames.
///
/// `max_frame_length` bounds the payload in both directions. Outbound
/// payloads above it fail with [`FrameError::TooLarge`]; an inbound prefix
/// above it means the peer is not speaking this protocol and fails with
/// [`FrameError::Malformed`].
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// Create a codec accepting payloads up to `max_frame_length` bytes.
    ///
    /// Values above [`MAX_PAYLOAD_LEN`] are clamped; the prefix cannot
    /// express anything larger.
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.min(MAX_PAYLOAD_LEN),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > self.max_frame_length {
            return Err(FrameError::Malformed(format!(
                "declared length {len} exceeds limit of {}",
                self.max_frame_length
            )));
        }

        let frame_len = LENGTH_FIELD_LEN + len;
        if src.len() < frame_len {
            // Wait for the rest of the frame.
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let payload = src.split_to(len).freeze();
        if payload.len() != len {
            return Err(FrameError::Malformed(format!(
                "expected {len} payload bytes, got {}",
                payload.len()
            )));
        }
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = check_len(item.len(), self.max_frame_length)?;
        dst.reserve(LENGTH_FIELD_LEN + item.len());
        dst.put_u16(len);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Encode a single payload into a standalone frame.
///
/// Used where a frame is built once and then queued to a connection, so the
/// size check happens before anything is tracked or enqueued.
pub fn encode_frame(payload: &[u8], max_frame_length: usize) -> Result<Bytes, FrameError> {
    let len = check_len(payload.len(), max_frame_length.min(MAX_PAYLOAD_LEN))?;
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + payload.len());
    buf.put_u16(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn check_len(len: usize, max: usize) -> Result<u16, FrameError> {
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    u16::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: MAX_PAYLOAD_LEN,
    })
}

/// Codec for connections whose outbound frames are already length-prefixed.
///
/// The dispatcher encodes once via [`encode_frame`] and fans the same
/// `Bytes` out to the connection queue, so the write side passes frames
/// through untouched while the read side decodes as [`FrameCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PreframedCodec {
    inner: FrameCodec,
}

impl PreframedCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: FrameCodec::new(max_frame_length),
        }
    }
}

impl Decoder for PreframedCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src)
    }
}

impl Encoder<Bytes> for PreframedCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() < LENGTH_FIELD_LEN {
            return Err(FrameError::Malformed(format!(
                "pre-framed buffer of {} bytes has no length prefix",
                item.len()
            )));
        }
        let declared = u16::from_be_bytes([item[0], item[1]]) as usize;
        if declared != item.len() - LENGTH_FIELD_LEN {
            return Err(FrameError::Malformed(format!(
                "prefix declares {declared} bytes but buffer carries {}",
                item.len() - LENGTH_FIELD_LEN
            )));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}
