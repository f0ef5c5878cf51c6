//! Inbound frame codec.
//!
//! Buffers the byte stream until a whole frame is available, strips the
//! length field and yields `[type_id][body]` exactly once per frame. The
//! body is frozen out of the read buffer, so payload slices handed to the
//! message model share the allocation instead of copying it.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::wire::{WireError, DEFAULT_MAX_FRAME_LENGTH, LENGTH_FIELD_LEN, TYPE_ID_LEN};

/// One decoded frame, length field already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_id: u32,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: u32,
}

impl FrameCodec {
    pub fn new(max_frame_length: u32) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> u32 {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {length} exceeds maximum {max}")]
    TooLarge { length: u32, max: u32 },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if (length as usize) < TYPE_ID_LEN {
            return Err(WireError::MalformedLength(length).into());
        }
        if length > self.max_frame_length {
            return Err(FrameError::TooLarge {
                length,
                max: self.max_frame_length,
            });
        }

        let total = LENGTH_FIELD_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let mut frame = src.split_to(length as usize);
        let type_id = frame.get_u32();
        Ok(Some(Frame {
            type_id,
            body: frame.freeze(),
        }))
    }
}
