//! Ferry wire format — frame header, type ids and chunk kinds.
//!
//! Every frame on a Ferry connection is laid out as:
//!
//!   [length: u32][type_id: u32][body ...]
//!
//! All integers are big-endian. `length` counts every byte after itself,
//! so it is `4 + body.len()` and never smaller than 4. Changing anything
//! in this module is a protocol break.
//!
//! The header is a zerocopy struct with explicit byte-order fields, so it
//! is written and parsed without unsafe code or manual shifting.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Fixed prefix of every frame.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Bytes that follow this field: the type id plus the body.
    pub length: U32<BigEndian>,

    /// Message type identifier, one of the constants in [`type_id`].
    pub type_id: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 8]);

/// Size of the complete header.
pub const HEADER_LEN: usize = 8;

/// Size of the leading length field, stripped by the frame codec.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Size of the type id, counted by the length field.
pub const TYPE_ID_LEN: usize = 4;

/// Default upper bound on the length field.
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = i32::MAX as u32;

/// Largest source file a file-region chunk may reference.
pub const MAX_ADDRESSABLE_FILE_LEN: u64 = i32::MAX as u64;

impl FrameHeader {
    /// Build a header for a body of `body_len` bytes.
    pub fn new(body_len: u64, type_id: u32) -> Result<Self, WireError> {
        let length = body_len
            .checked_add(TYPE_ID_LEN as u64)
            .and_then(|l| u32::try_from(l).ok())
            .ok_or(WireError::BodyTooLarge(body_len))?;
        Ok(Self {
            length: U32::new(length),
            type_id: U32::new(type_id),
        })
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from(bytes).ok_or(WireError::Truncated {
            needed: HEADER_LEN,
            remaining: bytes.len(),
        })?;
        if (header.length.get() as usize) < TYPE_ID_LEN {
            return Err(WireError::MalformedLength(header.length.get()));
        }
        Ok(header)
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> u32 {
        self.length.get().saturating_sub(TYPE_ID_LEN as u32)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Encode the header for a body of `body_len` bytes.
pub fn encode_header(body_len: u32, type_id: u32) -> Result<[u8; HEADER_LEN], WireError> {
    Ok(FrameHeader::new(body_len as u64, type_id)?.to_bytes())
}

/// Decode a header into `(body_len, type_id)`.
pub fn decode_header(bytes: &[u8]) -> Result<(u32, u32), WireError> {
    let header = FrameHeader::parse(bytes)?;
    Ok((header.body_len(), header.type_id.get()))
}

// ── Type Ids ─────────────────────────────────────────────────────────────────

/// Stable message type identifiers. Never reuse a retired value.
pub mod type_id {
    pub const FILE_DOWNLOAD_REQUEST: u32 = 1001;
    pub const FILE_UPLOAD_TAIL: u32 = 1002;
    pub const DATA_CHUNK: u32 = 2001;
    pub const RESPONSE: u32 = 3001;
    pub const CHUNK_ACK: u32 = 4001;
}

// ── Chunk Kind ───────────────────────────────────────────────────────────────

/// Position of a chunk within one file transfer.
///
/// The receiver has no transfer id; it infers boundaries purely from the
/// START, MIDDLE*, END ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChunkKind {
    /// Opens a transfer. Never carries payload.
    Start = 1,
    /// Carries one contiguous byte range of the file.
    Middle = 2,
    /// Closes a transfer. Never carries payload.
    End = 3,
}

impl ChunkKind {
    /// START and END only delimit a transfer.
    pub fn is_marker(self) -> bool {
        !matches!(self, ChunkKind::Middle)
    }
}

impl TryFrom<u32> for ChunkKind {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChunkKind::Start),
            2 => Ok(ChunkKind::Middle),
            3 => Ok(ChunkKind::End),
            other => Err(WireError::UnknownChunkKind(other)),
        }
    }
}

impl From<ChunkKind> for u32 {
    fn from(kind: ChunkKind) -> u32 {
        kind as u32
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type id: {0}")]
    UnknownTypeId(u32),

    #[error("unknown chunk kind: {0}")]
    UnknownChunkKind(u32),

    #[error("unknown response code: {0}")]
    UnknownResponseCode(u32),

    #[error("length field {0} cannot hold a type id")]
    MalformedLength(u32),

    #[error("truncated body: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("body of {0} bytes does not fit the length field")]
    BodyTooLarge(u64),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
