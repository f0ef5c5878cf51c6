//! Ferry message model.
//!
//! A closed set of message variants. Each variant encodes to an ordered list
//! of body segments whose lengths are known up front, so the frame header
//! can be written before any body byte. Outbound data chunks read from disk
//! reference a file region instead of an owned buffer; the connection writer
//! streams that region from the file through a bounded read buffer.
//!
//! Body layouts (all integers big-endian, string lengths in UTF-8 bytes):
//!
//!   FileDownloadRequest / FileUploadTail
//!     [len:4][source_path][len:4][dest_path]
//!   DataChunk
//!     [kind:4][len:4][store_path][payload ...]
//!   Response
//!     [code:4]
//!   ChunkAck
//!     (empty)

use std::fmt;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::response::ResponseCode;
use crate::wire::{type_id, ChunkKind, WireError, MAX_ADDRESSABLE_FILE_LEN};

// ── Message Kind ─────────────────────────────────────────────────────────────

/// Discriminant of [`Message`], used as the routing key for processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    FileDownloadRequest,
    FileUploadTail,
    DataChunk,
    Response,
    ChunkAck,
}

impl MessageKind {
    pub const fn type_id(self) -> u32 {
        match self {
            MessageKind::FileDownloadRequest => type_id::FILE_DOWNLOAD_REQUEST,
            MessageKind::FileUploadTail => type_id::FILE_UPLOAD_TAIL,
            MessageKind::DataChunk => type_id::DATA_CHUNK,
            MessageKind::Response => type_id::RESPONSE,
            MessageKind::ChunkAck => type_id::CHUNK_ACK,
        }
    }

    pub fn from_type_id(id: u32) -> Result<Self, WireError> {
        match id {
            type_id::FILE_DOWNLOAD_REQUEST => Ok(MessageKind::FileDownloadRequest),
            type_id::FILE_UPLOAD_TAIL => Ok(MessageKind::FileUploadTail),
            type_id::DATA_CHUNK => Ok(MessageKind::DataChunk),
            type_id::RESPONSE => Ok(MessageKind::Response),
            type_id::CHUNK_ACK => Ok(MessageKind::ChunkAck),
            other => Err(WireError::UnknownTypeId(other)),
        }
    }

    /// Top-level requests are routed to the dispatcher.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageKind::FileDownloadRequest | MessageKind::FileUploadTail
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::FileDownloadRequest => "file_download_request",
            MessageKind::FileUploadTail => "file_upload_tail",
            MessageKind::DataChunk => "data_chunk",
            MessageKind::Response => "response",
            MessageKind::ChunkAck => "chunk_ack",
        };
        f.write_str(name)
    }
}

// ── Data Chunks ──────────────────────────────────────────────────────────────

/// A byte range of a file on disk. The chunk never holds the bytes; the
/// writer streams the range from the file after the frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegion {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

/// Payload of a [`DataChunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Outbound: read from disk by the connection writer.
    Region(FileRegion),
    /// Inbound: the received bytes, owned by whichever stage holds the chunk.
    Buffer(Bytes),
}

impl ChunkPayload {
    pub fn len(&self) -> u64 {
        match self {
            ChunkPayload::Region(region) => region.len,
            ChunkPayload::Buffer(buf) => buf.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub kind: ChunkKind,
    /// Destination path, relative to the receiver's root.
    pub store_path: String,
    pub payload: ChunkPayload,
}

impl DataChunk {
    /// Outbound chunk referencing `[offset, offset + len)` of `source`.
    pub fn from_region(
        kind: ChunkKind,
        store_path: impl Into<String>,
        source: impl Into<PathBuf>,
        offset: u64,
        len: u64,
    ) -> Self {
        Self {
            kind,
            store_path: store_path.into(),
            payload: ChunkPayload::Region(FileRegion {
                path: source.into(),
                offset,
                len,
            }),
        }
    }

    /// Chunk carrying an in-memory buffer.
    pub fn from_bytes(kind: ChunkKind, store_path: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            store_path: store_path.into(),
            payload: ChunkPayload::Buffer(payload),
        }
    }
}

// ── Message ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the peer to send `source_path` (relative to its root); chunks are
    /// addressed to `dest_path` on the requester.
    FileDownloadRequest {
        source_path: String,
        dest_path: String,
    },
    /// Closes an upload; sent after the last chunk of the file.
    FileUploadTail {
        source_path: String,
        dest_path: String,
    },
    DataChunk(DataChunk),
    Response { code: ResponseCode },
    ChunkAck,
}

/// One piece of an encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Bytes(Bytes),
    File(FileRegion),
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Segment::Bytes(b) => b.len() as u64,
            Segment::File(region) => region.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Total body length of an encoded message.
pub fn body_len(segments: &[Segment]) -> u64 {
    segments.iter().map(Segment::len).sum()
}

impl Message {
    pub fn ok() -> Self {
        Message::Response {
            code: ResponseCode::Ok,
        }
    }

    pub fn response(code: ResponseCode) -> Self {
        Message::Response { code }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::FileDownloadRequest { .. } => MessageKind::FileDownloadRequest,
            Message::FileUploadTail { .. } => MessageKind::FileUploadTail,
            Message::DataChunk(_) => MessageKind::DataChunk,
            Message::Response { .. } => MessageKind::Response,
            Message::ChunkAck => MessageKind::ChunkAck,
        }
    }

    pub fn type_id(&self) -> u32 {
        self.kind().type_id()
    }

    pub fn is_request(&self) -> bool {
        self.kind().is_request()
    }

    /// Encode the body as an ordered list of segments.
    ///
    /// Zero-length file regions are omitted, so START and END chunks encode
    /// to a single buffer.
    pub fn encode(&self) -> Vec<Segment> {
        match self {
            Message::FileDownloadRequest {
                source_path,
                dest_path,
            }
            | Message::FileUploadTail {
                source_path,
                dest_path,
            } => {
                let mut buf = BytesMut::with_capacity(8 + source_path.len() + dest_path.len());
                put_string(&mut buf, source_path);
                put_string(&mut buf, dest_path);
                vec![Segment::Bytes(buf.freeze())]
            }
            Message::DataChunk(chunk) => {
                let mut head = BytesMut::with_capacity(8 + chunk.store_path.len());
                head.put_u32(chunk.kind.into());
                put_string(&mut head, &chunk.store_path);
                let mut segments = vec![Segment::Bytes(head.freeze())];
                match &chunk.payload {
                    ChunkPayload::Region(region) if region.len > 0 => {
                        segments.push(Segment::File(region.clone()));
                    }
                    ChunkPayload::Buffer(buf) if !buf.is_empty() => {
                        segments.push(Segment::Bytes(buf.clone()));
                    }
                    _ => {}
                }
                segments
            }
            Message::Response { code } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(code.code());
                vec![Segment::Bytes(buf.freeze())]
            }
            Message::ChunkAck => Vec::new(),
        }
    }

    /// Decode a body received under `type_id`.
    ///
    /// Data chunk payloads keep a slice of `body`; no bytes are copied.
    pub fn decode(type_id: u32, mut body: Bytes) -> Result<Self, WireError> {
        let message = match MessageKind::from_type_id(type_id)? {
            MessageKind::FileDownloadRequest => Message::FileDownloadRequest {
                source_path: get_string(&mut body)?,
                dest_path: get_string(&mut body)?,
            },
            MessageKind::FileUploadTail => Message::FileUploadTail {
                source_path: get_string(&mut body)?,
                dest_path: get_string(&mut body)?,
            },
            MessageKind::DataChunk => {
                let kind = ChunkKind::try_from(get_u32(&mut body)?)?;
                let store_path = get_string(&mut body)?;
                let payload = body.split_off(0);
                Message::DataChunk(DataChunk::from_bytes(kind, store_path, payload))
            }
            MessageKind::Response => Message::Response {
                code: ResponseCode::try_from(get_u32(&mut body)?)?,
            },
            MessageKind::ChunkAck => Message::ChunkAck,
        };
        if body.has_remaining() {
            return Err(WireError::TrailingBytes(body.remaining()));
        }
        Ok(message)
    }

    /// Check the message is well formed and, for file regions, that the
    /// backing file can actually supply the bytes.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Message::FileDownloadRequest {
                source_path,
                dest_path,
            }
            | Message::FileUploadTail {
                source_path,
                dest_path,
            } => {
                if source_path.is_empty() {
                    return Err(ValidationError::EmptyPath("source_path"));
                }
                if dest_path.is_empty() {
                    return Err(ValidationError::EmptyPath("dest_path"));
                }
                Ok(())
            }
            Message::DataChunk(chunk) => validate_chunk(chunk),
            Message::Response { .. } | Message::ChunkAck => Ok(()),
        }
    }
}

fn validate_chunk(chunk: &DataChunk) -> Result<(), ValidationError> {
    if chunk.store_path.is_empty() {
        return Err(ValidationError::EmptyPath("store_path"));
    }
    if chunk.kind.is_marker() && !chunk.payload.is_empty() {
        return Err(ValidationError::PayloadOnMarker {
            kind: chunk.kind,
            len: chunk.payload.len(),
        });
    }
    let ChunkPayload::Region(region) = &chunk.payload else {
        return Ok(());
    };
    let meta = match std::fs::metadata(&region.path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::SourceMissing(region.path.clone()));
        }
        Err(e) => return Err(ValidationError::Io(region.path.clone(), e)),
    };
    if !meta.is_file() {
        return Err(ValidationError::SourceMissing(region.path.clone()));
    }
    let file_len = meta.len();
    if file_len > MAX_ADDRESSABLE_FILE_LEN {
        return Err(ValidationError::SourceTooLarge {
            path: region.path.clone(),
            len: file_len,
        });
    }
    let end = region.offset.saturating_add(region.len);
    if end > file_len {
        return Err(ValidationError::RegionOutOfBounds {
            path: region.path.clone(),
            end,
            file_len,
        });
    }
    Ok(())
}

// ── Body helpers ─────────────────────────────────────────────────────────────

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.get_u32())
}

fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyPath(&'static str),

    #[error("{kind:?} chunk carries {len} payload bytes")]
    PayloadOnMarker { kind: ChunkKind, len: u64 },

    #[error("chunk source {0} does not exist")]
    SourceMissing(PathBuf),

    #[error("chunk source {path} is {len} bytes, above the addressable limit")]
    SourceTooLarge { path: PathBuf, len: u64 },

    #[error("chunk region ends at {end} but {path} is {file_len} bytes")]
    RegionOutOfBounds {
        path: PathBuf,
        end: u64,
        file_len: u64,
    },

    #[error("cannot inspect chunk source {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
