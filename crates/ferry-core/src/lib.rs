//! ferry-core — wire format, message model and configuration.
//! The engine and both binaries depend on this one.

pub mod codec;
pub mod config;
pub mod message;
pub mod path;
pub mod response;
pub mod wire;

pub use codec::{Frame, FrameCodec, FrameError};
pub use message::{ChunkPayload, DataChunk, FileRegion, Message, MessageKind, Segment, ValidationError};
pub use response::ResponseCode;
pub use wire::{ChunkKind, WireError};
