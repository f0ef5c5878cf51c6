//! Chunk splitter — turns a source file into the START, MIDDLE*, END
//! sequence of one transfer.
//!
//! MIDDLE chunks reference contiguous, non-overlapping regions of the
//! source; nothing is read here. The connection writer streams each region
//! from disk when the chunk is sent.

use std::path::{Path, PathBuf};

use ferry_core::wire::MAX_ADDRESSABLE_FILE_LEN;
use ferry_core::{ChunkKind, DataChunk, ResponseCode};

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("{0} does not exist")]
    NotFound(PathBuf),

    #[error("{0} is not a file")]
    NotAFile(PathBuf),

    #[error("{path} is {len} bytes, beyond the addressable transfer length")]
    TooLarge { path: PathBuf, len: u64 },

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("cannot inspect {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

impl SplitError {
    pub fn code(&self) -> ResponseCode {
        match self {
            SplitError::NotFound(_) => ResponseCode::FileNotFound,
            SplitError::NotAFile(_) => ResponseCode::NotAFile,
            SplitError::TooLarge { .. } | SplitError::ZeroChunkSize | SplitError::Io(..) => {
                ResponseCode::InternalError
            }
        }
    }
}

/// Split `source` into chunks addressed to `dest_path` on the receiver.
pub fn split(source: &Path, dest_path: &str, chunk_size: u64) -> Result<Vec<DataChunk>, SplitError> {
    if chunk_size == 0 {
        return Err(SplitError::ZeroChunkSize);
    }
    let meta = match std::fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SplitError::NotFound(source.to_path_buf()));
        }
        Err(e) => return Err(SplitError::Io(source.to_path_buf(), e)),
    };
    if meta.is_dir() {
        return Err(SplitError::NotAFile(source.to_path_buf()));
    }

    let file_len = meta.len();
    if file_len > MAX_ADDRESSABLE_FILE_LEN {
        return Err(SplitError::TooLarge {
            path: source.to_path_buf(),
            len: file_len,
        });
    }
    let middles = file_len.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(middles as usize + 2);

    chunks.push(DataChunk::from_region(ChunkKind::Start, dest_path, source, 0, 0));
    let mut offset = 0;
    while offset < file_len {
        let len = chunk_size.min(file_len - offset);
        chunks.push(DataChunk::from_region(
            ChunkKind::Middle,
            dest_path,
            source,
            offset,
            len,
        ));
        offset += len;
    }
    chunks.push(DataChunk::from_region(ChunkKind::End, dest_path, source, file_len, 0));

    tracing::debug!(
        source = %source.display(),
        dest = dest_path,
        bytes = file_len,
        chunks = chunks.len(),
        "file split"
    );
    Ok(chunks)
}
