//! File store stage — persists inbound data chunks under a root directory.
//!
//! Runs on the file-io pool. Every stored chunk is acknowledged with one
//! `ChunkAck`. A connection carries at most one transfer at a time, so the
//! stage tracks the target of the open transfer and rejects chunks that do
//! not fit the START, MIDDLE*, END order.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use ferry_core::path::{resolve_target, PathError};
use ferry_core::{ChunkKind, ChunkPayload, DataChunk, Message};

use crate::executor::PoolKind;
use crate::pipeline::{Flow, Stage, StageContext, StageError, StageSpec};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("{kind:?} chunk for {target} arrived with no open transfer")]
    NoOpenTransfer { kind: ChunkKind, target: PathBuf },

    #[error("START for {target} arrived while {open} is still open")]
    TransferInProgress { target: PathBuf, open: PathBuf },

    #[error("chunk for {target} does not belong to the open transfer {open}")]
    TargetMismatch { target: PathBuf, open: PathBuf },

    #[error("inbound chunk carries a file region instead of bytes")]
    RegionPayload,

    #[error("storing {0} failed: {1}")]
    Io(PathBuf, std::io::Error),
}

pub struct FileStore {
    root: PathBuf,
    open: Option<PathBuf>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: None,
        }
    }

    /// Stage spec bound to the file-io pool, one store per connection.
    pub fn spec(root: impl Into<PathBuf>) -> StageSpec {
        let root = root.into();
        StageSpec::new("file_store", move || Box::new(FileStore::new(root.clone())))
            .on_pool(PoolKind::FileIo)
            .blocking()
    }

    /// Target of the transfer currently open on this connection.
    pub fn open_transfer(&self) -> Option<&Path> {
        self.open.as_deref()
    }

    /// Apply one chunk to disk. The payload is released on return.
    pub fn store(&mut self, chunk: DataChunk) -> Result<(), StoreError> {
        let target = resolve_target(&self.root, &chunk.store_path)?;
        match chunk.kind {
            ChunkKind::Start => {
                if let Some(open) = &self.open {
                    return Err(StoreError::TransferInProgress {
                        target,
                        open: open.clone(),
                    });
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
                }
                // Truncates any previous file, so a zero-byte transfer still
                // leaves an empty file behind.
                std::fs::File::create(&target).map_err(|e| StoreError::Io(target.clone(), e))?;
                tracing::debug!(target = %target.display(), "transfer started");
                self.open = Some(target);
            }
            ChunkKind::Middle => {
                self.expect_open(ChunkKind::Middle, &target)?;
                let ChunkPayload::Buffer(bytes) = chunk.payload else {
                    return Err(StoreError::RegionPayload);
                };
                let mut file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&target)
                    .map_err(|e| StoreError::Io(target.clone(), e))?;
                file.write_all(&bytes)
                    .map_err(|e| StoreError::Io(target.clone(), e))?;
            }
            ChunkKind::End => {
                self.expect_open(ChunkKind::End, &target)?;
                tracing::debug!(target = %target.display(), "transfer complete");
                self.open = None;
            }
        }
        Ok(())
    }

    fn expect_open(&self, kind: ChunkKind, target: &Path) -> Result<(), StoreError> {
        match &self.open {
            None => Err(StoreError::NoOpenTransfer {
                kind,
                target: target.to_path_buf(),
            }),
            Some(open) if open != target => Err(StoreError::TargetMismatch {
                target: target.to_path_buf(),
                open: open.clone(),
            }),
            Some(_) => Ok(()),
        }
    }
}

impl Stage for FileStore {
    fn claims(&self, message: &Message) -> bool {
        matches!(message, Message::DataChunk(_))
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        let Message::DataChunk(chunk) = message else {
            return Ok(Flow::Forward(message));
        };
        self.store(chunk)?;
        ctx.write(Message::ChunkAck);
        Ok(Flow::Consumed)
    }

    fn blocks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(kind: ChunkKind, path: &str, data: &'static [u8]) -> DataChunk {
        DataChunk::from_bytes(kind, path, Bytes::from_static(data))
    }

    #[test]
    fn sequence_reproduces_bytes() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(root.path());

        store.store(chunk(ChunkKind::Start, "a/b/out.bin", b"")).unwrap();
        assert_eq!(store.open_transfer(), Some(root.path().join("a/b/out.bin").as_path()));
        store.store(chunk(ChunkKind::Middle, "a/b/out.bin", b"hello ")).unwrap();
        store.store(chunk(ChunkKind::Middle, "a/b/out.bin", b"world")).unwrap();
        store.store(chunk(ChunkKind::End, "a/b/out.bin", b"")).unwrap();

        assert_eq!(store.open_transfer(), None);
        let written = std::fs::read(root.path().join("a/b/out.bin")).unwrap();
        assert_eq!(written, b"hello world");
    }

    #[test]
    fn start_truncates_existing_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("out.txt"), b"stale contents").unwrap();

        let mut store = FileStore::new(root.path());
        store.store(chunk(ChunkKind::Start, "out.txt", b"")).unwrap();
        assert_eq!(std::fs::read(root.path().join("out.txt")).unwrap(), b"");
        store.store(chunk(ChunkKind::Middle, "out.txt", b"new")).unwrap();
        store.store(chunk(ChunkKind::End, "out.txt", b"")).unwrap();
        assert_eq!(std::fs::read(root.path().join("out.txt")).unwrap(), b"new");
    }

    #[test]
    fn zero_byte_transfer_leaves_empty_file() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(root.path());
        store.store(chunk(ChunkKind::Start, "empty", b"")).unwrap();
        store.store(chunk(ChunkKind::End, "empty", b"")).unwrap();
        assert_eq!(std::fs::metadata(root.path().join("empty")).unwrap().len(), 0);
    }

    #[test]
    fn out_of_order_chunks_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(root.path());

        assert!(matches!(
            store.store(chunk(ChunkKind::Middle, "x", b"1")),
            Err(StoreError::NoOpenTransfer { kind: ChunkKind::Middle, .. })
        ));
        assert!(matches!(
            store.store(chunk(ChunkKind::End, "x", b"")),
            Err(StoreError::NoOpenTransfer { kind: ChunkKind::End, .. })
        ));

        store.store(chunk(ChunkKind::Start, "x", b"")).unwrap();
        assert!(matches!(
            store.store(chunk(ChunkKind::Start, "y", b"")),
            Err(StoreError::TransferInProgress { .. })
        ));
        assert!(matches!(
            store.store(chunk(ChunkKind::Middle, "y", b"1")),
            Err(StoreError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn escaping_path_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(root.path().join("inner"));
        assert!(matches!(
            store.store(chunk(ChunkKind::Start, "../outside", b"")),
            Err(StoreError::Path(PathError::EscapesRoot(_)))
        ));
    }

    #[test]
    fn root_is_not_a_valid_target() {
        let root = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(root.path());
        assert!(matches!(
            store.store(chunk(ChunkKind::Start, "a/..", b"")),
            Err(StoreError::Path(PathError::Empty(_)))
        ));
        assert_eq!(store.open_transfer(), None);
    }

    #[test]
    fn store_stays_off_the_network_pool() {
        use crate::pipeline::{Pipeline, PipelineError};

        let root = tempfile::tempdir().unwrap();
        let path = root.path().to_path_buf();
        let mut pipeline = Pipeline::new();
        assert!(matches!(
            pipeline.add(StageSpec::new("file_store", move || {
                Box::new(FileStore::new(path.clone()))
            })),
            Err(PipelineError::BlockingOnPool { pool: PoolKind::NetworkIo, .. })
        ));

        let spec = FileStore::spec(root.path());
        assert_eq!(spec.pool(), PoolKind::FileIo);
        pipeline.add(spec).unwrap();
        assert_eq!(pipeline.names(), vec!["file_store"]);
    }
}
