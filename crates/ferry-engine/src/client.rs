//! File client — one connection per download or upload.
//!
//! Each call builds a fresh client pipeline around its own
//! [`PendingRequest`], connects on the network-io pool, sends, waits for the
//! correlator and always closes the connection afterwards.

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::net::TcpStream;

use ferry_core::config::ClientConfig;
use ferry_core::path::{resolve_under, PathError};
use ferry_core::{Message, ResponseCode};

use crate::chunk::{split, SplitError};
use crate::connection::{self, ConnectionError, ConnectionHandle, ConnectionSettings, PendingWrite};
use crate::correlator::{Correlator, PendingRequest, RequestError};
use crate::executor::{ExecutorError, ExecutorTopology, PoolKind, PoolSizes};
use crate::file_store::FileStore;
use crate::pipeline::{Pipeline, PipelineError, StageSpec};
use crate::stages::{InboundValidator, TraceStage};

/// A file on a remote peer, relative to the peer's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RemoteFile {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }
}

/// A file relative to the client root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: String,
}

impl LocalFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to start client pools: {0}")]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("invalid local path: {0}")]
    Path(#[from] PathError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ClientError {
    /// Response code of the failure. None means a connectivity failure.
    pub fn code(&self) -> Option<ResponseCode> {
        match self {
            ClientError::Split(e) => Some(e.code()),
            ClientError::Request(e) => e.code(),
            ClientError::Path(_) => Some(ResponseCode::InternalError),
            ClientError::Executor(_)
            | ClientError::Pipeline(_)
            | ClientError::Connect { .. }
            | ClientError::Send(_) => None,
        }
    }
}

pub struct FileClient {
    config: ClientConfig,
    topology: ExecutorTopology,
}

impl FileClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let topology = ExecutorTopology::client(PoolSizes {
            accept: 0,
            network_io: config.network_io_threads,
            file_io: config.file_io_threads,
        })?;
        Ok(Self { config, topology })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetch `source` from its peer into `destination` under the client root.
    pub async fn download_file(
        &self,
        source: &RemoteFile,
        destination: &LocalFile,
    ) -> Result<(), ClientError> {
        tracing::info!(
            host = %source.host,
            port = source.port,
            remote = %source.path,
            local = %destination.path,
            "download started"
        );
        let request = Message::FileDownloadRequest {
            source_path: source.path.clone(),
            dest_path: destination.path.clone(),
        };
        self.exchange(source, vec![request]).await?;
        tracing::info!(remote = %source.path, local = %destination.path, "download complete");
        Ok(())
    }

    /// Send `source` (under the client root) to `destination` on its peer.
    pub async fn upload_file(
        &self,
        source: &LocalFile,
        destination: &RemoteFile,
    ) -> Result<(), ClientError> {
        let local = resolve_under(&self.config.root_path, &source.path)?;
        let dest_path = destination.path.clone();
        let chunk_size = self.config.chunk_size;
        let chunks = self
            .topology
            .run_blocking(move || split(&local, &dest_path, chunk_size))
            .await??;

        tracing::info!(
            host = %destination.host,
            port = destination.port,
            local = %source.path,
            remote = %destination.path,
            chunks = chunks.len(),
            "upload started"
        );
        let mut messages: Vec<Message> = chunks.into_iter().map(Message::DataChunk).collect();
        messages.push(Message::FileUploadTail {
            source_path: source.path.clone(),
            dest_path: destination.path.clone(),
        });
        self.exchange(destination, messages).await?;
        tracing::info!(local = %source.path, remote = %destination.path, "upload complete");
        Ok(())
    }

    /// Send `messages` in order on a fresh connection and wait for the
    /// request's outcome. The connection is closed on every path.
    async fn exchange(&self, remote: &RemoteFile, messages: Vec<Message>) -> Result<(), ClientError> {
        let pending = PendingRequest::new();
        let pipeline = self.pipeline(&pending)?;
        let handle = self.connect(remote, &pipeline).await?;

        let writes: Vec<PendingWrite> = messages.into_iter().map(|m| handle.enqueue(m)).collect();
        let written = try_join_all(writes.into_iter().map(PendingWrite::finished));
        let outcome = async {
            tokio::select! {
                outcome = pending.wait() => outcome?,
                result = written => {
                    result?;
                    pending.wait_timeout(self.request_timeout()).await?;
                }
            }
            Ok::<(), ClientError>(())
        }
        .await;

        handle.close();
        if let Err(e) = &outcome {
            tracing::warn!(peer = %handle.peer_addr(), error = %e, "request failed");
        }
        outcome
    }

    fn request_timeout(&self) -> Option<Duration> {
        (self.config.request_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.request_timeout_secs))
    }

    fn pipeline(&self, pending: &PendingRequest) -> Result<Pipeline, PipelineError> {
        let root = self.config.root_path.clone();
        let pending = pending.clone();
        let mut pipeline = Pipeline::new();
        pipeline
            .add(StageSpec::new("validate", || Box::new(InboundValidator)))?
            .add(StageSpec::new("trace", || Box::new(TraceStage)))?
            .add(FileStore::spec(root))?
            .add(StageSpec::new("correlator", move || {
                Box::new(Correlator::new(pending.clone()))
            }))?;
        Ok(pipeline)
    }

    async fn connect(
        &self,
        remote: &RemoteFile,
        pipeline: &Pipeline,
    ) -> Result<ConnectionHandle, ClientError> {
        let target = (remote.host.clone(), remote.port);
        let connected = self
            .topology
            .run_on(PoolKind::NetworkIo, async move {
                let stream = TcpStream::connect(target).await?;
                let peer: SocketAddr = stream.peer_addr()?;
                Ok::<_, std::io::Error>((stream.into_std()?, peer))
            })
            .await?;
        let (stream, peer) = connected.map_err(|source| ClientError::Connect {
            host: remote.host.clone(),
            port: remote.port,
            source,
        })?;

        tracing::debug!(peer = %peer, "connected");
        let settings = ConnectionSettings::new(
            self.config.idle_detection_secs,
            self.config.max_frame_length,
        );
        Ok(connection::open(
            stream,
            peer,
            pipeline,
            self.topology.handles(),
            settings,
        ))
    }
}
