//! File server — accepts connections and serves files from its root.
//!
//! The listener runs on the accept pool. Every accepted socket is handed to
//! the network-io pool with a fresh instance of the server pipeline:
//!
//!   validate → trace → file_store (file-io) → dispatch
//!     → connection_tracker → read_fan_out → drop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ferry_core::config::ServerConfig;

use crate::connection::{self, ConnectionSettings};
use crate::dispatch::{ProcessorTable, RequestDispatcher};
use crate::executor::{ExecutorError, ExecutorTopology, PoolHandles, PoolKind, PoolSizes};
use crate::file_store::FileStore;
use crate::pipeline::{Pipeline, PipelineError, StageSpec};
use crate::registry::ConnectionRegistry;
use crate::stages::{InboundValidator, TraceStage};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to start server pools: {0}")]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server is already listening on {0}")]
    AlreadyStarted(SocketAddr),
}

pub struct FileServer {
    config: ServerConfig,
    topology: ExecutorTopology,
    registry: ConnectionRegistry,
    pipeline: Pipeline,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
}

impl FileServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let topology = ExecutorTopology::server(PoolSizes {
            accept: config.accept_threads,
            network_io: config.network_io_threads,
            file_io: config.file_io_threads,
        })?;
        let registry = ConnectionRegistry::with_capacity(config.inbound_queue_capacity);
        let pipeline = server_pipeline(&config, &registry)?;
        Ok(Self {
            config,
            topology,
            registry,
            pipeline,
            shutdown: CancellationToken::new(),
            local_addr: None,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Stage list used for connections accepted after the next `start`.
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `port` (0 picks an ephemeral one) and start accepting.
    /// Returns the bound address.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr {
            return Err(ServerError::AlreadyStarted(addr));
        }

        let addr = SocketAddr::new(self.config.bind_addr, port);
        let listener = self
            .topology
            .run_on(PoolKind::Accept, async move { TcpListener::bind(addr).await })
            .await?
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let settings =
            ConnectionSettings::new(self.config.idle_detection_secs, self.config.max_frame_length);
        let pools = self.topology.handles().clone();
        pools.get(PoolKind::Accept).spawn(accept_loop(
            listener,
            Arc::new(self.pipeline.clone()),
            pools.clone(),
            settings,
            self.shutdown.clone(),
        ));

        tracing::info!(
            addr = %local,
            root = %self.config.root_path.display(),
            stages = ?self.pipeline.names(),
            "file server listening"
        );
        self.local_addr = Some(local);
        Ok(local)
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            self.registry.close_all();
            tracing::info!("file server shut down");
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn server_pipeline(
    config: &ServerConfig,
    registry: &ConnectionRegistry,
) -> Result<Pipeline, PipelineError> {
    let root = config.root_path.clone();
    let processors = Arc::new(ProcessorTable::server(
        config.root_path.clone(),
        config.chunk_size,
    ));

    let mut pipeline = Pipeline::new();
    pipeline
        .add(StageSpec::new("validate", || Box::new(InboundValidator)))?
        .add(StageSpec::new("trace", || Box::new(TraceStage)))?
        .add(FileStore::spec(root))?
        .add(StageSpec::new("dispatch", move || {
            Box::new(RequestDispatcher::new(processors.clone()))
        }))?;
    registry.attach(&mut pipeline)?;
    Ok(pipeline)
}

async fn accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    pools: PoolHandles,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match stream.into_std() {
                    Ok(stream) => {
                        tracing::debug!(peer = %peer, "connection accepted");
                        connection::open(stream, peer, &pipeline, &pools, settings);
                    }
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "failed to detach socket"),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
}
