//! Executor topology — the named worker pools pipeline stages bind to.
//!
//! Each pool is its own tokio runtime with its own threads:
//!
//!   accept      server listener only
//!   network-io  connection tasks: codec, validation, dispatch, writes
//!   file-io     blocking chunk persistence via `spawn_blocking`
//!
//! Disk writes never run on a network-io worker; stages that block are
//! rejected by the pipeline unless they are bound to the file-io pool.

use std::fmt;
use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Accept,
    NetworkIo,
    FileIo,
}

impl PoolKind {
    /// Only the file-io pool may run stages that block on disk.
    pub fn allows_blocking(self) -> bool {
        matches!(self, PoolKind::FileIo)
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolKind::Accept => "accept",
            PoolKind::NetworkIo => "network-io",
            PoolKind::FileIo => "file-io",
        })
    }
}

/// Thread counts per pool. 0 = platform default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSizes {
    pub accept: usize,
    pub network_io: usize,
    pub file_io: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to build {pool} pool: {source}")]
    Build {
        pool: PoolKind,
        source: std::io::Error,
    },

    #[error("task on {pool} pool did not complete: {source}")]
    Join {
        pool: PoolKind,
        source: tokio::task::JoinError,
    },
}

/// Cheap, cloneable access to the pools of one topology.
#[derive(Debug, Clone)]
pub struct PoolHandles {
    accept: Option<Handle>,
    network_io: Handle,
    file_io: Handle,
}

impl PoolHandles {
    /// Handle for `pool`. A topology without an accept pool runs accept
    /// work on network-io.
    pub fn get(&self, pool: PoolKind) -> &Handle {
        match pool {
            PoolKind::Accept => self.accept.as_ref().unwrap_or(&self.network_io),
            PoolKind::NetworkIo => &self.network_io,
            PoolKind::FileIo => &self.file_io,
        }
    }

    pub fn network_io(&self) -> &Handle {
        &self.network_io
    }

    pub fn file_io(&self) -> &Handle {
        &self.file_io
    }
}

/// Owns the runtimes. Dropping the topology stops every pool without
/// waiting for in-flight tasks.
pub struct ExecutorTopology {
    handles: PoolHandles,
    runtimes: Vec<Runtime>,
}

impl ExecutorTopology {
    /// Accept, network-io and file-io pools.
    pub fn server(sizes: PoolSizes) -> Result<Self, ExecutorError> {
        Self::build(sizes, true)
    }

    /// Network-io and file-io pools only.
    pub fn client(sizes: PoolSizes) -> Result<Self, ExecutorError> {
        Self::build(sizes, false)
    }

    fn build(sizes: PoolSizes, with_accept: bool) -> Result<Self, ExecutorError> {
        let mut runtimes = Vec::with_capacity(3);

        let accept = if with_accept {
            let rt = runtime(PoolKind::Accept, sizes.accept.max(1), 0)?;
            let handle = rt.handle().clone();
            runtimes.push(rt);
            Some(handle)
        } else {
            None
        };

        let network_io = runtime(PoolKind::NetworkIo, sizes.network_io, 0)?;
        let network_handle = network_io.handle().clone();
        runtimes.push(network_io);

        // One worker drives the pool; the blocking threads do the disk work.
        let file_io = runtime(PoolKind::FileIo, 1, sizes.file_io)?;
        let file_handle = file_io.handle().clone();
        runtimes.push(file_io);

        tracing::debug!(
            accept = sizes.accept,
            network_io = sizes.network_io,
            file_io = sizes.file_io,
            with_accept,
            "executor topology ready"
        );

        Ok(Self {
            handles: PoolHandles {
                accept,
                network_io: network_handle,
                file_io: file_handle,
            },
            runtimes,
        })
    }

    pub fn handles(&self) -> &PoolHandles {
        &self.handles
    }

    /// Run `future` on `pool` and wait for its output.
    pub async fn run_on<F>(&self, pool: PoolKind, future: F) -> Result<F::Output, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handles
            .get(pool)
            .spawn(future)
            .await
            .map_err(|source| ExecutorError::Join { pool, source })
    }

    /// Run blocking `work` on the file-io pool.
    pub async fn run_blocking<F, T>(&self, work: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handles
            .file_io
            .spawn_blocking(work)
            .await
            .map_err(|source| ExecutorError::Join {
                pool: PoolKind::FileIo,
                source,
            })
    }
}

impl Drop for ExecutorTopology {
    fn drop(&mut self) {
        for rt in self.runtimes.drain(..) {
            rt.shutdown_background();
        }
    }
}

fn runtime(pool: PoolKind, workers: usize, blocking: usize) -> Result<Runtime, ExecutorError> {
    let mut builder = Builder::new_multi_thread();
    builder.thread_name(format!("ferry-{pool}")).enable_all();
    if workers > 0 {
        builder.worker_threads(workers);
    }
    if blocking > 0 {
        builder.max_blocking_threads(blocking);
    }
    builder
        .build()
        .map_err(|source| ExecutorError::Build { pool, source })
}
