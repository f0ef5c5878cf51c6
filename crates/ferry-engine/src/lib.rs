//! ferry-engine — the async network engine behind the Ferry protocol.
//!
//! Pipelines of stages bound to worker pools, one task per connection,
//! chunked file transfer, request correlation, and the client and server
//! built from them.

pub mod chunk;
pub mod client;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod executor;
pub mod file_store;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod stages;

pub use client::{ClientError, FileClient, LocalFile, RemoteFile};
pub use connection::{ConnectionError, ConnectionHandle, ConnectionSettings};
pub use correlator::{PendingRequest, RequestError};
pub use executor::{ExecutorTopology, PoolKind, PoolSizes};
pub use pipeline::{ConnectionEvent, Flow, Pipeline, PipelineError, Stage, StageContext, StageError, StageSpec};
pub use registry::{ConnectionRegistry, RegistryError};
pub use server::{FileServer, ServerError};
