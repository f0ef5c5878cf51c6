//! Handler pipeline — ordered processing stages per connection.
//!
//! A [`Pipeline`] is a list of [`StageSpec`]s shared by every connection
//! built from it. Each connection instantiates its own stages from the
//! specs' factories, so stage state is never shared between peers.
//!
//! Inbound messages walk the stages in order. A stage sees a message only
//! if [`Stage::claims`] returns true, and then either consumes it or
//! explicitly forwards it with [`Flow::Forward`]. Whatever reaches the end
//! is dropped by the terminal stage that every instantiation appends.
//!
//! Connection events (active, idle, error, inactive) are delivered to every
//! stage in order, regardless of claims.

use std::net::SocketAddr;
use std::sync::Arc;

use ferry_core::{FrameError, Message, ResponseCode, ValidationError, WireError};

use crate::connection::ConnectionHandle;
use crate::dispatch::ProcessError;
use crate::executor::PoolKind;
use crate::file_store::StoreError;
use crate::stages::DropUnhandled;

// ── Stage contract ───────────────────────────────────────────────────────────

/// What a stage did with a message it claimed.
#[derive(Debug)]
pub enum Flow {
    Consumed,
    Forward(Message),
}

/// Lifecycle events of one connection.
#[derive(Debug)]
pub enum ConnectionEvent<'a> {
    Active,
    /// No read or write traffic for the idle interval.
    Idle,
    /// A decode, validation or stage failure. The connection closes after
    /// every stage has seen it.
    Error(&'a StageError),
    Inactive,
}

pub trait Stage: Send + 'static {
    fn claims(&self, message: &Message) -> bool;

    fn on_message(&mut self, message: Message, ctx: &mut StageContext)
        -> Result<Flow, StageError>;

    /// True if `on_message` does blocking disk I/O. Such a stage may only
    /// be bound to a pool that allows blocking.
    fn blocks(&self) -> bool {
        false
    }

    /// Events run on the connection task even for stages bound to another
    /// pool, so they must not block.
    fn on_event(
        &mut self,
        _event: &ConnectionEvent<'_>,
        _ctx: &mut StageContext,
    ) -> Result<(), StageError> {
        Ok(())
    }
}

/// Per-call view of the connection handed to a stage.
///
/// Messages queued with [`write`](Self::write) are written and flushed in
/// order as soon as the stage returns.
pub struct StageContext {
    handle: ConnectionHandle,
    outbound: Vec<Message>,
    close: bool,
}

impl StageContext {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            outbound: Vec::new(),
            close: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn write(&mut self, message: Message) {
        self.outbound.push(message);
    }

    /// Close the connection once the queued writes are flushed.
    pub fn close(&mut self) {
        self.close = true;
    }

    pub(crate) fn into_parts(self) -> (Vec<Message>, bool) {
        (self.outbound, self.close)
    }
}

// ── Specs ────────────────────────────────────────────────────────────────────

type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Declaration of one stage: its name, the pool it runs on and how to build
/// a fresh instance for a new connection.
#[derive(Clone)]
pub struct StageSpec {
    name: &'static str,
    pool: PoolKind,
    blocking: bool,
    factory: StageFactory,
}

impl StageSpec {
    /// A non-blocking stage run on the connection's network-io worker.
    pub fn new<F>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        Self {
            name,
            pool: PoolKind::NetworkIo,
            blocking: false,
            factory: Arc::new(factory),
        }
    }

    pub fn on_pool(mut self, pool: PoolKind) -> Self {
        self.pool = pool;
        self
    }

    /// Mark the stage as doing blocking disk I/O.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pool(&self) -> PoolKind {
        self.pool
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// A stage instance owned by one connection.
pub(crate) struct BoundStage {
    pub name: &'static str,
    pub pool: PoolKind,
    /// Taken while the stage runs on another pool.
    pub stage: Option<Box<dyn Stage>>,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    specs: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. A stage that blocks, whether declared on the spec
    /// or reported by the stage itself, must be bound to the file-io pool.
    pub fn add(&mut self, spec: StageSpec) -> Result<&mut Self, PipelineError> {
        let blocks = spec.blocking || (spec.factory)().blocks();
        if blocks && !spec.pool.allows_blocking() {
            return Err(PipelineError::BlockingOnPool {
                stage: spec.name,
                pool: spec.pool,
            });
        }
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(PipelineError::DuplicateStage(spec.name));
        }
        self.specs.push(spec);
        Ok(self)
    }

    /// Remove a stage by name. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.specs.len();
        self.specs.retain(|s| s.name != name);
        self.specs.len() != before
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Fresh stage instances for one connection, terminal drop included.
    pub(crate) fn instantiate(&self) -> Vec<BoundStage> {
        let mut stages: Vec<BoundStage> = self
            .specs
            .iter()
            .map(|spec| BoundStage {
                name: spec.name,
                pool: spec.pool,
                stage: Some((spec.factory)()),
            })
            .collect();
        stages.push(BoundStage {
            name: "drop",
            pool: PoolKind::NetworkIo,
            stage: Some(Box::new(DropUnhandled)),
        });
        stages
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("stage {stage} blocks but is bound to the {pool} pool")]
    BlockingOnPool { stage: &'static str, pool: PoolKind },

    #[error("stage {0} is already in the pipeline")]
    DuplicateStage(&'static str),
}

/// Any failure raised while processing a connection's traffic.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("frame decode failed: {0}")]
    Frame(#[from] FrameError),

    #[error("message decode failed: {0}")]
    Wire(#[from] WireError),

    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("stage {0} panicked")]
    Panicked(&'static str),
}

impl StageError {
    /// Response code reported to the peer for this failure.
    pub fn code(&self) -> ResponseCode {
        match self {
            StageError::Process(e) => e.code(),
            _ => ResponseCode::InternalError,
        }
    }
}
