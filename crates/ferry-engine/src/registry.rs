//! Connection registry — active peers and their inbound queues.
//!
//! Shared between the accept loop, every connection task and application
//! code. Keyed on the peer's remote address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use ferry_core::config::DEFAULT_INBOUND_QUEUE;
use ferry_core::Message;

use crate::connection::ConnectionHandle;
use crate::pipeline::{ConnectionEvent, Flow, Pipeline, PipelineError, Stage, StageContext, StageError, StageSpec};

type InboundQueue = Arc<Mutex<mpsc::Receiver<Message>>>;

/// One tracked peer connection.
#[derive(Debug)]
pub struct ActiveConnection {
    pub remote_address: SocketAddr,
    pub handle: ConnectionHandle,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: InboundQueue,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is not connected")]
    NotConnected(SocketAddr),

    #[error("no message from {peer} within {timeout:?}")]
    Timeout { peer: SocketAddr, timeout: Duration },

    #[error("broadcast failed on {failed} of {total} connections")]
    BroadcastFailed { failed: usize, total: usize },
}

#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<SocketAddr, ActiveConnection>>,
    inbound_capacity: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_QUEUE)
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose per-peer queues hold at most `inbound_capacity`
    /// unread messages.
    pub fn with_capacity(inbound_capacity: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            inbound_capacity: inbound_capacity.max(1),
        }
    }

    /// Append the connection-tracking and read-fan-out stages.
    pub fn attach(&self, pipeline: &mut Pipeline) -> Result<(), PipelineError> {
        let tracker = self.clone();
        let fan_out = self.clone();
        pipeline
            .add(StageSpec::new("connection_tracker", move || {
                Box::new(ConnectionTracker {
                    registry: tracker.clone(),
                })
            }))?
            .add(StageSpec::new("read_fan_out", move || {
                Box::new(ReadFanOut {
                    registry: fan_out.clone(),
                })
            }))?;
        Ok(())
    }

    fn insert(&self, handle: ConnectionHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);
        let peer = handle.peer_addr();
        self.connections.insert(
            peer,
            ActiveConnection {
                remote_address: peer,
                handle,
                inbound_tx,
                inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            },
        );
        tracing::info!(peer = %peer, active = self.connections.len(), "peer connected");
    }

    fn remove(&self, peer: SocketAddr) {
        if self.connections.remove(&peer).is_some() {
            tracing::info!(peer = %peer, active = self.connections.len(), "peer disconnected");
        }
    }

    fn push(&self, peer: SocketAddr, message: Message) -> Result<(), PushError> {
        let entry = self.connections.get(&peer).ok_or(PushError::NoQueue)?;
        entry.inbound_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::NoQueue,
        })
    }

    fn queue(&self, peer: SocketAddr) -> Result<InboundQueue, RegistryError> {
        self.connections
            .get(&peer)
            .map(|entry| entry.inbound_rx.clone())
            .ok_or(RegistryError::NotConnected(peer))
    }

    pub fn is_active(&self, peer: SocketAddr) -> bool {
        self.connections
            .get(&peer)
            .is_some_and(|entry| !entry.handle.is_closed())
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn handle(&self, peer: SocketAddr) -> Option<ConnectionHandle> {
        self.connections.get(&peer).map(|entry| entry.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send `message` to every active connection. Succeeds only if every
    /// write succeeds; returns how many peers were written to.
    pub async fn broadcast(&self, message: Message) -> Result<usize, RegistryError> {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        let total = handles.len();
        let results =
            futures::future::join_all(handles.iter().map(|h| h.send(message.clone()))).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, total, kind = %message.kind(), "broadcast incomplete");
            return Err(RegistryError::BroadcastFailed { failed, total });
        }
        Ok(total)
    }

    /// Next queued inbound message from `peer`, waiting at most `timeout`.
    pub async fn read(&self, peer: SocketAddr, timeout: Duration) -> Result<Message, RegistryError> {
        let queue = self.queue(peer)?;
        let mut rx = queue.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(RegistryError::NotConnected(peer)),
            Err(_) => Err(RegistryError::Timeout { peer, timeout }),
        }
    }

    /// Blocking variant of [`read`](Self::read) without a deadline.
    ///
    /// Must be called off the async runtime (a plain thread or
    /// `spawn_blocking`); tokio panics otherwise.
    pub fn read_sync(&self, peer: SocketAddr) -> Result<Message, RegistryError> {
        let queue = self.queue(peer)?;
        let mut rx = queue.blocking_lock();
        rx.blocking_recv().ok_or(RegistryError::NotConnected(peer))
    }

    /// Close every tracked connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.handle.close();
        }
    }
}

// ── Stages ───────────────────────────────────────────────────────────────────

/// Inserts the connection on activation and removes it when it goes away.
struct ConnectionTracker {
    registry: ConnectionRegistry,
}

impl Stage for ConnectionTracker {
    fn claims(&self, _message: &Message) -> bool {
        false
    }

    fn on_message(&mut self, message: Message, _ctx: &mut StageContext) -> Result<Flow, StageError> {
        Ok(Flow::Forward(message))
    }

    fn on_event(&mut self, event: &ConnectionEvent<'_>, ctx: &mut StageContext) -> Result<(), StageError> {
        match event {
            ConnectionEvent::Active => self.registry.insert(ctx.handle().clone()),
            ConnectionEvent::Inactive => self.registry.remove(ctx.peer()),
            ConnectionEvent::Idle | ConnectionEvent::Error(_) => {}
        }
        Ok(())
    }
}

enum PushError {
    NoQueue,
    Full,
}

/// Queues every inbound message that is neither a chunk nor a request.
/// A full queue drops the message.
struct ReadFanOut {
    registry: ConnectionRegistry,
}

impl Stage for ReadFanOut {
    fn claims(&self, message: &Message) -> bool {
        !matches!(message, Message::DataChunk(_)) && !message.is_request()
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        let kind = message.kind();
        match self.registry.push(ctx.peer(), message) {
            Ok(()) => {}
            Err(PushError::NoQueue) => {
                tracing::debug!(peer = %ctx.peer(), kind = %kind, "no queue for peer, message dropped");
            }
            Err(PushError::Full) => {
                tracing::warn!(peer = %ctx.peer(), kind = %kind, "inbound queue full, message dropped");
            }
        }
        Ok(Flow::Consumed)
    }
}
