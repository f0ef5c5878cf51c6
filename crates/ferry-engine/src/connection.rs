//! Connection driver — one task per TCP connection.
//!
//! The task owns the socket halves and this connection's stage instances.
//! It multiplexes three sources with `tokio::select!`:
//!
//!   - inbound frames, decoded and walked through the stages in order
//!   - write commands from [`ConnectionHandle`]s
//!   - the idle timer, reset by any read or write traffic
//!
//! Because one task drives everything, per-connection order is preserved:
//! a frame is fully processed (including file-io stages, which are awaited)
//! before the next one is read.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use ferry_core::message::body_len;
use ferry_core::wire::FrameHeader;
use ferry_core::{FileRegion, Frame, FrameCodec, Message, Segment, ValidationError, WireError};

use crate::executor::{PoolHandles, PoolKind};
use crate::pipeline::{BoundStage, ConnectionEvent, Flow, Pipeline, StageContext, StageError};

/// Read buffer used when streaming a file region onto the socket.
const REGION_BUFFER: usize = 256 * 1024;

/// Stand-in deadline when idle detection is disabled.
const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// None disables idle detection.
    pub idle_timeout: Option<Duration>,
    pub max_frame_length: u32,
}

impl ConnectionSettings {
    pub fn new(idle_secs: u64, max_frame_length: u32) -> Self {
        Self {
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            max_frame_length,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("invalid outbound message: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("socket write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("reading region of {0} failed: {1}")]
    Region(PathBuf, std::io::Error),

    #[error("region of {path} ended after {copied} of {expected} bytes")]
    ShortRegion {
        path: PathBuf,
        expected: u64,
        copied: u64,
    },
}

impl ConnectionError {
    /// Failures after the header reached the socket leave the stream
    /// unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Invalid(_) | ConnectionError::Wire(_) | ConnectionError::Closed
        )
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum Command {
    Write {
        message: Message,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
}

/// Cloneable reference to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `message` behind any earlier writes.
    pub fn enqueue(&self, message: Message) -> PendingWrite {
        let (done, rx) = oneshot::channel();
        // On a closed connection the sender is dropped with the command,
        // which resolves the pending write as closed.
        let _ = self.commands.send(Command::Write { message, done });
        PendingWrite { rx }
    }

    /// Write and flush `message`.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.enqueue(message).finished().await
    }

    /// Close the connection. Writes not yet started fail as closed.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.commands.is_closed()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    #[cfg(test)]
    pub(crate) fn detached(peer: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            peer,
            commands,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Completion of one queued write.
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<(), ConnectionError>>,
}

impl PendingWrite {
    pub async fn finished(self) -> Result<(), ConnectionError> {
        self.rx.await.unwrap_or(Err(ConnectionError::Closed))
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Validate, encode and write one frame, then flush.
///
/// File-region segments are streamed from disk straight onto `writer`.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    message.validate()?;
    let segments = message.encode();
    let header = FrameHeader::new(body_len(&segments), message.type_id())?;

    writer.write_all(&header.to_bytes()).await?;
    for segment in &segments {
        match segment {
            Segment::Bytes(bytes) => writer.write_all(bytes).await?,
            Segment::File(region) => copy_region(writer, region).await?,
        }
    }
    writer.flush().await?;
    Ok(())
}

async fn copy_region<W>(writer: &mut W, region: &FileRegion) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let region_err = |e| ConnectionError::Region(region.path.clone(), e);
    let mut file = tokio::fs::File::open(&region.path).await.map_err(region_err)?;
    file.seek(SeekFrom::Start(region.offset))
        .await
        .map_err(region_err)?;

    let mut reader = BufReader::with_capacity(REGION_BUFFER, file.take(region.len));
    let copied = tokio::io::copy_buf(&mut reader, writer).await?;
    if copied != region.len {
        return Err(ConnectionError::ShortRegion {
            path: region.path.clone(),
            expected: region.len,
            copied,
        });
    }
    Ok(())
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Start driving `stream` on the network-io pool with a fresh instance of
/// `pipeline`.
pub fn open(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    pipeline: &Pipeline,
    pools: &PoolHandles,
    settings: ConnectionSettings,
) -> ConnectionHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        peer,
        commands,
        closed: CancellationToken::new(),
    };
    let driver = Driver {
        handle: handle.clone(),
        stages: pipeline.instantiate(),
        file_io: pools.get(PoolKind::FileIo).clone(),
        writer: None,
        closing: false,
    };
    pools.network_io().spawn(driver.run(stream, rx, settings));
    handle
}

struct Driver {
    handle: ConnectionHandle,
    stages: Vec<BoundStage>,
    file_io: Handle,
    writer: Option<OwnedWriteHalf>,
    closing: bool,
}

impl Driver {
    async fn run(
        mut self,
        stream: std::net::TcpStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        settings: ConnectionSettings,
    ) {
        let peer = self.handle.peer;
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to register connection");
                self.shutdown().await;
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        let mut frames = FramedRead::new(read_half, FrameCodec::new(settings.max_frame_length));

        tracing::debug!(peer = %peer, "connection active");
        self.fire(ConnectionEvent::Active).await;

        let idle_period = settings.idle_timeout.unwrap_or(NEVER);
        let idle = tokio::time::sleep(idle_period);
        tokio::pin!(idle);

        while !self.closing && !self.handle.closed.is_cancelled() {
            tokio::select! {
                () = self.handle.closed.cancelled() => break,
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => self.on_frame(frame).await,
                        Some(Err(e)) => self.fail(StageError::Frame(e)).await,
                        None => {
                            tracing::debug!(peer = %peer, "peer closed connection");
                            break;
                        }
                    }
                    idle.as_mut().reset(Instant::now() + idle_period);
                }
                Some(Command::Write { message, done }) = commands.recv() => {
                    let result = self.write(&message).await;
                    let _ = done.send(result);
                    idle.as_mut().reset(Instant::now() + idle_period);
                }
                () = &mut idle, if settings.idle_timeout.is_some() => {
                    tracing::debug!(peer = %peer, "connection idle");
                    self.fire(ConnectionEvent::Idle).await;
                    idle.as_mut().reset(Instant::now() + idle_period);
                }
            }
        }

        // Fail anything still queued before the stages learn we are gone.
        commands.close();
        while let Ok(Command::Write { done, .. }) = commands.try_recv() {
            let _ = done.send(Err(ConnectionError::Closed));
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.handle.closed.cancel();
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.fire(ConnectionEvent::Inactive).await;
        tracing::debug!(peer = %self.handle.peer, "connection inactive");
    }

    async fn on_frame(&mut self, frame: Frame) {
        let result = match Message::decode(frame.type_id, frame.body) {
            Ok(message) => self.process(message).await,
            Err(e) => Err(StageError::Wire(e)),
        };
        if let Err(e) = result {
            self.fail(e).await;
        }
    }

    /// Every stage sees the error, then the connection closes.
    async fn fail(&mut self, error: StageError) {
        tracing::warn!(peer = %self.handle.peer, error = %error, "connection failed");
        self.fire(ConnectionEvent::Error(&error)).await;
        self.closing = true;
    }

    async fn process(&mut self, message: Message) -> Result<(), StageError> {
        let mut current = message;
        for index in 0..self.stages.len() {
            let claimed = self.stages[index]
                .stage
                .as_ref()
                .is_some_and(|stage| stage.claims(&current));
            if !claimed {
                continue;
            }

            let (result, ctx) = self.run_stage(index, current).await;
            self.apply(ctx).await;
            match result? {
                Flow::Consumed => return Ok(()),
                Flow::Forward(message) => current = message,
            }
        }
        Ok(())
    }

    async fn run_stage(
        &mut self,
        index: usize,
        message: Message,
    ) -> (Result<Flow, StageError>, StageContext) {
        let mut ctx = StageContext::new(self.handle.clone());
        let (name, pool, stage) = {
            let bound = &mut self.stages[index];
            (bound.name, bound.pool, bound.stage.take())
        };
        let Some(mut stage) = stage else {
            return (Ok(Flow::Forward(message)), ctx);
        };

        if pool != PoolKind::FileIo {
            let result = stage.on_message(message, &mut ctx);
            self.stages[index].stage = Some(stage);
            return (result, ctx);
        }

        let joined = self
            .file_io
            .spawn_blocking(move || {
                let result = stage.on_message(message, &mut ctx);
                (stage, result, ctx)
            })
            .await;
        match joined {
            Ok((stage, result, ctx)) => {
                self.stages[index].stage = Some(stage);
                (result, ctx)
            }
            Err(e) => {
                tracing::error!(peer = %self.handle.peer, stage = name, error = %e, "stage task failed");
                (
                    Err(StageError::Panicked(name)),
                    StageContext::new(self.handle.clone()),
                )
            }
        }
    }

    async fn fire(&mut self, event: ConnectionEvent<'_>) {
        for index in 0..self.stages.len() {
            let mut ctx = StageContext::new(self.handle.clone());
            let name = self.stages[index].name;
            let result = match self.stages[index].stage.as_mut() {
                Some(stage) => stage.on_event(&event, &mut ctx),
                None => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(peer = %self.handle.peer, stage = name, error = %e, "event handling failed");
            }
            self.apply(ctx).await;
        }
    }

    /// Flush a stage's queued writes, then honour its close request.
    async fn apply(&mut self, ctx: StageContext) {
        let (outbound, close) = ctx.into_parts();
        for message in outbound {
            if let Err(e) = self.write(&message).await {
                tracing::warn!(
                    peer = %self.handle.peer,
                    kind = %message.kind(),
                    error = %e,
                    "write failed"
                );
            }
        }
        if close {
            self.closing = true;
        }
    }

    async fn write(&mut self, message: &Message) -> Result<(), ConnectionError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        let result = write_message(writer, message).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.closing = true;
            }
        }
        result
    }
}
