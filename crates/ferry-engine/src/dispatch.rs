//! Routes inbound requests to their processors and assembles responses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_core::path::{resolve_under, PathError};
use ferry_core::{Message, MessageKind, ResponseCode};

use crate::chunk::{split, SplitError};
use crate::pipeline::{ConnectionEvent, Flow, Stage, StageContext, StageError};

/// Handles one request kind, returning the messages to send before the
/// final OK.
pub type Processor = Arc<dyn Fn(&Message) -> Result<Vec<Message>, ProcessError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("no processor registered for {0}")]
    NoProcessor(MessageKind),

    #[error("processor for {expected} received {actual}")]
    WrongKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl ProcessError {
    pub fn code(&self) -> ResponseCode {
        match self {
            ProcessError::Split(e) => e.code(),
            _ => ResponseCode::InternalError,
        }
    }
}

/// Request kind → processor.
#[derive(Clone, Default)]
pub struct ProcessorTable {
    processors: HashMap<MessageKind, Processor>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: MessageKind, processor: F) -> &mut Self
    where
        F: Fn(&Message) -> Result<Vec<Message>, ProcessError> + Send + Sync + 'static,
    {
        self.processors.insert(kind, Arc::new(processor));
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<&Processor> {
        self.processors.get(&kind)
    }

    /// Processors for a server serving files from `root`.
    pub fn server(root: PathBuf, chunk_size: u64) -> Self {
        let mut table = Self::new();
        table
            .register(MessageKind::FileDownloadRequest, move |message| {
                download(&root, chunk_size, message)
            })
            .register(MessageKind::FileUploadTail, |_| Ok(Vec::new()));
        table
    }
}

/// Resolve the requested source under `root` and split it into chunks
/// addressed to the requester's destination.
fn download(root: &Path, chunk_size: u64, message: &Message) -> Result<Vec<Message>, ProcessError> {
    let Message::FileDownloadRequest {
        source_path,
        dest_path,
    } = message
    else {
        return Err(ProcessError::WrongKind {
            expected: MessageKind::FileDownloadRequest,
            actual: message.kind(),
        });
    };
    let source = resolve_under(root, source_path)?;
    let chunks = split(&source, dest_path, chunk_size)?;
    Ok(chunks.into_iter().map(Message::DataChunk).collect())
}

/// Server-side stage answering requests.
pub struct RequestDispatcher {
    processors: Arc<ProcessorTable>,
}

impl RequestDispatcher {
    pub fn new(processors: Arc<ProcessorTable>) -> Self {
        Self { processors }
    }
}

impl Stage for RequestDispatcher {
    fn claims(&self, message: &Message) -> bool {
        message.is_request()
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        let kind = message.kind();
        let processor = self
            .processors
            .get(kind)
            .ok_or(ProcessError::NoProcessor(kind))?;
        let responses = (**processor)(&message)?;

        tracing::info!(
            peer = %ctx.peer(),
            kind = %kind,
            messages = responses.len(),
            "request processed"
        );
        for response in responses {
            ctx.write(response);
        }
        ctx.write(Message::ok());
        Ok(Flow::Consumed)
    }

    fn on_event(&mut self, event: &ConnectionEvent<'_>, ctx: &mut StageContext) -> Result<(), StageError> {
        match event {
            ConnectionEvent::Idle => {
                tracing::info!(peer = %ctx.peer(), "peer idle, closing");
                ctx.close();
            }
            ConnectionEvent::Error(e) => {
                let code = e.code();
                tracing::warn!(peer = %ctx.peer(), code = code.code(), error = %e, "request failed");
                ctx.write(Message::response(code));
                ctx.close();
            }
            ConnectionEvent::Active | ConnectionEvent::Inactive => {}
        }
        Ok(())
    }
}
