//! Small general-purpose stages.

use ferry_core::Message;

use crate::pipeline::{ConnectionEvent, Flow, Stage, StageContext, StageError};

/// Validates every decoded message before any other stage sees it.
pub struct InboundValidator;

impl Stage for InboundValidator {
    fn claims(&self, _message: &Message) -> bool {
        true
    }

    fn on_message(&mut self, message: Message, _ctx: &mut StageContext) -> Result<Flow, StageError> {
        message.validate()?;
        Ok(Flow::Forward(message))
    }
}

/// Logs inbound traffic and connection events at debug level.
pub struct TraceStage;

impl Stage for TraceStage {
    fn claims(&self, _message: &Message) -> bool {
        true
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        match &message {
            Message::DataChunk(chunk) => tracing::debug!(
                peer = %ctx.peer(),
                kind = ?chunk.kind,
                store_path = %chunk.store_path,
                bytes = chunk.payload.len(),
                "chunk received"
            ),
            other => tracing::debug!(peer = %ctx.peer(), kind = %other.kind(), "message received"),
        }
        Ok(Flow::Forward(message))
    }

    fn on_event(&mut self, event: &ConnectionEvent<'_>, ctx: &mut StageContext) -> Result<(), StageError> {
        match event {
            ConnectionEvent::Error(e) => tracing::debug!(peer = %ctx.peer(), error = %e, "connection error"),
            other => tracing::debug!(peer = %ctx.peer(), event = ?other, "connection event"),
        }
        Ok(())
    }
}

/// Terminal stage: drops whatever no earlier stage consumed.
pub struct DropUnhandled;

impl Stage for DropUnhandled {
    fn claims(&self, _message: &Message) -> bool {
        true
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        tracing::debug!(peer = %ctx.peer(), kind = %message.kind(), "unhandled message dropped");
        Ok(Flow::Consumed)
    }
}
