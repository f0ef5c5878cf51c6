//! Request correlator — resolves the single outstanding request of a client
//! connection.
//!
//! The outcome is written once; later responses, errors or lifecycle events
//! never change it. If the stage is dropped without resolving (the
//! connection task ended), the request resolves as channel closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use ferry_core::{Message, ResponseCode};

use crate::pipeline::{ConnectionEvent, Flow, Stage, StageContext, StageError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{}", .0.message())]
    Rejected(ResponseCode),

    #[error("pipeline failed: {message}")]
    Pipeline { code: ResponseCode, message: String },

    #[error("{}", ResponseCode::PeerNotResponding.message())]
    PeerNotResponding,

    #[error("connection closed before a response arrived")]
    ChannelClosed,

    #[error("no response within {0:?}")]
    TimedOut(Duration),
}

impl RequestError {
    /// Numeric code, where the failure has one.
    pub fn code(&self) -> Option<ResponseCode> {
        match self {
            RequestError::Rejected(code) => Some(*code),
            RequestError::Pipeline { code, .. } => Some(*code),
            RequestError::PeerNotResponding => Some(ResponseCode::PeerNotResponding),
            RequestError::ChannelClosed | RequestError::TimedOut(_) => None,
        }
    }
}

pub type Outcome = Result<(), RequestError>;

/// Terminal outcome of one request, shared between the caller and the
/// connection's correlator stage.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    state: Arc<watch::Sender<Option<Outcome>>>,
}

impl Default for PendingRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequest {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Record the outcome. Returns false if it was already resolved.
    pub fn resolve(&self, outcome: Outcome) -> bool {
        self.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.state.subscribe();
        let resolved = rx.wait_for(Option::is_some).await.map(|slot| (*slot).clone());
        match resolved {
            Ok(Some(outcome)) => outcome,
            _ => Err(RequestError::ChannelClosed),
        }
    }

    /// Wait for at most `deadline`, resolving as timed out when it passes.
    pub async fn wait_timeout(&self, deadline: Option<Duration>) -> Outcome {
        let Some(deadline) = deadline else {
            return self.wait().await;
        };
        if let Ok(outcome) = tokio::time::timeout(deadline, self.wait()).await {
            return outcome;
        }
        self.resolve(Err(RequestError::TimedOut(deadline)));
        self.outcome()
            .unwrap_or(Err(RequestError::TimedOut(deadline)))
    }
}

/// Client-side stage resolving a [`PendingRequest`].
pub struct Correlator {
    pending: PendingRequest,
}

impl Correlator {
    pub fn new(pending: PendingRequest) -> Self {
        Self { pending }
    }
}

impl Stage for Correlator {
    fn claims(&self, message: &Message) -> bool {
        matches!(message, Message::Response { .. })
    }

    fn on_message(&mut self, message: Message, ctx: &mut StageContext) -> Result<Flow, StageError> {
        let Message::Response { code } = message else {
            return Ok(Flow::Forward(message));
        };
        let outcome = if code.is_ok() {
            Ok(())
        } else {
            Err(RequestError::Rejected(code))
        };
        if !self.pending.resolve(outcome) {
            tracing::debug!(peer = %ctx.peer(), code = code.code(), "late response ignored");
        }
        Ok(Flow::Consumed)
    }

    fn on_event(&mut self, event: &ConnectionEvent<'_>, ctx: &mut StageContext) -> Result<(), StageError> {
        let outcome = match event {
            ConnectionEvent::Active => return Ok(()),
            ConnectionEvent::Error(e) => Err(RequestError::Pipeline {
                code: e.code(),
                message: e.to_string(),
            }),
            ConnectionEvent::Idle => {
                tracing::warn!(peer = %ctx.peer(), "no response from peer");
                Err(RequestError::PeerNotResponding)
            }
            ConnectionEvent::Inactive => Err(RequestError::ChannelClosed),
        };
        self.pending.resolve(outcome);
        Ok(())
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.pending.resolve(Err(RequestError::ChannelClosed));
    }
}
