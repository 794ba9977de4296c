use shared::protocol::{TransportMessage, VoiceRequest};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not running")]
    NotRunning,
    #[error("request rejected by transport: {0}")]
    Rejected(String),
}

/// The voice backend's request/response/event contract.
///
/// `issue_request` is fire-and-forget and returns immediately; outcomes
/// arrive later on the message subscription, either as a response echoing
/// the originating request or as an unsolicited event. The transport owns
/// its own threads; consumers must treat the subscription as the only
/// delivery path.
pub trait VoiceTransport: Send + Sync {
    fn issue_request(&self, request: VoiceRequest) -> Result<(), TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<TransportMessage>;
}

/// Stub used when no backend is wired up; every request fails fast.
pub struct MissingVoiceTransport {
    messages: broadcast::Sender<TransportMessage>,
}

impl Default for MissingVoiceTransport {
    fn default() -> Self {
        let (messages, _) = broadcast::channel(1);
        Self { messages }
    }
}

impl VoiceTransport for MissingVoiceTransport {
    fn issue_request(&self, _request: VoiceRequest) -> Result<(), TransportError> {
        Err(TransportError::NotRunning)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportMessage> {
        self.messages.subscribe()
    }
}
