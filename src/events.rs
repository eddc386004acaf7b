//! Notification side-channel
//!
//! Components publish [`RelayEvent`]s on an [`EventBus`]; observers call
//! [`EventBus::subscribe`] and drop the receiver to unsubscribe. Publishing
//! never blocks: a subscriber that falls behind sees
//! `RecvError::Lagged` instead of stalling the publisher.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::audio::buffer::AudioFrame;
use crate::error::ErrorKind;
use crate::network::state::ConnectionState;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the relay reports to its host
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Transport reached `Connected`
    Connected,
    /// An established connection was lost or closed
    Disconnected,
    StateChanged(ConnectionState),
    /// Capture started or stopped
    TalkingChanged(bool),
    /// One inbound frame was decoded and queued for playback
    AudioReceived(Arc<AudioFrame>),
    TextReceived(String),
    Error { kind: ErrorKind, message: String },
    /// Inbound audio overwrote unread playback samples
    Overrun { dropped_samples: u64 },
}

impl RelayEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        RelayEvent::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Broadcast bus shared by the transport, pipeline and coordinator
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
