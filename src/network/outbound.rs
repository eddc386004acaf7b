//! Outbound messages and what happens to them while disconnected

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio_tungstenite::tungstenite::Message;

/// One message headed for the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw PCM16 LE audio frame
    Audio(Bytes),
    /// Control or debug text
    Text(String),
}

impl Outbound {
    pub fn len(&self) -> usize {
        match self {
            Outbound::Audio(data) => data.len(),
            Outbound::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_message(self) -> Message {
        match self {
            Outbound::Audio(data) => Message::Binary(data),
            Outbound::Text(text) => Message::Text(text.into()),
        }
    }
}

/// Policy for messages sent while the transport is not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutboundPolicy {
    /// Discard immediately
    #[default]
    Drop,
    /// Keep the newest `max_frames` messages and send them after reconnecting
    QueueAndFlush { max_frames: usize },
}

/// Holding area applied by the transport task while disconnected
#[derive(Debug)]
pub struct OutboundQueue {
    policy: OutboundPolicy,
    pending: VecDeque<Outbound>,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(policy: OutboundPolicy) -> Self {
        let capacity = match policy {
            OutboundPolicy::Drop => 0,
            OutboundPolicy::QueueAndFlush { max_frames } => max_frames.min(1024),
        };
        Self {
            policy,
            pending: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Hold `message` until the next connect. Returns false if it was dropped.
    pub fn hold(&mut self, message: Outbound) -> bool {
        match self.policy {
            OutboundPolicy::Drop => {
                self.dropped += 1;
                false
            }
            OutboundPolicy::QueueAndFlush { max_frames } => {
                if max_frames == 0 {
                    self.dropped += 1;
                    return false;
                }
                if self.pending.len() == max_frames {
                    self.pending.pop_front();
                    self.dropped += 1;
                }
                self.pending.push_back(message);
                true
            }
        }
    }

    /// Take everything held, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = Outbound> + '_ {
        self.pending.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Messages discarded by this queue so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn policy(&self) -> OutboundPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(tag: u8) -> Outbound {
        Outbound::Audio(Bytes::from(vec![tag, 0]))
    }

    #[test]
    fn test_drop_policy_holds_nothing() {
        let mut queue = OutboundQueue::new(OutboundPolicy::Drop);
        assert!(!queue.hold(audio(1)));
        assert!(!queue.hold(Outbound::Text("hello".into())));
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn test_queue_keeps_newest() {
        let mut queue = OutboundQueue::new(OutboundPolicy::QueueAndFlush { max_frames: 2 });
        assert!(queue.hold(audio(1)));
        assert!(queue.hold(audio(2)));
        assert!(queue.hold(audio(3)));
        assert_eq!(queue.dropped(), 1);

        let flushed: Vec<Outbound> = queue.drain().collect();
        assert_eq!(flushed, vec![audio(2), audio(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            outbound: OutboundPolicy,
        }
        let parsed: Wrapper = toml::from_str("outbound = { mode = \"queue_and_flush\", max_frames = 40 }").unwrap();
        assert_eq!(parsed.outbound, OutboundPolicy::QueueAndFlush { max_frames: 40 });

        let parsed: Wrapper = toml::from_str("outbound = { mode = \"drop\" }").unwrap();
        assert_eq!(parsed.outbound, OutboundPolicy::Drop);
    }

    #[test]
    fn test_message_conversion() {
        assert_eq!(audio(7).into_message(), Message::Binary(Bytes::from(vec![7, 0])));
        assert_eq!(Outbound::Text("ping".into()).into_message(), Message::text("ping"));
    }
}
