//! Inbound audio path: PCM16 payload → samples → playback ring
//!
//! Runs on the network clock, once per inbound binary message.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{AudioFrame, SharedPlaybackRing};
use crate::codec;
use crate::error::CodecError;
use crate::events::{EventBus, RelayEvent};
use crate::network::transport::InboundSink;

/// What to do when inbound audio overwrites unread playback samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Drop the oldest samples and only count it
    #[default]
    DropOldest,
    /// Also publish `Overrun` and tell the backend to slow down
    Signal,
}

/// Control message sent to the backend under [`OverrunPolicy::Signal`]
#[derive(Debug, Serialize)]
struct Backpressure {
    #[serde(rename = "type")]
    kind: &'static str,
    dropped_samples: u64,
}

/// Decodes inbound frames into the shared playback ring
pub struct PlaybackPipeline {
    ring: SharedPlaybackRing,
    bus: EventBus,
    overrun: OverrunPolicy,
    sample_rate: AtomicU32,
    scratch: Mutex<Vec<f32>>,
    sequence: AtomicU64,
}

impl PlaybackPipeline {
    pub fn new(ring: SharedPlaybackRing, bus: EventBus, overrun: OverrunPolicy, sample_rate: u32) -> Self {
        Self {
            ring,
            bus,
            overrun,
            sample_rate: AtomicU32::new(sample_rate),
            scratch: Mutex::new(Vec::with_capacity(sample_rate as usize)),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn ring(&self) -> &SharedPlaybackRing {
        &self.ring
    }

    /// Rate used to tag received frames
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    /// Frames written to the ring so far
    pub fn frames_received(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl InboundSink for PlaybackPipeline {
    fn on_audio(&self, payload: &[u8]) -> Result<Option<String>, CodecError> {
        let mut samples = self.scratch.lock();
        codec::decode_into(payload, &mut samples)?;
        if samples.is_empty() {
            return Ok(None);
        }

        let dropped = self.ring.write(&samples);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        tracing::trace!("Received {}", codec::describe(payload, sample_rate));

        if self.bus.subscriber_count() > 0 {
            let frame = AudioFrame::new(samples.clone(), sample_rate, sequence);
            self.bus.publish(RelayEvent::AudioReceived(Arc::new(frame)));
        }

        if dropped == 0 {
            return Ok(None);
        }

        match self.overrun {
            OverrunPolicy::DropOldest => {
                tracing::debug!(dropped, "Playback ring overrun");
                Ok(None)
            }
            OverrunPolicy::Signal => {
                tracing::warn!(dropped, fill = self.ring.fill_level(), "Playback ring overrun");
                self.bus.publish(RelayEvent::Overrun {
                    dropped_samples: dropped,
                });
                let message = Backpressure {
                    kind: "backpressure",
                    dropped_samples: dropped,
                };
                Ok(serde_json::to_string(&message).ok())
            }
        }
    }
}
