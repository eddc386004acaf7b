//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
#[cfg(test)]
pub(crate) mod fake;
pub mod playback;

pub use buffer::{create_shared_ring, AudioFrame, PlaybackRing, RingStats, SharedPlaybackRing};
pub use capture::{CaptureConfig, CaptureHandle, CaptureSource, MicrophoneDevice};
pub use device::{list_devices, AudioDeviceInfo, CpalMicrophone};
pub use playback::AudioPlayback;
