//! Stream session: lifecycle coordination and the inbound playback path

pub mod coordinator;
pub mod pipeline;

pub use coordinator::{CoordinatorConfig, StopHandle, StreamCoordinator};
pub use pipeline::{OverrunPolicy, PlaybackPipeline};
