//! Stream lifecycle: capture, transport and playback wiring
//!
//! ```text
//!  tick ──► CaptureSource ──► codec::encode ──► RelayTransport.send ──► backend
//!                                                                          │
//!  output callback ◄── PlaybackRing ◄── PlaybackPipeline ◄── inbound ◄─────┘
//! ```
//!
//! The coordinator owns the capture side and is driven by its host through
//! [`StreamCoordinator::on_tick`]. The inbound side runs on the transport
//! task and the playback side on the audio callback; the coordinator only
//! shares the ring and the connection state with them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::audio::buffer::{PlaybackRing, SharedPlaybackRing};
use crate::audio::capture::{CaptureConfig, CaptureSource, MicrophoneDevice};
use crate::codec;
use crate::error::{AudioError, ErrorKind, NetworkError, Result, SessionError};
use crate::events::{EventBus, RelayEvent};
use crate::network::state::ConnectionState;
use crate::network::transport::{RelayTransport, TransportConfig, TransportStats};
use crate::session::pipeline::{OverrunPolicy, PlaybackPipeline};

/// Everything the coordinator needs, resolved before construction
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub capture: CaptureConfig,
    /// Input device name; the first listed device when `None`
    pub input_device: Option<String>,
    pub playback_buffer_seconds: f32,
    pub overrun: OverrunPolicy,
    pub transport: TransportConfig,
}

/// Cloneable handle that asks a running coordinator to stop.
///
/// The stop happens on the next [`StreamCoordinator::on_tick`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Owns one bidirectional audio stream
pub struct StreamCoordinator {
    capture: CaptureSource,
    transport: RelayTransport,
    pipeline: Arc<PlaybackPipeline>,
    bus: EventBus,
    input_device: Option<String>,
    reconnect_enabled: bool,
    running: bool,
    talking: bool,
    session_id: Option<Uuid>,
    stop_requested: Arc<AtomicBool>,
}

impl StreamCoordinator {
    pub fn new(config: CoordinatorConfig, microphone: Box<dyn MicrophoneDevice>) -> Self {
        let bus = EventBus::default();
        let ring: SharedPlaybackRing = Arc::new(PlaybackRing::with_duration(
            config.capture.sample_rate,
            config.playback_buffer_seconds,
        ));
        let pipeline = Arc::new(PlaybackPipeline::new(
            ring,
            bus.clone(),
            config.overrun,
            config.capture.sample_rate,
        ));
        let reconnect_enabled = config.transport.reconnect.enabled;
        let transport = RelayTransport::new(config.transport, bus.clone(), pipeline.clone());

        Self {
            capture: CaptureSource::new(microphone, config.capture),
            transport,
            pipeline,
            bus,
            input_device: config.input_device,
            reconnect_enabled,
            running: false,
            talking: false,
            session_id: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect to the backend and, once connected, start capturing.
    ///
    /// Fails with `AlreadyRunning` if a stream is active, with the connect
    /// error if the first attempt fails, or with the capture error if the
    /// microphone cannot be opened (the transport is closed again then).
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(SessionError::AlreadyRunning.into());
        }

        let mut events = self.bus.subscribe();
        self.stop_requested.store(false, Ordering::SeqCst);
        self.transport.set_auto_reconnect(self.reconnect_enabled);
        let url = self.transport.url();
        tracing::info!(url = %url, "Starting stream");
        self.transport.connect(&url)?;

        if let Err(e) = self.first_outcome(&mut events).await {
            tracing::warn!("Stream start failed: {}", e);
            self.transport.set_auto_reconnect(false);
            self.transport.close();
            return Err(e);
        }

        if let Err(e) = self.capture.start(self.input_device.as_deref()) {
            tracing::error!("Failed to start capture: {}", e);
            self.transport.set_auto_reconnect(false);
            self.transport.close();
            return Err(e.into());
        }

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.running = true;
        self.set_talking(true);
        tracing::info!(
            session = %session_id,
            device = self.capture.device_name().unwrap_or_default(),
            samples_per_frame = self.capture.samples_per_frame(),
            "Stream started"
        );
        Ok(())
    }

    async fn first_outcome(&self, events: &mut broadcast::Receiver<RelayEvent>) -> Result<()> {
        loop {
            match events.recv().await {
                Ok(RelayEvent::Connected) => return Ok(()),
                Ok(RelayEvent::Error {
                    kind: ErrorKind::Connect,
                    message,
                }) => return Err(NetworkError::Connect(message).into()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Missed events while connecting");
                    if self.transport.is_connected() {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(SessionError::Aborted.into()),
            }
        }
    }

    /// Stop capturing and close the connection. Idempotent.
    ///
    /// Disables reconnection; the partial capture frame is discarded.
    pub fn stop(&mut self) {
        self.transport.set_auto_reconnect(false);
        self.capture.stop();
        self.set_talking(false);
        self.transport.close();
        if self.running {
            self.running = false;
            tracing::info!(session = ?self.session_id.take(), "Stream stopped");
        }
    }

    /// Capture clock entry point: cut new frames, encode them and send.
    ///
    /// Returns how many frames were handed to the transport. Frames cut
    /// while disconnected are dropped by the transport. Losing the
    /// microphone stops talking but keeps the connection;
    /// [`StreamCoordinator::change_microphone`] resumes capture.
    pub fn on_tick(&mut self) -> usize {
        if self.stop_requested.swap(false, Ordering::SeqCst) {
            self.stop();
            return 0;
        }
        if !self.running {
            return 0;
        }

        let mut sent = 0;
        for frame in self.capture.on_tick() {
            if self.transport.send(codec::encode(&frame.samples)) {
                sent += 1;
            }
        }

        if let Some(e) = self.capture.take_device_error() {
            self.bus
                .publish(RelayEvent::error(ErrorKind::DeviceUnavailable, e.to_string()));
            self.set_talking(false);
        }
        sent
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: self.stop_requested.clone(),
        }
    }

    /// Switch input device, restarting capture if it is running
    pub fn change_microphone(&mut self, device: Option<&str>) -> std::result::Result<(), AudioError> {
        self.input_device = device.map(str::to_string);
        tracing::info!(device = device.unwrap_or("<default>"), "Microphone changed");
        self.restart_capture()
    }

    /// Change sample rate and frame duration, restarting capture if it is running
    pub fn change_audio_settings(
        &mut self,
        sample_rate: u32,
        frame_duration_ms: u32,
    ) -> std::result::Result<(), AudioError> {
        if sample_rate == 0 || frame_duration_ms == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{sample_rate} Hz / {frame_duration_ms} ms"
            )));
        }
        let config = CaptureConfig {
            sample_rate,
            frame_duration_ms,
            ..self.capture.config()
        };
        self.capture.set_config(config);
        self.pipeline.set_sample_rate(sample_rate);
        tracing::info!(sample_rate, frame_duration_ms, "Audio settings changed");
        self.restart_capture()
    }

    fn restart_capture(&mut self) -> std::result::Result<(), AudioError> {
        if !self.running {
            return Ok(());
        }
        self.capture.stop();
        if let Err(e) = self.capture.start(self.input_device.as_deref()) {
            self.set_talking(false);
            self.bus
                .publish(RelayEvent::error(ErrorKind::DeviceUnavailable, e.to_string()));
            return Err(e);
        }
        self.set_talking(true);
        Ok(())
    }

    fn set_talking(&mut self, talking: bool) {
        if self.talking != talking {
            self.talking = talking;
            self.bus.publish(RelayEvent::TalkingChanged(talking));
        }
    }

    pub fn list_microphones(&self) -> Vec<String> {
        self.capture.list_devices()
    }

    /// Ring the host's audio output sink should pull from
    pub fn playback_ring(&self) -> SharedPlaybackRing {
        self.pipeline.ring().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.bus.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn transport(&self) -> &RelayTransport {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Identifier of the running stream, for log correlation
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// True while the microphone is being captured, across reconnects
    pub fn is_talking(&self) -> bool {
        self.talking
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
