//! Tick-driven microphone capture
//!
//! The device records continuously into a looping buffer. On every tick the
//! capture source looks at the device's write position and cuts whatever
//! accumulated since the previous tick into fixed-duration frames. Nothing
//! here blocks or spawns threads; the caller's tick source is the clock.

use crate::audio::buffer::AudioFrame;
use crate::error::AudioError;

/// Opaque handle to one open device capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureHandle(pub u64);

/// Input device interface consumed by [`CaptureSource`].
///
/// A capture records into a circular buffer of `buffer_len` samples;
/// `position` is the index the device will write next.
pub trait MicrophoneDevice: Send {
    /// Names of the available input devices
    fn list_devices(&self) -> Vec<String>;

    /// Open `device` and start recording mono audio into a buffer of
    /// `max_duration_secs` seconds, wrapping when `looping` is set
    fn start_capture(
        &mut self,
        device: &str,
        looping: bool,
        max_duration_secs: u32,
        sample_rate: u32,
    ) -> Result<CaptureHandle, AudioError>;

    /// Current write position inside the circular buffer
    fn position(&self, handle: CaptureHandle) -> usize;

    /// Length of the circular buffer in samples
    fn buffer_len(&self, handle: CaptureHandle) -> usize;

    /// Copy `dest.len()` samples starting at `offset`
    fn read_data(&self, handle: CaptureHandle, dest: &mut [f32], offset: usize) -> Result<(), AudioError>;

    /// Failure reported by the device since the last call, e.g. unplugged
    fn take_error(&self, handle: CaptureHandle) -> Option<AudioError>;

    /// Stop recording and release the device
    fn end_capture(&mut self, handle: CaptureHandle);
}

/// Frame cadence configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    /// Length of the device's looping buffer
    pub buffer_seconds: u32,
}

impl CaptureConfig {
    /// `round(sample_rate * frame_duration_ms / 1000)`, at least one sample
    pub fn samples_per_frame(&self) -> usize {
        let scaled = self.sample_rate as u64 * self.frame_duration_ms as u64;
        (((scaled + 500) / 1000) as usize).max(1)
    }
}

/// One open capture
#[derive(Debug)]
struct CaptureSession {
    handle: CaptureHandle,
    device: String,
    buffer_len: usize,
    /// Last consumed sample position
    cursor: usize,
    sequence: u64,
}

/// Turns a continuously-recording device buffer into fixed-size frames
pub struct CaptureSource {
    device: Box<dyn MicrophoneDevice>,
    config: CaptureConfig,
    samples_per_frame: usize,
    session: Option<CaptureSession>,
    /// Set when the device failed under a running session
    lost: Option<AudioError>,
    frames_emitted: u64,
}

impl CaptureSource {
    pub fn new(device: Box<dyn MicrophoneDevice>, config: CaptureConfig) -> Self {
        Self {
            device,
            samples_per_frame: config.samples_per_frame(),
            config,
            session: None,
            lost: None,
            frames_emitted: 0,
        }
    }

    /// Start capturing from `device_name`, or from the first listed device.
    ///
    /// Fails with [`AudioError::DeviceUnavailable`] when there is no input
    /// device (or the named one is missing); capture is not started then.
    pub fn start(&mut self, device_name: Option<&str>) -> Result<(), AudioError> {
        if self.session.is_some() {
            return Ok(());
        }

        let devices = self.device.list_devices();
        let name = match device_name {
            Some(name) if devices.iter().any(|d| d == name) => name.to_string(),
            Some(name) => return Err(AudioError::DeviceUnavailable(name.to_string())),
            None => devices
                .first()
                .cloned()
                .ok_or_else(|| AudioError::DeviceUnavailable("no input device".to_string()))?,
        };

        let handle = self.device.start_capture(
            &name,
            true,
            self.config.buffer_seconds,
            self.config.sample_rate,
        )?;

        let buffer_len = self.device.buffer_len(handle);
        if buffer_len == 0 {
            self.device.end_capture(handle);
            return Err(AudioError::StreamError(format!("device {name} reported an empty buffer")));
        }

        tracing::info!(
            device = %name,
            sample_rate = self.config.sample_rate,
            samples_per_frame = self.samples_per_frame,
            buffer_len,
            "Capture started"
        );

        self.lost = None;
        self.session = Some(CaptureSession {
            handle,
            device: name,
            buffer_len,
            cursor: 0,
            sequence: 0,
        });
        Ok(())
    }

    /// Emit every frame that became available since the last tick.
    ///
    /// Full frames only, except that the tail of the device buffer is
    /// flushed as one shorter frame when the device wraps around. A device
    /// failure ends the session; see [`CaptureSource::take_device_error`].
    pub fn on_tick(&mut self) -> Vec<AudioFrame> {
        let Some(handle) = self.session.as_ref().map(|s| s.handle) else {
            return Vec::new();
        };
        if let Some(error) = self.device.take_error(handle) {
            self.lose_device(error);
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        let position = self.device.position(session.handle).min(session.buffer_len);

        if position < session.cursor {
            let tail = session.buffer_len - session.cursor;
            if tail > 0 {
                match read_frame(self.device.as_ref(), session, tail, self.config.sample_rate) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => {
                        tracing::warn!("Failed to read capture tail: {}", e);
                        return frames;
                    }
                }
            }
            session.cursor = 0;
        }

        while position - session.cursor >= self.samples_per_frame {
            match read_frame(
                self.device.as_ref(),
                session,
                self.samples_per_frame,
                self.config.sample_rate,
            ) {
                Ok(frame) => {
                    frames.push(frame);
                    session.cursor += self.samples_per_frame;
                }
                Err(e) => {
                    tracing::warn!("Failed to read capture frame: {}", e);
                    break;
                }
            }
        }

        self.frames_emitted += frames.len() as u64;
        frames
    }

    /// Stop capturing. Samples not yet cut into a frame are discarded.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            let pending = self
                .device
                .position(session.handle)
                .saturating_sub(session.cursor);
            self.device.end_capture(session.handle);
            tracing::info!(
                device = %session.device,
                frames = session.sequence,
                discarded = pending,
                "Capture stopped"
            );
        }
    }

    fn lose_device(&mut self, error: AudioError) {
        if let Some(session) = self.session.take() {
            self.device.end_capture(session.handle);
            tracing::error!(
                device = %session.device,
                frames = session.sequence,
                "Capture device lost: {}",
                error
            );
        }
        self.lost = Some(error);
    }

    /// The device failure that ended the last session, if any
    pub fn take_device_error(&mut self) -> Option<AudioError> {
        self.lost.take()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Name of the device being captured, if running
    pub fn device_name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.device.as_str())
    }

    pub fn list_devices(&self) -> Vec<String> {
        self.device.list_devices()
    }

    pub fn config(&self) -> CaptureConfig {
        self.config
    }

    /// Replace the frame cadence. Takes effect on the next `start`.
    pub fn set_config(&mut self, config: CaptureConfig) {
        self.config = config;
        self.samples_per_frame = config.samples_per_frame();
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Total frames emitted over the lifetime of this source
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_frame(
    device: &dyn MicrophoneDevice,
    session: &mut CaptureSession,
    len: usize,
    sample_rate: u32,
) -> Result<AudioFrame, AudioError> {
    let mut samples = vec![0.0f32; len];
    device.read_data(session.handle, &mut samples, session.cursor)?;
    let frame = AudioFrame::new(samples, sample_rate, session.sequence);
    session.sequence += 1;
    Ok(frame)
}
