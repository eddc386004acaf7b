//! In-memory microphone for tests

use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::capture::{CaptureHandle, MicrophoneDevice};
use crate::error::AudioError;

#[derive(Default)]
struct State {
    devices: Vec<String>,
    buffer: Vec<f32>,
    position: usize,
    written: u64,
    handle: Option<CaptureHandle>,
    next_handle: u64,
    error: Option<AudioError>,
}

/// Scripted device: tests push samples with [`FakeMicrophone::advance`]
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<State>>,
}

impl FakeMicrophone {
    pub fn new(devices: &[&str]) -> Self {
        let state = State {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Simulate the device recording `samples` more samples
    pub fn advance(&self, samples: usize) {
        let mut state = self.state.lock();
        let len = state.buffer.len();
        if len == 0 {
            return;
        }
        for _ in 0..samples {
            let value = ((state.written % 20_000) as f32 + 1.0) / 32_768.0;
            let pos = state.position;
            state.buffer[pos] = value;
            state.position = (pos + 1) % len;
            state.written += 1;
        }
    }

    /// Current device buffer contents at `[offset, offset + len)`
    pub fn expected(&self, offset: usize, len: usize) -> Vec<f32> {
        self.state.lock().buffer[offset..offset + len].to_vec()
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Simulate the device disappearing mid-capture
    pub fn fail(&self) {
        self.state.lock().error = Some(AudioError::DeviceUnavailable("device unplugged".to_string()));
    }

    pub fn set_devices(&self, devices: &[&str]) {
        self.state.lock().devices = devices.iter().map(|d| d.to_string()).collect();
    }
}

impl MicrophoneDevice for FakeMicrophone {
    fn list_devices(&self) -> Vec<String> {
        self.state.lock().devices.clone()
    }

    fn start_capture(
        &mut self,
        device: &str,
        _looping: bool,
        max_duration_secs: u32,
        sample_rate: u32,
    ) -> Result<CaptureHandle, AudioError> {
        let mut state = self.state.lock();
        if !state.devices.iter().any(|d| d == device) {
            return Err(AudioError::DeviceUnavailable(device.to_string()));
        }
        state.next_handle += 1;
        let handle = CaptureHandle(state.next_handle);
        state.buffer = vec![0.0; (max_duration_secs * sample_rate) as usize];
        state.position = 0;
        state.written = 0;
        state.handle = Some(handle);
        state.error = None;
        Ok(handle)
    }

    fn position(&self, _handle: CaptureHandle) -> usize {
        self.state.lock().position
    }

    fn buffer_len(&self, _handle: CaptureHandle) -> usize {
        self.state.lock().buffer.len()
    }

    fn read_data(&self, _handle: CaptureHandle, dest: &mut [f32], offset: usize) -> Result<(), AudioError> {
        let state = self.state.lock();
        let end = offset + dest.len();
        if end > state.buffer.len() {
            return Err(AudioError::StreamError(format!("read past end: {end}")));
        }
        dest.copy_from_slice(&state.buffer[offset..end]);
        Ok(())
    }

    fn take_error(&self, _handle: CaptureHandle) -> Option<AudioError> {
        self.state.lock().error.take()
    }

    fn end_capture(&mut self, _handle: CaptureHandle) {
        self.state.lock().handle = None;
    }
}
