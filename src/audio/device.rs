//! Audio device enumeration and the cpal-backed microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::capture::{CaptureHandle, MicrophoneDevice};
use crate::error::AudioError;

/// Description of an audio device
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let channels = device
                    .supported_input_configs()
                    .map(collect_channels)
                    .unwrap_or_default();
                devices.push(AudioDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let channels = device
                    .supported_output_configs()
                    .map(collect_channels)
                    .unwrap_or_default();
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    channels,
                });
            }
        }
    }

    devices
}

fn collect_channels(configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>) -> Vec<u16> {
    let mut channels: Vec<u16> = configs.map(|c| c.channels()).collect();
    channels.sort_unstable();
    channels.dedup();
    channels
}

/// Names of the available input devices, default device first
pub fn input_device_names() -> Vec<String> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut names: Vec<String> = host
        .input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default();

    if let Some(default_name) = default_name {
        if let Some(pos) = names.iter().position(|n| *n == default_name) {
            let name = names.remove(pos);
            names.insert(0, name);
        }
    }
    names
}

/// Find an input device by name
pub fn find_input_device(name: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let devices = host.input_devices()?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceUnavailable(name.to_string()))
}

/// Get the default output device
pub fn default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("No default output device".to_string()))
}

/// Circular recording buffer shared with the cpal input callback
struct LoopBuffer {
    samples: Vec<f32>,
    position: usize,
    looping: bool,
    full: bool,
}

impl LoopBuffer {
    fn push_frames(&mut self, data: &[f32], channels: usize) {
        let len = self.samples.len();
        for frame in data.chunks(channels) {
            if self.full {
                return;
            }
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.samples[self.position] = mono;
            self.position += 1;
            if self.position == len {
                self.position = 0;
                self.full = !self.looping;
            }
        }
    }
}

struct ActiveCapture {
    handle: CaptureHandle,
    buffer: Arc<Mutex<LoopBuffer>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

/// Microphone backed by a cpal input stream.
///
/// The cpal stream lives on a dedicated thread for the duration of a
/// capture and records mono audio into a looping buffer.
#[derive(Default)]
pub struct CpalMicrophone {
    active: Option<ActiveCapture>,
    next_handle: u64,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self, handle: CaptureHandle) -> Option<&ActiveCapture> {
        self.active.as_ref().filter(|a| a.handle == handle)
    }
}

impl MicrophoneDevice for CpalMicrophone {
    fn list_devices(&self) -> Vec<String> {
        input_device_names()
    }

    fn start_capture(
        &mut self,
        device: &str,
        looping: bool,
        max_duration_secs: u32,
        sample_rate: u32,
    ) -> Result<CaptureHandle, AudioError> {
        if let Some(active) = self.active.as_ref() {
            let handle = active.handle;
            self.end_capture(handle);
        }

        let cpal_device = find_input_device(device)?;
        let default_config = cpal_device.default_input_config()?;
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels.max(1) as usize;

        let buffer = Arc::new(Mutex::new(LoopBuffer {
            samples: vec![0.0; (max_duration_secs.max(1) * sample_rate) as usize],
            position: 0,
            looping,
            full: false,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let thread_buffer = buffer.clone();
        let thread_running = running.clone();
        let name = device.to_string();

        let thread = thread::Builder::new()
            .name("microphone".into())
            .spawn(move || {
                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        thread_buffer.lock().push_frames(data, channels);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while capturing
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamError(format!("capture thread for {name} exited")));
            }
        }

        self.next_handle += 1;
        let handle = CaptureHandle(self.next_handle);
        tracing::debug!(device = %name, sample_rate, channels, "cpal input stream running");

        self.active = Some(ActiveCapture {
            handle,
            buffer,
            running,
            thread: Some(thread),
            error_rx,
        });
        Ok(handle)
    }

    fn position(&self, handle: CaptureHandle) -> usize {
        self.active(handle).map(|a| a.buffer.lock().position).unwrap_or(0)
    }

    fn buffer_len(&self, handle: CaptureHandle) -> usize {
        self.active(handle).map(|a| a.buffer.lock().samples.len()).unwrap_or(0)
    }

    fn read_data(&self, handle: CaptureHandle, dest: &mut [f32], offset: usize) -> Result<(), AudioError> {
        let active = self
            .active(handle)
            .ok_or_else(|| AudioError::StreamError("capture is not active".to_string()))?;
        let buffer = active.buffer.lock();
        let len = buffer.samples.len();
        for (i, slot) in dest.iter_mut().enumerate() {
            *slot = buffer.samples[(offset + i) % len];
        }
        Ok(())
    }

    fn take_error(&self, handle: CaptureHandle) -> Option<AudioError> {
        let err = self.active(handle)?.error_rx.try_recv().ok()?;
        Some(AudioError::DeviceUnavailable(err.to_string()))
    }

    fn end_capture(&mut self, handle: CaptureHandle) {
        if self.active.as_ref().map(|a| a.handle) != Some(handle) {
            return;
        }
        if let Some(mut active) = self.active.take() {
            active.running.store(false, Ordering::SeqCst);
            if let Some(thread) = active.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        if let Some(handle) = self.active.as_ref().map(|a| a.handle) {
            self.end_capture(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_buffer_downmix_and_wrap() {
        let mut buffer = LoopBuffer {
            samples: vec![0.0; 3],
            position: 0,
            looping: true,
            full: false,
        };
        buffer.push_frames(&[0.2, 0.4, 0.6, 0.8], 2);
        assert_eq!(buffer.position, 2);
        assert!((buffer.samples[0] - 0.3).abs() < 1e-6);
        assert!((buffer.samples[1] - 0.7).abs() < 1e-6);

        buffer.push_frames(&[0.1, 0.1, 0.5, 0.5], 2);
        assert_eq!(buffer.position, 1);
        assert!((buffer.samples[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_loop_buffer_stops_when_not_looping() {
        let mut buffer = LoopBuffer {
            samples: vec![0.0; 2],
            position: 0,
            looping: false,
            full: false,
        };
        buffer.push_frames(&[0.1, 0.2, 0.3], 1);
        assert!(buffer.full);
        assert_eq!(buffer.samples, vec![0.1, 0.2]);
    }

    #[test]
    fn test_device_listing() {
        // May be empty on machines without audio hardware
        let devices = list_devices();
        assert!(devices.iter().all(|d| d.is_input || d.is_output));
        assert!(find_input_device("definitely-not-a-real-device").is_err());
    }
}
