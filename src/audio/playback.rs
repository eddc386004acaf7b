//! Audio output sink pulling from the playback ring
//!
//! The cpal output callback is the playback clock: it asks for a block of
//! samples and gets whatever the ring holds, padded with silence.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::SharedPlaybackRing;
use crate::audio::device::default_output_device;
use crate::error::AudioError;

/// Mono scratch size used by the output callback
const SCRATCH_SAMPLES: usize = 4096;

/// Copy mono samples from `ring` into an interleaved output block,
/// duplicating each sample across `channels`.
///
/// `scratch` must be non-empty; the block is processed in scratch-sized pieces.
pub fn render_interleaved(ring: &SharedPlaybackRing, out: &mut [f32], channels: usize, scratch: &mut [f32]) {
    let channels = channels.max(1);
    for block in out.chunks_mut(scratch.len() * channels) {
        let frames = block.len() / channels;
        let mono = &mut scratch[..frames];
        ring.read_into(mono);
        for (frame, &sample) in block.chunks_mut(channels).zip(mono.iter()) {
            frame.fill(sample);
        }
    }
}

/// Plays the contents of a playback ring on an output device
pub struct AudioPlayback {
    ring: SharedPlaybackRing,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl AudioPlayback {
    pub fn new(ring: SharedPlaybackRing, sample_rate: u32) -> Self {
        Self {
            ring,
            sample_rate,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        }
    }

    /// Open the default output device and start pulling from the ring
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = default_output_device()?;
        let default_config = device.default_output_config()?;
        let config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let channels = config.channels as usize;

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let ring = self.ring.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let mut scratch = vec![0.0f32; SCRATCH_SAMPLES];
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        render_interleaved(&ring, data, channels, &mut scratch);
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

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread exited".to_string())));
        if let Err(e) = started {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(sample_rate = self.sample_rate, channels, "Playback started");
        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Playback stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_ring;

    #[test]
    fn test_render_duplicates_channels() {
        let ring = create_shared_ring(16);
        ring.write(&[0.1, 0.2, 0.3]);

        let mut out = [9.0f32; 8];
        let mut scratch = [0.0f32; 4];
        render_interleaved(&ring, &mut out, 2, &mut scratch);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.0, 0.0]);
    }

    #[test]
    fn test_render_in_scratch_sized_pieces() {
        let ring = create_shared_ring(64);
        let data: Vec<f32> = (1..=10).map(|v| v as f32 / 10.0).collect();
        ring.write(&data);

        let mut out = [0.0f32; 10];
        let mut scratch = [0.0f32; 3];
        render_interleaved(&ring, &mut out, 1, &mut scratch);
        assert_eq!(out.to_vec(), data);
        assert!(ring.is_empty());
    }
}
