//! Audio frames and the lock-free playback ring
//!
//! The playback ring is a single-producer single-consumer (SPSC) circular
//! buffer of mono samples. The network clock writes decoded audio into it and
//! the playback clock pulls from it at the hardware's pace.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec;

/// One fixed-duration unit of captured mono audio
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Normalized samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame sequence number, increasing within a capture session
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Size of this frame on the wire. Always even.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * codec::BYTES_PER_SAMPLE
    }

    /// Frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000_000) / self.sample_rate as u64
    }

    /// Encode to the PCM16 wire format
    pub fn to_pcm16(&self) -> Vec<u8> {
        codec::encode(&self.samples)
    }
}

/// Lock-free SPSC ring of mono samples with overwrite-oldest semantics.
///
/// Cursors are monotonically increasing sample positions; the slot for
/// position `p` is `p % capacity`. The ring holds at most `capacity` unread
/// samples. `write` must only be called from one thread at a time and
/// `read`/`read_into` from one (other) thread at a time.
pub struct PlaybackRing {
    slots: Box<[AtomicU32]>,
    capacity: usize,
    /// Next position the writer fills
    write_pos: CachePadded<AtomicU64>,
    /// Next position the reader consumes. The writer may push it forward on overrun.
    read_pos: CachePadded<AtomicU64>,
    overrun_count: AtomicUsize,
    dropped_samples: AtomicU64,
    underrun_count: AtomicUsize,
}

impl PlaybackRing {
    /// Create a ring holding `capacity` samples. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity,
            write_pos: CachePadded::new(AtomicU64::new(0)),
            read_pos: CachePadded::new(AtomicU64::new(0)),
            overrun_count: AtomicUsize::new(0),
            dropped_samples: AtomicU64::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Ring sized for `seconds` of audio at `sample_rate`
    pub fn with_duration(sample_rate: u32, seconds: f32) -> Self {
        Self::new((sample_rate as f32 * seconds).round() as usize)
    }

    /// Append samples at the write cursor.
    ///
    /// When the write would overtake the reader, the oldest unread samples
    /// are dropped so that exactly the newest `capacity` samples remain. A
    /// single write longer than the capacity keeps only its tail.
    ///
    /// Returns the number of unread samples that were dropped.
    pub fn write(&self, samples: &[f32]) -> u64 {
        if samples.is_empty() {
            return 0;
        }

        let cap = self.capacity as u64;
        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let start = self.write_pos.load(Ordering::Relaxed);
        let end = start + samples.len() as u64;

        // Move the reader out of the way before touching any slot it may be copying
        let floor = end.saturating_sub(cap);
        let previous = self.read_pos.fetch_max(floor, Ordering::AcqRel);
        let dropped = floor.saturating_sub(previous);
        if dropped > 0 {
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
            self.dropped_samples.fetch_add(dropped, Ordering::Relaxed);
        }

        for (offset, &sample) in samples.iter().enumerate() {
            let index = ((start + offset as u64) % cap) as usize;
            self.slots[index].store(sample.to_bits(), Ordering::Relaxed);
        }

        self.write_pos.store(end, Ordering::Release);
        dropped
    }

    /// Fill `out` from the read cursor. Positions not yet written are
    /// rendered as silence and do not advance the cursor.
    ///
    /// Returns the number of real (non-silence) samples copied. Never
    /// allocates, blocks or logs, so it is safe on a real-time audio callback.
    pub fn read_into(&self, out: &mut [f32]) -> usize {
        let cap = self.capacity as u64;

        let copied = loop {
            let start = self.read_pos.load(Ordering::Acquire);
            let end = self.write_pos.load(Ordering::Acquire);
            let available = end.saturating_sub(start).min(cap);
            let count = available.min(out.len() as u64) as usize;

            for (offset, slot) in out[..count].iter_mut().enumerate() {
                let index = ((start + offset as u64) % cap) as usize;
                *slot = f32::from_bits(self.slots[index].load(Ordering::Relaxed));
            }

            // A failed exchange means the writer lapped us mid-copy
            if self
                .read_pos
                .compare_exchange(start, start + count as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break count;
            }
        };

        if copied < out.len() {
            out[copied..].fill(0.0);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }

        copied
    }

    /// Read `count` samples, padding with silence
    pub fn read(&self, count: usize) -> Vec<f32> {
        let mut out = vec![0.0; count];
        self.read_into(&mut out);
        out
    }

    /// Discard everything currently buffered. Reader side.
    pub fn clear(&self) {
        let end = self.write_pos.load(Ordering::Acquire);
        self.read_pos.fetch_max(end, Ordering::AcqRel);
    }

    /// Unread samples currently buffered
    pub fn len(&self) -> usize {
        let end = self.write_pos.load(Ordering::Acquire);
        let start = self.read_pos.load(Ordering::Acquire);
        end.saturating_sub(start).min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity as f32
    }

    /// Number of writes that dropped unread samples
    pub fn overrun_count(&self) -> usize {
        self.overrun_count.load(Ordering::Relaxed)
    }

    /// Total unread samples dropped by overruns
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    /// Number of reads that had to be padded with silence
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.overrun_count.store(0, Ordering::Relaxed);
        self.dropped_samples.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            buffered: self.len(),
            capacity: self.capacity,
            overruns: self.overrun_count(),
            dropped_samples: self.dropped_samples(),
            underruns: self.underrun_count(),
        }
    }
}

/// Playback ring statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub buffered: usize,
    pub capacity: usize,
    pub overruns: usize,
    pub dropped_samples: u64,
    pub underruns: usize,
}

/// Thread-safe handle to a playback ring
pub type SharedPlaybackRing = Arc<PlaybackRing>;

/// Create a new shared playback ring
pub fn create_shared_ring(capacity: usize) -> SharedPlaybackRing {
    Arc::new(PlaybackRing::new(capacity))
}
