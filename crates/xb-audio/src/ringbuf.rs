//! Source Ring Buffer
//!
//! Interleaved multi-channel ring written by one producer (the source
//! device) and read by up to [`MAX_READERS`] registered readers (switch
//! matrix connections and dummy drains).
//!
//! CRITICAL: neither side ever blocks. The producer's free space is bounded
//! by the slowest registered reader, so a reader never sees overwritten data.
//! With no reader registered the ring fills up and further writes are
//! refused.

use std::sync::Arc;

use portable_atomic::{AtomicF32, AtomicU64, Ordering};
use xb_core::{Sample, XbError, XbResult};
use xb_realtime::AudioFrame;

/// Maximum number of readers registered on one ring
pub const MAX_READERS: usize = 8;

const NO_READER: u64 = u64::MAX;

// ═══════════════════════════════════════════════════════════════════════════════
// MULTI-READER SOURCE RING
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SourceRingBuffer {
    num_channels: usize,
    /// Capacity in frames (power of 2)
    capacity: usize,
    mask: usize,
    data: Box<[AtomicF32]>,
    /// Frames written since creation (only modified by the producer)
    write_pos: AtomicU64,
    /// Read position that bounds the producer while no reader is registered
    floor: AtomicU64,
    readers: [AtomicU64; MAX_READERS],
}

impl std::fmt::Debug for SourceRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRingBuffer")
            .field("num_channels", &self.num_channels)
            .field("capacity", &self.capacity)
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("readers", &self.reader_count())
            .finish()
    }
}

impl SourceRingBuffer {
    /// Create a ring holding at least `min_frames` frames (rounded up to a power of 2)
    pub fn new(num_channels: usize, min_frames: usize) -> XbResult<Self> {
        if num_channels == 0 || min_frames == 0 {
            return Err(XbError::InvalidParam("ring buffer needs channels and frames".into()));
        }
        let capacity = min_frames.next_power_of_two();
        let mut data = Vec::new();
        data.try_reserve_exact(capacity * num_channels)?;
        data.extend((0..capacity * num_channels).map(|_| AtomicF32::new(0.0)));

        Ok(Self {
            num_channels,
            capacity,
            mask: capacity - 1,
            data: data.into_boxed_slice(),
            write_pos: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            readers: std::array::from_fn(|_| AtomicU64::new(NO_READER)),
        })
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Capacity in frames
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reader_count(&self) -> usize {
        self.readers
            .iter()
            .filter(|r| r.load(Ordering::Relaxed) != NO_READER)
            .count()
    }

    fn slowest_reader(&self) -> u64 {
        self.readers
            .iter()
            .map(|r| r.load(Ordering::Acquire))
            .filter(|&p| p != NO_READER)
            .min()
            .unwrap_or_else(|| self.floor.load(Ordering::Acquire))
    }

    /// Frames the producer can write without overtaking a reader
    #[inline]
    pub fn available_write(&self) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let used = write.saturating_sub(self.slowest_reader()) as usize;
        self.capacity.saturating_sub(used)
    }

    /// Push interleaved frames (producer side).
    ///
    /// Returns the number of frames actually written.
    pub fn write(&self, interleaved: &[Sample]) -> usize {
        let frames = (interleaved.len() / self.num_channels).min(self.available_write());
        if frames == 0 {
            return 0;
        }

        let write = self.write_pos.load(Ordering::Relaxed);
        for (f, frame) in interleaved.chunks_exact(self.num_channels).take(frames).enumerate() {
            let base = ((write as usize + f) & self.mask) * self.num_channels;
            for (ch, &sample) in frame.iter().enumerate() {
                self.data[base + ch].store(sample, Ordering::Relaxed);
            }
        }

        self.write_pos.store(write + frames as u64, Ordering::Release);
        frames
    }

    /// Register a reader starting at the current write position
    pub fn connect_reader(self: &Arc<Self>) -> XbResult<RingReader> {
        let start = self.write_pos.load(Ordering::Acquire);
        for (slot, reader) in self.readers.iter().enumerate() {
            if reader
                .compare_exchange(NO_READER, start, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(RingReader {
                    ring: Arc::clone(self),
                    slot,
                    position: start,
                });
            }
        }
        Err(XbError::NoSpaceLeft(format!(
            "all {} reader slots of the source ring are taken",
            MAX_READERS
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// READER
// ═══════════════════════════════════════════════════════════════════════════════

/// Registered read cursor; deregisters on drop
pub struct RingReader {
    ring: Arc<SourceRingBuffer>,
    slot: usize,
    position: u64,
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("slot", &self.slot)
            .field("position", &self.position)
            .finish()
    }
}

impl RingReader {
    pub fn num_channels(&self) -> usize {
        self.ring.num_channels
    }

    /// Frames ready to be read
    #[inline]
    pub fn available(&self) -> usize {
        let write = self.ring.write_pos.load(Ordering::Acquire);
        write.saturating_sub(self.position) as usize
    }

    /// Add up to `frames` frames into `dst`, returning how many were available
    pub fn mix_into(&mut self, dst: &mut AudioFrame, frames: usize) -> usize {
        let count = frames.min(self.available()).min(dst.frame_length());
        let ring = &self.ring;
        let channels = ring.num_channels.min(dst.num_channels());

        for ch in 0..channels {
            let out = dst.channel_mut(ch);
            for (f, sample) in out.iter_mut().take(count).enumerate() {
                let index = ((self.position as usize + f) & ring.mask) * ring.num_channels + ch;
                *sample += ring.data[index].load(Ordering::Relaxed);
            }
        }

        self.advance(count);
        count
    }

    /// Pop up to `out.len() / channels` interleaved frames
    pub fn read_interleaved(&mut self, out: &mut [Sample]) -> usize {
        let nch = self.ring.num_channels;
        let count = (out.len() / nch).min(self.available());
        for f in 0..count {
            let base = ((self.position as usize + f) & self.ring.mask) * nch;
            for ch in 0..nch {
                out[f * nch + ch] = self.ring.data[base + ch].load(Ordering::Relaxed);
            }
        }
        self.advance(count);
        count
    }

    /// Discard up to `frames` frames
    pub fn skip(&mut self, frames: usize) -> usize {
        let count = frames.min(self.available());
        self.advance(count);
        count
    }

    /// Discard everything available
    pub fn skip_available(&mut self) -> usize {
        self.skip(usize::MAX)
    }

    #[inline]
    fn advance(&mut self, frames: usize) {
        if frames > 0 {
            self.position += frames as u64;
            self.ring.readers[self.slot].store(self.position, Ordering::Release);
        }
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.ring.readers[self.slot].store(NO_READER, Ordering::Release);
        if self.ring.reader_count() == 0 {
            self.ring.floor.store(self.position, Ordering::Release);
        }
    }
}
