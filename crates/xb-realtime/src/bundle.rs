//! Channel Bundles
//!
//! A bundle is the atomic unit of audio storage: `frame_length` frames of
//! four lanes each, stored frame-major so that one frame of all four lanes
//! is contiguous.
//!
//! ```text
//! frame 0        frame 1        frame 2
//! [l0 l1 l2 l3] [l0 l1 l2 l3] [l0 l1 l2 l3] ...
//! ```

use xb_core::{BUNDLE_CHANNELS, Sample, XbError, XbResult};

/// Fixed-capacity four-lane sample buffer
#[derive(Debug)]
pub struct AudioChannelBundle {
    data: Box<[Sample]>,
    frame_length: usize,
    reserved: usize,
}

impl AudioChannelBundle {
    /// Allocate a zeroed bundle. Allocation failure maps to `NotEnoughMemory`.
    pub fn try_new(frame_length: usize) -> XbResult<Self> {
        if frame_length == 0 {
            return Err(XbError::InvalidParam("bundle frame length is zero".into()));
        }
        let len = frame_length
            .checked_mul(BUNDLE_CHANNELS)
            .ok_or(XbError::NotEnoughMemory)?;
        let mut data: Vec<Sample> = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0.0);

        Ok(Self {
            data: data.into_boxed_slice(),
            frame_length,
            reserved: 0,
        })
    }

    #[inline]
    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    #[inline]
    pub fn reserved_channels(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn free_channels(&self) -> usize {
        BUNDLE_CHANNELS - self.reserved
    }

    /// Reserve `count` lanes, returning the first reserved lane
    pub fn reserve(&mut self, count: usize) -> XbResult<usize> {
        if count == 0 || count > self.free_channels() {
            return Err(XbError::NoSpaceLeft(format!(
                "bundle has {} free lanes, {} requested",
                self.free_channels(),
                count
            )));
        }
        let first = self.reserved;
        self.reserved += count;
        Ok(first)
    }

    /// Give back the `count` most recently reserved lanes
    pub(crate) fn unreserve(&mut self, count: usize) {
        self.reserved = self.reserved.saturating_sub(count);
    }

    /// Zero all four lanes
    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    #[inline]
    pub fn data(&self) -> &[Sample] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [Sample] {
        &mut self.data
    }

    #[inline]
    pub fn sample(&self, frame: usize, lane: usize) -> Sample {
        self.data[frame * BUNDLE_CHANNELS + lane]
    }

    #[inline]
    pub fn set_sample(&mut self, frame: usize, lane: usize, value: Sample) {
        self.data[frame * BUNDLE_CHANNELS + lane] = value;
    }

    /// Copy one lane into `out` (up to `frame_length` samples)
    pub fn read_lane(&self, lane: usize, out: &mut [Sample]) {
        for (dst, frame) in out.iter_mut().zip(self.data.chunks_exact(BUNDLE_CHANNELS)) {
            *dst = frame[lane];
        }
    }

    /// Overwrite one lane from `input` (up to `frame_length` samples)
    pub fn write_lane(&mut self, lane: usize, input: &[Sample]) {
        for (src, frame) in input.iter().zip(self.data.chunks_exact_mut(BUNDLE_CHANNELS)) {
            frame[lane] = *src;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_is_zeroed() {
        let bundle = AudioChannelBundle::try_new(8).unwrap();
        assert_eq!(bundle.data().len(), 32);
        assert!(bundle.data().iter().all(|&s| s == 0.0));
        assert_eq!(bundle.free_channels(), 4);
    }

    #[test]
    fn test_reserve_until_full() {
        let mut bundle = AudioChannelBundle::try_new(4).unwrap();
        assert_eq!(bundle.reserve(1).unwrap(), 0);
        assert_eq!(bundle.reserve(2).unwrap(), 1);
        assert_eq!(bundle.free_channels(), 1);
        assert!(matches!(bundle.reserve(2), Err(XbError::NoSpaceLeft(_))));
        assert_eq!(bundle.reserve(1).unwrap(), 3);
        assert_eq!(bundle.free_channels(), 0);
    }

    #[test]
    fn test_lane_layout() {
        let mut bundle = AudioChannelBundle::try_new(3).unwrap();
        bundle.write_lane(2, &[1.0, 2.0, 3.0]);
        assert_eq!(bundle.data()[2], 1.0);
        assert_eq!(bundle.data()[6], 2.0);
        assert_eq!(bundle.data()[10], 3.0);

        let mut out = [0.0; 3];
        bundle.read_lane(2, &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0]);

        bundle.clear();
        assert_eq!(bundle.sample(1, 2), 0.0);
    }

    #[test]
    fn test_zero_frame_length_rejected() {
        assert!(matches!(
            AudioChannelBundle::try_new(0),
            Err(XbError::InvalidParam(_))
        ));
    }
}
