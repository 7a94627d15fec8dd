//! Sample types and bundle geometry

/// Type alias for audio samples
pub type Sample = f32;

/// Number of lanes in a channel bundle
pub const BUNDLE_CHANNELS: usize = 4;

/// Number of bundles needed to hold `channels` lanes, ignoring packing
#[inline]
pub const fn bundles_for_channels(channels: usize) -> usize {
    channels.div_ceil(BUNDLE_CHANNELS)
}

/// Clear a sample slice
#[inline]
pub fn clear(samples: &mut [Sample]) {
    samples.fill(0.0);
}

/// Add `src` scaled by `gain` into `dst`
#[inline]
pub fn mix_add(dst: &mut [Sample], src: &[Sample], gain: Sample) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s * gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundles_for_channels() {
        assert_eq!(bundles_for_channels(1), 1);
        assert_eq!(bundles_for_channels(4), 1);
        assert_eq!(bundles_for_channels(5), 2);
        assert_eq!(bundles_for_channels(8), 2);
    }

    #[test]
    fn test_mix_add() {
        let mut dst = vec![1.0; 4];
        mix_add(&mut dst, &[1.0, 2.0, 3.0, 4.0], 0.5);
        assert_eq!(dst, vec![1.5, 2.0, 2.5, 3.0]);
    }
}
