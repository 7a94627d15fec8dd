//! External audio frames
//!
//! Non-interleaved buffers exchanged between an audio chain and whoever
//! drives it. Input streams read their period from one, output streams copy
//! their result into one.

use xb_core::Sample;

/// One period of non-interleaved audio plus the stream identifier
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    channels: Vec<Vec<Sample>>,
    frame_length: usize,
    sid: u32,
}

impl AudioFrame {
    pub fn new(num_channels: usize, frame_length: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frame_length]; num_channels],
            frame_length,
            sid: 0,
        }
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.channels[index]
    }

    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<Sample>] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Vec<Sample>] {
        &mut self.channels
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn set_sid(&mut self, sid: u32) {
        self.sid = sid;
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
        self.sid = 0;
    }

    /// Fill from an interleaved buffer with the same channel count
    pub fn deinterleave_from(&mut self, interleaved: &[Sample]) {
        let num_channels = self.num_channels();
        if num_channels == 0 {
            return;
        }
        for (frame, samples) in interleaved
            .chunks_exact(num_channels)
            .take(self.frame_length)
            .enumerate()
        {
            for (channel, &sample) in self.channels.iter_mut().zip(samples) {
                channel[frame] = sample;
            }
        }
    }
}
