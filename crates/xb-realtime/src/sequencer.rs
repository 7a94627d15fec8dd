//! Bundle Sequencer
//!
//! Hands out lane ranges inside channel bundles. Bundles live in three
//! arenas, one per channel-count class, and are addressed by index:
//!
//! - mono streams only ever share bundles with other mono streams
//! - stereo streams only ever share bundles with other stereo streams
//! - streams with three or more channels are packed into the multichannel
//!   pool, splitting across bundles where needed
//!
//! Bundles are created on demand and live as long as the sequencer.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xb_core::{BUNDLE_CHANNELS, XbError, XbResult, bundles_for_channels};

use crate::bundle::AudioChannelBundle;

/// Channel-count class of a bundle arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BundlePool {
    Mono,
    Stereo,
    Multi,
}

impl BundlePool {
    pub const ALL: [BundlePool; 3] = [BundlePool::Mono, BundlePool::Stereo, BundlePool::Multi];

    /// Pool used for a stream with `channels` channels
    pub fn for_channels(channels: usize) -> Self {
        match channels {
            1 => BundlePool::Mono,
            2 => BundlePool::Stereo,
            _ => BundlePool::Multi,
        }
    }
}

/// A stream's lane range inside one bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAssignment {
    pub pool: BundlePool,
    pub bundle_index: usize,
    pub first_channel: usize,
    pub num_channels: usize,
}

/// Ordered assignments of one stream. Streams of up to eight channels stay inline.
pub type BundleAssignments = SmallVec<[BundleAssignment; 2]>;

/// Location of one stream channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneRef {
    pub pool: BundlePool,
    pub bundle_index: usize,
    pub lane: usize,
}

/// Expand assignments into one lane reference per channel
pub fn lanes_of(assignments: &[BundleAssignment]) -> Vec<LaneRef> {
    assignments
        .iter()
        .flat_map(|a| {
            (0..a.num_channels).map(move |c| LaneRef {
                pool: a.pool,
                bundle_index: a.bundle_index,
                lane: a.first_channel + c,
            })
        })
        .collect()
}

/// Bundle allocator with per-class pools
#[derive(Debug, Default)]
pub struct BundleSequencer {
    frame_length: Option<usize>,
    mono: Vec<AudioChannelBundle>,
    stereo: Vec<AudioChannelBundle>,
    multi: Vec<AudioChannelBundle>,
}

impl BundleSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_length(frame_length: usize) -> XbResult<Self> {
        let mut sequencer = Self::new();
        sequencer.set_frame_length(frame_length)?;
        Ok(sequencer)
    }

    /// Set the frame length. Only allowed while no bundle exists.
    pub fn set_frame_length(&mut self, frame_length: usize) -> XbResult<()> {
        if frame_length == 0 {
            return Err(XbError::InvalidParam("frame length is zero".into()));
        }
        if self.total_bundles() > 0 && self.frame_length != Some(frame_length) {
            return Err(XbError::Failed(
                "frame length cannot change once bundles exist".into(),
            ));
        }
        self.frame_length = Some(frame_length);
        Ok(())
    }

    pub fn frame_length(&self) -> Option<usize> {
        self.frame_length
    }

    pub fn num_bundles(&self, pool: BundlePool) -> usize {
        self.pool(pool).len()
    }

    pub fn total_bundles(&self) -> usize {
        self.mono.len() + self.stereo.len() + self.multi.len()
    }

    pub fn pool(&self, pool: BundlePool) -> &[AudioChannelBundle] {
        match pool {
            BundlePool::Mono => &self.mono,
            BundlePool::Stereo => &self.stereo,
            BundlePool::Multi => &self.multi,
        }
    }

    fn pool_mut(&mut self, pool: BundlePool) -> &mut Vec<AudioChannelBundle> {
        match pool {
            BundlePool::Mono => &mut self.mono,
            BundlePool::Stereo => &mut self.stereo,
            BundlePool::Multi => &mut self.multi,
        }
    }

    /// Bundle addressed by an assignment or lane reference.
    ///
    /// Indices handed out by this sequencer are always valid.
    #[inline]
    pub fn bundle(&self, pool: BundlePool, index: usize) -> &AudioChannelBundle {
        &self.pool(pool)[index]
    }

    #[inline]
    pub fn bundle_mut(&mut self, pool: BundlePool, index: usize) -> &mut AudioChannelBundle {
        &mut self.pool_mut(pool)[index]
    }

    #[inline]
    pub fn lane_sample(&self, lane: LaneRef, frame: usize) -> xb_core::Sample {
        self.bundle(lane.pool, lane.bundle_index).sample(frame, lane.lane)
    }

    #[inline]
    pub fn set_lane_sample(&mut self, lane: LaneRef, frame: usize, value: xb_core::Sample) {
        self.bundle_mut(lane.pool, lane.bundle_index)
            .set_sample(frame, lane.lane, value);
    }

    /// Reserve lanes for a stream of `number_channels` channels.
    ///
    /// On failure every reservation and bundle created by this call is rolled
    /// back, so no half-reserved bundle survives.
    pub fn get_bundle_assignments(&mut self, number_channels: usize) -> XbResult<BundleAssignments> {
        let Some(frame_length) = self.frame_length else {
            return Err(XbError::NotInitialized(
                "bundle sequencer frame length is not set".into(),
            ));
        };
        if number_channels == 0 {
            return Err(XbError::InvalidParam("stream has no channels".into()));
        }

        let pool_lengths = [self.mono.len(), self.stereo.len(), self.multi.len()];
        let mut assignments = BundleAssignments::new();

        let result = match number_channels {
            1 | 2 => self.assign_dedicated(frame_length, number_channels, &mut assignments),
            _ => self.assign_multichannel(frame_length, number_channels, &mut assignments),
        };

        if let Err(err) = result {
            self.rollback(&assignments, pool_lengths);
            return Err(err);
        }

        log::debug!(
            "assigned {} channel(s) to {} bundle(s): {:?}",
            number_channels,
            assignments.len(),
            assignments
                .iter()
                .map(|a| (a.pool, a.bundle_index, a.first_channel, a.num_channels))
                .collect::<Vec<_>>()
        );
        Ok(assignments)
    }

    /// First fit over the mono or stereo pool. Bundles are only released by
    /// rollback of the newest ones, so at most the last bundle has free lanes
    /// and first fit lands where a round-robin scan would.
    fn assign_dedicated(
        &mut self,
        frame_length: usize,
        channels: usize,
        assignments: &mut BundleAssignments,
    ) -> XbResult<()> {
        let pool = BundlePool::for_channels(channels);
        let existing = self
            .pool(pool)
            .iter()
            .position(|b| b.free_channels() >= channels);

        let bundle_index = match existing {
            Some(index) => index,
            None => self.push_bundle(pool, frame_length)?,
        };
        let first_channel = self.bundle_mut(pool, bundle_index).reserve(channels)?;
        assignments.push(BundleAssignment {
            pool,
            bundle_index,
            first_channel,
            num_channels: channels,
        });
        Ok(())
    }

    /// Pack into the multichannel pool, starting at its most recent bundle
    fn assign_multichannel(
        &mut self,
        frame_length: usize,
        channels: usize,
        assignments: &mut BundleAssignments,
    ) -> XbResult<()> {
        let pool = BundlePool::Multi;
        self.multi.try_reserve(bundles_for_channels(channels))?;
        let mut remaining = channels;

        while remaining > 0 {
            let current = self.multi.len().checked_sub(1);
            let free = current.map_or(0, |i| self.multi[i].free_channels());

            let (bundle_index, take) = match current {
                Some(index) if free >= remaining => (index, remaining),
                // A lone free lane is kept for a later stream.
                _ if free <= 1 => (self.push_bundle(pool, frame_length)?, remaining.min(BUNDLE_CHANNELS)),
                _ if remaining == BUNDLE_CHANNELS || remaining >= 2 * BUNDLE_CHANNELS => {
                    (self.push_bundle(pool, frame_length)?, remaining.min(BUNDLE_CHANNELS))
                }
                Some(index) => (index, free),
                None => (self.push_bundle(pool, frame_length)?, remaining.min(BUNDLE_CHANNELS)),
            };

            let first_channel = self.bundle_mut(pool, bundle_index).reserve(take)?;
            assignments.push(BundleAssignment {
                pool,
                bundle_index,
                first_channel,
                num_channels: take,
            });
            remaining -= take;
        }
        Ok(())
    }

    fn push_bundle(&mut self, pool: BundlePool, frame_length: usize) -> XbResult<usize> {
        let bundle = AudioChannelBundle::try_new(frame_length)?;
        let bundles = self.pool_mut(pool);
        bundles.try_reserve(1)?;
        bundles.push(bundle);
        Ok(bundles.len() - 1)
    }

    fn rollback(&mut self, assignments: &[BundleAssignment], pool_lengths: [usize; 3]) {
        for (pool, len) in BundlePool::ALL.into_iter().zip(pool_lengths) {
            for a in assignments.iter().filter(|a| a.pool == pool && a.bundle_index < len) {
                self.bundle_mut(pool, a.bundle_index).unreserve(a.num_channels);
            }
            self.pool_mut(pool).truncate(len);
        }
    }

    /// Zero the sample storage of every bundle in every pool
    pub fn clear_all_bundle_buffers(&mut self) {
        for bundle in self
            .mono
            .iter_mut()
            .chain(self.stereo.iter_mut())
            .chain(self.multi.iter_mut())
        {
            bundle.clear();
        }
    }
}
