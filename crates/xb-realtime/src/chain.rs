//! Audio Chain
//!
//! The frozen, executable form of a pipeline. Built by
//! `Pipeline::init_audio_chain`; runs its modules in topological order once
//! per period.

use xb_core::{Sample, XbError, XbResult};

use crate::frame::AudioFrame;
use crate::module::{ModuleCore, ModuleHandle, ModuleState};
use crate::pipeline::{ModuleId, PinId};
use crate::sequencer::BundleSequencer;
use crate::stream::{AudioStream, StreamDescriptor, StreamId};

// ═══════════════════════════════════════════════════════════════════════════════
// STREAM SET
// ═══════════════════════════════════════════════════════════════════════════════

/// All streams of one chain plus the bundles backing them
#[derive(Debug)]
pub struct StreamSet {
    bundles: BundleSequencer,
    streams: Vec<AudioStream>,
    frame_length: usize,
}

impl StreamSet {
    /// Create streams in id order, assigning bundles to each.
    ///
    /// Descriptor ids must be `0..n` in order.
    pub fn from_descriptors(frame_length: usize, descriptors: Vec<StreamDescriptor>) -> XbResult<Self> {
        let mut bundles = BundleSequencer::with_frame_length(frame_length)?;
        let mut streams = Vec::new();
        streams.try_reserve_exact(descriptors.len())?;

        for (index, desc) in descriptors.into_iter().enumerate() {
            if desc.id.index() != index {
                return Err(XbError::InvalidParam(format!(
                    "stream '{}' has id {} at position {}",
                    desc.name, desc.id, index
                )));
            }
            if desc.frame_length != frame_length {
                return Err(XbError::InvalidParam(format!(
                    "stream '{}' frame length {} differs from {}",
                    desc.name, desc.frame_length, frame_length
                )));
            }
            let assignments = bundles.get_bundle_assignments(desc.num_channels)?;
            streams.push(AudioStream::new(desc, assignments)?);
        }

        Ok(Self {
            bundles,
            streams,
            frame_length,
        })
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn bundles(&self) -> &BundleSequencer {
        &self.bundles
    }

    pub fn streams(&self) -> &[AudioStream] {
        &self.streams
    }

    pub fn stream(&self, id: StreamId) -> XbResult<&AudioStream> {
        self.streams
            .get(id.index())
            .ok_or_else(|| XbError::InvalidStream(format!("{} does not exist", id)))
    }

    /// A stream together with the bundles it may need for conversions
    pub fn stream_mut(&mut self, id: StreamId) -> XbResult<(&mut AudioStream, &mut BundleSequencer)> {
        let stream = self
            .streams
            .get_mut(id.index())
            .ok_or_else(|| XbError::InvalidStream(format!("{} does not exist", id)))?;
        Ok((stream, &mut self.bundles))
    }

    /// Two distinct streams at once
    pub fn stream_pair_mut(
        &mut self,
        a: StreamId,
        b: StreamId,
    ) -> XbResult<(&mut AudioStream, &mut AudioStream, &mut BundleSequencer)> {
        let (ia, ib) = (a.index(), b.index());
        if ia == ib {
            return Err(XbError::InvalidParam(format!("{} requested twice", a)));
        }
        if ia >= self.streams.len() || ib >= self.streams.len() {
            return Err(XbError::InvalidStream(format!("{} or {} does not exist", a, b)));
        }

        let (sa, sb) = if ia < ib {
            let (lo, hi) = self.streams.split_at_mut(ib);
            (&mut lo[ia], &mut hi[0])
        } else {
            let (lo, hi) = self.streams.split_at_mut(ia);
            (&mut hi[0], &mut lo[ib])
        };
        Ok((sa, sb, &mut self.bundles))
    }

    pub fn find(&self, name: &str) -> Option<&AudioStream> {
        self.streams.iter().find(|s| s.name() == name)
    }

    /// Zero every bundle and stream buffer without freeing anything
    pub fn clear(&mut self) {
        self.bundles.clear_all_bundle_buffers();
        for stream in &mut self.streams {
            stream.clear_buffers();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO CHAIN
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline input or output pin and the stream behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPort {
    pub pin: PinId,
    pub name: String,
    pub num_channels: usize,
    pub stream: StreamId,
}

/// Delayed link: the consumer stream receives the producer's previous period
#[derive(Debug)]
pub(crate) struct DelayedCopy {
    pub(crate) source: StreamId,
    pub(crate) target: StreamId,
    pub(crate) scratch: Vec<Vec<Sample>>,
}

/// Executable audio chain
pub struct AudioChain {
    pub(crate) name: String,
    pub(crate) sample_rate: u32,
    pub(crate) streams: StreamSet,
    pub(crate) modules: Vec<ModuleCore>,
    pub(crate) handles: Vec<ModuleHandle>,
    pub(crate) inputs: Vec<ChainPort>,
    pub(crate) outputs: Vec<ChainPort>,
    pub(crate) input_streams: Vec<StreamId>,
    pub(crate) output_streams: Vec<StreamId>,
    pub(crate) delayed: Vec<DelayedCopy>,
    pub(crate) periods: u64,
}

impl std::fmt::Debug for AudioChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChain")
            .field("name", &self.name)
            .field("modules", &self.execution_order())
            .field("streams", &self.streams.len())
            .field("periods", &self.periods)
            .finish()
    }
}

impl AudioChain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_length(&self) -> usize {
        self.streams.frame_length()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Periods processed so far, failed ones included
    pub fn periods(&self) -> u64 {
        self.periods
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn stream_by_name(&self, name: &str) -> Option<&AudioStream> {
        self.streams.find(name)
    }

    pub fn input_ports(&self) -> &[ChainPort] {
        &self.inputs
    }

    pub fn output_ports(&self) -> &[ChainPort] {
        &self.outputs
    }

    /// Module names in execution order
    pub fn execution_order(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn module_state(&self, id: ModuleId) -> Option<ModuleState> {
        self.modules.iter().find(|m| m.id() == id).map(|m| m.state())
    }

    /// Take the control handle of a module. Each handle can be taken once.
    pub fn take_module_handle(&mut self, id: ModuleId) -> Option<ModuleHandle> {
        let index = self.handles.iter().position(|h| h.id() == id)?;
        Some(self.handles.swap_remove(index))
    }

    pub fn input_frame_mut(&mut self, pin: PinId) -> XbResult<&mut AudioFrame> {
        let stream = self
            .inputs
            .iter()
            .find(|p| p.pin == pin)
            .map(|p| p.stream)
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a chain input", pin)))?;
        let (stream, _) = self.streams.stream_mut(stream)?;
        stream
            .input_frame_mut()
            .ok_or_else(|| XbError::NotInitialized(format!("{} has no input frame", pin)))
    }

    pub fn output_frame(&self, pin: PinId) -> XbResult<&AudioFrame> {
        let stream = self
            .outputs
            .iter()
            .find(|p| p.pin == pin)
            .map(|p| p.stream)
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a chain output", pin)))?;
        self.streams
            .stream(stream)?
            .output_frame()
            .ok_or_else(|| XbError::NotInitialized(format!("{} has no output frame", pin)))
    }

    /// Run one period.
    ///
    /// Input frames must be filled before the call. On a module error the
    /// remaining modules are skipped, output frames are silenced and the
    /// error is returned.
    pub fn process(&mut self) -> XbResult<()> {
        self.periods += 1;

        for &id in &self.input_streams {
            let (stream, _) = self.streams.stream_mut(id)?;
            stream.copy_from_input_audio_channels()?;
        }

        let mut failure = None;
        for core in &mut self.modules {
            if let Err(e) = core.process(&mut self.streams) {
                log::error!(
                    "chain '{}': module '{}' failed in period {}: {}",
                    self.name,
                    core.name(),
                    self.periods,
                    e
                );
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.silence_outputs();
            return Err(e);
        }

        for copy in &mut self.delayed {
            let (source, bundles) = self.streams.stream_mut(copy.source)?;
            source.as_bundled(bundles);
            source.read(bundles, &mut copy.scratch)?;
        }

        for &id in &self.output_streams {
            let (stream, bundles) = self.streams.stream_mut(id)?;
            stream.copy_to_output_audio_channels(bundles)?;
        }

        for copy in &self.delayed {
            let (target, bundles) = self.streams.stream_mut(copy.target)?;
            target.write_from_non_interleaved(bundles, &copy.scratch)?;
        }

        Ok(())
    }

    fn silence_outputs(&mut self) {
        for &id in &self.output_streams {
            if let Ok((stream, _)) = self.streams.stream_mut(id) {
                if let Some(frame) = stream.output_frame_mut() {
                    frame.clear();
                }
                stream.reset_current();
            }
        }
        for &id in &self.input_streams {
            if let Ok((stream, _)) = self.streams.stream_mut(id) {
                stream.reset_current();
            }
        }
    }

    /// Zero every buffer, keeping all allocations
    pub fn clear_buffers(&mut self) {
        self.streams.clear();
        for copy in &mut self.delayed {
            for channel in &mut copy.scratch {
                channel.fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamType;

    fn descriptors() -> Vec<StreamDescriptor> {
        (0..3)
            .map(|i| StreamDescriptor {
                id: StreamId(i),
                name: format!("s{}", i),
                stream_type: StreamType::Intermediate,
                num_channels: i as usize + 1,
                frame_length: 8,
                has_sid: false,
            })
            .collect()
    }

    #[test]
    fn test_from_descriptors_assigns_bundles() {
        let set = StreamSet::from_descriptors(8, descriptors()).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.stream(StreamId(2)).unwrap().bundle_assignments().len(), 1);
        assert_eq!(set.bundles().total_bundles(), 3);
        assert!(set.find("s1").is_some());
    }

    #[test]
    fn test_from_descriptors_rejects_gaps() {
        let mut descs = descriptors();
        descs.remove(1);
        assert!(matches!(
            StreamSet::from_descriptors(8, descs),
            Err(XbError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_unknown_stream() {
        let mut set = StreamSet::from_descriptors(8, descriptors()).unwrap();
        assert!(matches!(set.stream(StreamId(9)), Err(XbError::InvalidStream(_))));
        assert!(matches!(set.stream_mut(StreamId(9)), Err(XbError::InvalidStream(_))));
    }

    #[test]
    fn test_stream_pair_mut() {
        let mut set = StreamSet::from_descriptors(8, descriptors()).unwrap();
        {
            let (a, b, _) = set.stream_pair_mut(StreamId(2), StreamId(0)).unwrap();
            assert_eq!(a.id(), StreamId(2));
            assert_eq!(b.id(), StreamId(0));
        }
        assert!(matches!(
            set.stream_pair_mut(StreamId(1), StreamId(1)),
            Err(XbError::InvalidParam(_))
        ));
    }
}
