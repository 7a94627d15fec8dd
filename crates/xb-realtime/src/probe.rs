//! Data Probes
//!
//! A probe records from or injects into one stream of one module for a
//! fixed number of frames. Probes are attached through the module's probe
//! queue and run on the audio thread against the bundled representation.
//!
//! Sample data crosses threads through an rtrb ring. Each period contributes
//! one block in channel-major order:
//!
//! ```text
//! [ch0: f0..fn] [ch1: f0..fn] ... [chN: f0..fn]
//! ```
//!
//! where `fn` is the frame length, or fewer frames for the last block.

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use xb_core::{Sample, XbError, XbResult};

use crate::sequencer::BundleSequencer;
use crate::stream::{AudioStream, StreamId};

/// Periods of sample data a probe ring can hold before the control side must drain it
pub const PROBE_RING_PERIODS: usize = 32;

/// Which side of the module body a probe runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeDirection {
    /// Before `process_child`
    Input,
    /// After `process_child`
    Output,
}

enum ProbeKind {
    Record(Producer<Sample>),
    Inject(Consumer<Sample>),
}

/// Audio-thread side of a probe
pub struct DataProbe {
    stream: StreamId,
    direction: ProbeDirection,
    kind: ProbeKind,
    frames_remaining: usize,
}

impl std::fmt::Debug for DataProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProbe")
            .field("stream", &self.stream)
            .field("direction", &self.direction)
            .field("recording", &matches!(self.kind, ProbeKind::Record(_)))
            .field("frames_remaining", &self.frames_remaining)
            .finish()
    }
}

/// Entry of a module's probe queue
#[derive(Debug)]
pub enum ProbeCommand {
    Start(DataProbe),
    Stop {
        stream: StreamId,
        direction: ProbeDirection,
    },
}

impl DataProbe {
    /// Create a recording probe and its control-side reader
    pub fn record(
        stream: StreamId,
        direction: ProbeDirection,
        num_channels: usize,
        frame_length: usize,
        num_frames: usize,
    ) -> XbResult<(Self, ProbeRecording)> {
        let capacity = ring_capacity(num_channels, frame_length, num_frames)?;
        let (producer, consumer) = RingBuffer::new(capacity);
        Ok((
            Self {
                stream,
                direction,
                kind: ProbeKind::Record(producer),
                frames_remaining: num_frames,
            },
            ProbeRecording {
                stream,
                num_channels,
                total_frames: num_frames,
                consumer,
            },
        ))
    }

    /// Create an injecting probe and its control-side writer
    pub fn inject(
        stream: StreamId,
        direction: ProbeDirection,
        num_channels: usize,
        frame_length: usize,
        num_frames: usize,
    ) -> XbResult<(Self, ProbeInjection)> {
        let capacity = ring_capacity(num_channels, frame_length, num_frames)?;
        let (producer, consumer) = RingBuffer::new(capacity);
        Ok((
            Self {
                stream,
                direction,
                kind: ProbeKind::Inject(consumer),
                frames_remaining: num_frames,
            },
            ProbeInjection {
                stream,
                num_channels,
                producer,
            },
        ))
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn direction(&self) -> ProbeDirection {
        self.direction
    }

    pub fn frames_remaining(&self) -> usize {
        self.frames_remaining
    }

    pub fn is_finished(&self) -> bool {
        self.frames_remaining == 0
    }

    /// Run one period against `stream`.
    ///
    /// The period counts towards the probe duration even when the ring
    /// cannot take or deliver the data.
    pub fn run(&mut self, stream: &mut AudioStream, bundles: &mut BundleSequencer) -> XbResult<()> {
        let frames = self.frames_remaining.min(stream.frame_length());
        if frames == 0 {
            return Ok(());
        }
        self.frames_remaining -= frames;

        stream.as_bundled(bundles);
        let needed = frames * stream.num_channels();

        match &mut self.kind {
            ProbeKind::Record(producer) => {
                if producer.slots() < needed {
                    return Err(XbError::NoSpaceLeft(format!(
                        "probe on {} dropped a period: ring full",
                        self.stream
                    )));
                }
                stream.for_each_channel(bundles, |_, view| {
                    for sample in view.iter().take(frames) {
                        let _ = producer.push(sample);
                    }
                })
            }
            ProbeKind::Inject(consumer) => {
                if consumer.slots() < needed {
                    return Err(XbError::NoSpaceLeft(format!(
                        "probe on {} skipped a period: injection underrun",
                        self.stream
                    )));
                }
                stream.for_each_channel_mut(bundles, |_, mut view| {
                    for i in 0..frames {
                        if let Ok(sample) = consumer.pop() {
                            view.set(i, sample);
                        }
                    }
                });
                Ok(())
            }
        }
    }
}

fn ring_capacity(num_channels: usize, frame_length: usize, num_frames: usize) -> XbResult<usize> {
    if num_channels == 0 || frame_length == 0 || num_frames == 0 {
        return Err(XbError::InvalidParam(
            "probe needs channels, a frame length and a duration".into(),
        ));
    }
    let period = num_channels * frame_length;
    Ok((num_frames * num_channels).min(period * PROBE_RING_PERIODS).max(period))
}

/// Control-side reader of a recording probe
pub struct ProbeRecording {
    stream: StreamId,
    num_channels: usize,
    total_frames: usize,
    consumer: Consumer<Sample>,
}

impl ProbeRecording {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Samples waiting to be read
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Read up to `out.len()` samples, returning how many were read
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.consumer.pop() {
                Ok(sample) => {
                    *slot = sample;
                    count += 1;
                }
                Err(_) => break,
            }
        }
        count
    }

    /// Append everything available to `out`
    pub fn drain_into(&mut self, out: &mut Vec<Sample>) {
        while let Ok(sample) = self.consumer.pop() {
            out.push(sample);
        }
    }

    /// True once the audio side dropped its end
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

/// Control-side writer of an injecting probe
pub struct ProbeInjection {
    stream: StreamId,
    num_channels: usize,
    producer: Producer<Sample>,
}

impl ProbeInjection {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn free_slots(&self) -> usize {
        self.producer.slots()
    }

    /// Queue samples, returning how many fit
    pub fn push(&mut self, samples: &[Sample]) -> usize {
        let mut count = 0;
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                break;
            }
            count += 1;
        }
        count
    }

    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamDescriptor, StreamType};

    const FRAMES: usize = 4;

    fn stream(channels: usize) -> (AudioStream, BundleSequencer) {
        let mut bundles = BundleSequencer::with_frame_length(FRAMES).unwrap();
        let assignments = bundles.get_bundle_assignments(channels).unwrap();
        let desc = StreamDescriptor {
            id: StreamId(3),
            name: "probe".into(),
            stream_type: StreamType::Intermediate,
            num_channels: channels,
            frame_length: FRAMES,
            has_sid: false,
        };
        (AudioStream::new(desc, assignments).unwrap(), bundles)
    }

    #[test]
    fn test_record_channel_major() {
        let (mut s, mut bundles) = stream(2);
        let input = vec![vec![1.0, 2.0, 3.0, 4.0], vec![-1.0, -2.0, -3.0, -4.0]];
        s.write_from_non_interleaved(&mut bundles, &input).unwrap();

        let (mut probe, mut rec) =
            DataProbe::record(StreamId(3), ProbeDirection::Output, 2, FRAMES, 6).unwrap();
        probe.run(&mut s, &mut bundles).unwrap();
        assert_eq!(probe.frames_remaining(), 2);

        probe.run(&mut s, &mut bundles).unwrap();
        assert!(probe.is_finished());

        let mut out = Vec::new();
        rec.drain_into(&mut out);
        assert_eq!(
            out,
            vec![
                1.0, 2.0, 3.0, 4.0, -1.0, -2.0, -3.0, -4.0, // first period
                1.0, 2.0, -1.0, -2.0, // two remaining frames
            ]
        );
    }

    #[test]
    fn test_inject_overwrites_stream() {
        let (mut s, mut bundles) = stream(1);
        let (mut probe, mut inj) =
            DataProbe::inject(StreamId(3), ProbeDirection::Input, 1, FRAMES, FRAMES).unwrap();
        assert_eq!(inj.push(&[0.1, 0.2, 0.3, 0.4]), 4);

        probe.run(&mut s, &mut bundles).unwrap();
        assert!(probe.is_finished());

        let mut out = vec![vec![0.0; FRAMES]];
        s.read(&bundles, &mut out).unwrap();
        assert_eq!(out[0], vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_inject_underrun_reports_error() {
        let (mut s, mut bundles) = stream(1);
        let (mut probe, mut inj) =
            DataProbe::inject(StreamId(3), ProbeDirection::Input, 1, FRAMES, 8).unwrap();
        inj.push(&[1.0]);
        assert!(matches!(
            probe.run(&mut s, &mut bundles),
            Err(XbError::NoSpaceLeft(_))
        ));
        assert_eq!(probe.frames_remaining(), 4);
    }

    #[test]
    fn test_zero_duration_rejected() {
        assert!(DataProbe::record(StreamId(0), ProbeDirection::Input, 1, FRAMES, 0).is_err());
    }
}
