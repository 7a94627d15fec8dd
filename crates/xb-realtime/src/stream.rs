//! Audio Streams
//!
//! A stream is a named N-channel signal inside one audio chain. Its samples
//! can be held in three layouts:
//!
//! - `NonInterleaved`: one contiguous run per channel (stride 1)
//! - `Interleaved`: frame-major, all channels of a frame together (stride N)
//! - `Bundled`: lanes inside channel bundles owned by the sequencer (stride 4)
//!
//! At most one layout is current. Asking for another layout copies the
//! current one into it exactly once; asking for the current layout again is
//! free. Copying to the output frame at the end of a period drops the current
//! layout. The stream identifier (SID) travels with every copy.

use std::fmt;

use serde::{Deserialize, Serialize};
use xb_core::{BUNDLE_CHANNELS, Sample, XbError, XbResult};

use crate::frame::AudioFrame;
use crate::sequencer::{BundleAssignments, BundleSequencer, LaneRef, lanes_of};

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Stream id, unique within one audio chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Input,
    Output,
    Intermediate,
}

/// Physical sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    NonInterleaved,
    Interleaved,
    Bundled,
}

impl Layout {
    pub const ALL: [Layout; 3] = [Layout::NonInterleaved, Layout::Interleaved, Layout::Bundled];
}

/// Everything needed to create a stream except its bundle assignments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub name: String,
    pub stream_type: StreamType,
    pub num_channels: usize,
    pub frame_length: usize,
    pub has_sid: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPRESENTATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Channel-major representation
#[derive(Debug, Clone)]
pub struct NonInterleavedBuffer {
    data: Vec<Sample>,
    num_channels: usize,
    frame_length: usize,
    sid: u32,
}

impl NonInterleavedBuffer {
    fn new(num_channels: usize, frame_length: usize) -> Self {
        Self {
            data: vec![0.0; num_channels * frame_length],
            num_channels,
            frame_length,
            sid: 0,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    #[inline]
    pub fn channel(&self, channel: usize) -> &[Sample] {
        let start = channel * self.frame_length;
        &self.data[start..start + self.frame_length]
    }

    #[inline]
    pub fn channel_mut(&mut self, channel: usize) -> &mut [Sample] {
        let start = channel * self.frame_length;
        &mut self.data[start..start + self.frame_length]
    }

    pub fn channels_mut(&mut self) -> std::slice::ChunksExactMut<'_, Sample> {
        self.data.chunks_exact_mut(self.frame_length)
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    fn write_channels<C: AsRef<[Sample]>>(&mut self, input: &[C], sid: u32) {
        for (ch, src) in input.iter().enumerate().take(self.num_channels) {
            let len = self.frame_length;
            self.channel_mut(ch).copy_from_slice(&src.as_ref()[..len]);
        }
        self.sid = sid;
    }

    fn read_channels<C: AsMut<[Sample]>>(&self, out: &mut [C]) {
        for (ch, dst) in out.iter_mut().enumerate().take(self.num_channels) {
            dst.as_mut()[..self.frame_length].copy_from_slice(self.channel(ch));
        }
    }
}

/// Frame-major representation
#[derive(Debug, Clone)]
pub struct InterleavedBuffer {
    data: Vec<Sample>,
    num_channels: usize,
    frame_length: usize,
    sid: u32,
}

impl InterleavedBuffer {
    fn new(num_channels: usize, frame_length: usize) -> Self {
        Self {
            data: vec![0.0; num_channels * frame_length],
            num_channels,
            frame_length,
            sid: 0,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn data(&self) -> &[Sample] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Sample] {
        &mut self.data
    }

    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> Sample {
        self.data[frame * self.num_channels + channel]
    }

    #[inline]
    pub fn set_sample(&mut self, frame: usize, channel: usize, value: Sample) {
        self.data[frame * self.num_channels + channel] = value;
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    fn write_channels<C: AsRef<[Sample]>>(&mut self, input: &[C], sid: u32) {
        let n = self.num_channels;
        for (ch, src) in input.iter().enumerate().take(n) {
            for (frame, &s) in src.as_ref()[..self.frame_length].iter().enumerate() {
                self.data[frame * n + ch] = s;
            }
        }
        self.sid = sid;
    }

    fn read_channels<C: AsMut<[Sample]>>(&self, out: &mut [C]) {
        let n = self.num_channels;
        for (ch, dst) in out.iter_mut().enumerate().take(n) {
            for (frame, d) in dst.as_mut()[..self.frame_length].iter_mut().enumerate() {
                *d = self.data[frame * n + ch];
            }
        }
    }
}

/// Bundle-backed representation. The samples live in the sequencer.
#[derive(Debug, Clone)]
pub struct BundledBuffer {
    assignments: BundleAssignments,
    lanes: Vec<LaneRef>,
    frame_length: usize,
    sid: u32,
}

impl BundledBuffer {
    pub fn assignments(&self) -> &[crate::sequencer::BundleAssignment] {
        &self.assignments
    }

    /// One lane reference per channel
    pub fn lanes(&self) -> &[LaneRef] {
        &self.lanes
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn read_channel(&self, bundles: &BundleSequencer, channel: usize, out: &mut [Sample]) {
        let lane = self.lanes[channel];
        bundles
            .bundle(lane.pool, lane.bundle_index)
            .read_lane(lane.lane, &mut out[..self.frame_length]);
    }

    pub fn write_channel(&self, bundles: &mut BundleSequencer, channel: usize, input: &[Sample]) {
        let lane = self.lanes[channel];
        bundles
            .bundle_mut(lane.pool, lane.bundle_index)
            .write_lane(lane.lane, &input[..self.frame_length]);
    }

    fn write_channels<C: AsRef<[Sample]>>(&mut self, bundles: &mut BundleSequencer, input: &[C], sid: u32) {
        for (ch, src) in input.iter().enumerate().take(self.lanes.len()) {
            self.write_channel(bundles, ch, src.as_ref());
        }
        self.sid = sid;
    }

    fn read_channels<C: AsMut<[Sample]>>(&self, bundles: &BundleSequencer, out: &mut [C]) {
        for (ch, dst) in out.iter_mut().enumerate().take(self.lanes.len()) {
            self.read_channel(bundles, ch, dst.as_mut());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STRIDED CHANNEL VIEWS
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only view of one channel inside any layout
#[derive(Debug, Clone, Copy)]
pub struct StridedChannel<'a> {
    data: &'a [Sample],
    offset: usize,
    stride: usize,
    len: usize,
}

impl StridedChannel<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn get(&self, index: usize) -> Sample {
        self.data[self.offset + index * self.stride]
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.data[self.offset..]
            .iter()
            .step_by(self.stride)
            .take(self.len)
            .copied()
    }

    pub fn copy_to(&self, out: &mut [Sample]) {
        for (dst, src) in out.iter_mut().zip(self.iter()) {
            *dst = src;
        }
    }
}

/// Mutable view of one channel inside any layout
#[derive(Debug)]
pub struct StridedChannelMut<'a> {
    data: &'a mut [Sample],
    offset: usize,
    stride: usize,
    len: usize,
}

impl StridedChannelMut<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn get(&self, index: usize) -> Sample {
        self.data[self.offset + index * self.stride]
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Sample) {
        self.data[self.offset + index * self.stride] = value;
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sample> + '_ {
        self.data[self.offset..]
            .iter_mut()
            .step_by(self.stride)
            .take(self.len)
    }

    pub fn fill(&mut self, value: Sample) {
        for s in self.iter_mut() {
            *s = value;
        }
    }

    pub fn copy_from(&mut self, input: &[Sample]) {
        for (dst, &src) in self.iter_mut().zip(input) {
            *dst = src;
        }
    }

    pub fn copy_to(&mut self, out: &mut [Sample]) {
        for (dst, src) in out.iter_mut().zip(self.iter_mut()) {
            *dst = *src;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Logical signal with lazily created physical representations
#[derive(Debug)]
pub struct AudioStream {
    name: String,
    id: StreamId,
    stream_type: StreamType,
    num_channels: usize,
    frame_length: usize,
    has_sid: bool,

    non_interleaved: Option<NonInterleavedBuffer>,
    interleaved: Option<InterleavedBuffer>,
    bundled: BundledBuffer,
    current: Option<Layout>,

    /// Next materialization loads the input frame
    pending_input: bool,
    input_frame: Option<AudioFrame>,
    output_frame: Option<AudioFrame>,

    conversions: u64,
}

impl AudioStream {
    /// Create a stream over lanes handed out by the sequencer
    pub fn new(desc: StreamDescriptor, assignments: BundleAssignments) -> XbResult<Self> {
        if desc.num_channels == 0 || desc.frame_length == 0 {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' needs channels and a frame length",
                desc.name
            )));
        }
        let assigned: usize = assignments.iter().map(|a| a.num_channels).sum();
        if assigned != desc.num_channels {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' has {} channels but {} assigned lanes",
                desc.name, desc.num_channels, assigned
            )));
        }
        let lanes = lanes_of(&assignments);

        Ok(Self {
            name: desc.name,
            id: desc.id,
            stream_type: desc.stream_type,
            num_channels: desc.num_channels,
            frame_length: desc.frame_length,
            has_sid: desc.has_sid,
            non_interleaved: None,
            interleaved: None,
            bundled: BundledBuffer {
                assignments,
                lanes,
                frame_length: desc.frame_length,
                sid: 0,
            },
            current: None,
            pending_input: false,
            input_frame: None,
            output_frame: None,
            conversions: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn has_sid(&self) -> bool {
        self.has_sid
    }

    pub fn current_layout(&self) -> Option<Layout> {
        self.current
    }

    /// Number of layout conversions performed so far
    pub fn conversion_count(&self) -> u64 {
        self.conversions
    }

    /// Inter-sample stride of the current layout
    pub fn stride(&self) -> Option<usize> {
        self.current.map(|layout| match layout {
            Layout::NonInterleaved => 1,
            Layout::Interleaved => self.num_channels,
            Layout::Bundled => BUNDLE_CHANNELS,
        })
    }

    pub fn bundle_assignments(&self) -> &[crate::sequencer::BundleAssignment] {
        self.bundled.assignments()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // External frames
    // ─────────────────────────────────────────────────────────────────────────

    pub fn attach_input_frame(&mut self) {
        if self.input_frame.is_none() {
            self.input_frame = Some(AudioFrame::new(self.num_channels, self.frame_length));
        }
    }

    pub fn attach_output_frame(&mut self) {
        if self.output_frame.is_none() {
            self.output_frame = Some(AudioFrame::new(self.num_channels, self.frame_length));
        }
    }

    pub fn input_frame(&self) -> Option<&AudioFrame> {
        self.input_frame.as_ref()
    }

    pub fn input_frame_mut(&mut self) -> Option<&mut AudioFrame> {
        self.input_frame.as_mut()
    }

    pub fn output_frame(&self) -> Option<&AudioFrame> {
        self.output_frame.as_ref()
    }

    pub fn output_frame_mut(&mut self) -> Option<&mut AudioFrame> {
        self.output_frame.as_mut()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Layout access
    // ─────────────────────────────────────────────────────────────────────────

    pub fn as_non_interleaved(&mut self, bundles: &mut BundleSequencer) -> &mut NonInterleavedBuffer {
        self.materialize(Layout::NonInterleaved, bundles);
        let (n, f) = (self.num_channels, self.frame_length);
        self.non_interleaved
            .get_or_insert_with(|| NonInterleavedBuffer::new(n, f))
    }

    pub fn as_interleaved(&mut self, bundles: &mut BundleSequencer) -> &mut InterleavedBuffer {
        self.materialize(Layout::Interleaved, bundles);
        let (n, f) = (self.num_channels, self.frame_length);
        self.interleaved
            .get_or_insert_with(|| InterleavedBuffer::new(n, f))
    }

    pub fn as_bundled(&mut self, bundles: &mut BundleSequencer) -> &BundledBuffer {
        self.materialize(Layout::Bundled, bundles);
        &self.bundled
    }

    /// Make `target` current, copying from the previous current layout or
    /// from a pending input frame
    pub fn materialize(&mut self, target: Layout, bundles: &mut BundleSequencer) {
        self.ensure(target);
        if self.pending_input {
            self.pending_input = false;
            self.load_input_frame(target, bundles);
        } else if let Some(current) = self.current {
            self.convert(current, target, bundles);
        }
        self.current = Some(target);
    }

    fn ensure(&mut self, layout: Layout) {
        let (n, f) = (self.num_channels, self.frame_length);
        match layout {
            Layout::NonInterleaved => {
                self.non_interleaved
                    .get_or_insert_with(|| NonInterleavedBuffer::new(n, f));
            }
            Layout::Interleaved => {
                self.interleaved
                    .get_or_insert_with(|| InterleavedBuffer::new(n, f));
            }
            Layout::Bundled => {}
        }
    }

    /// Copy all channels from one layout into another.
    ///
    /// Both buffers must exist; identity pairs are no-ops.
    fn convert(&mut self, from: Layout, to: Layout, bundles: &mut BundleSequencer) {
        use Layout::*;

        let Self {
            non_interleaved,
            interleaved,
            bundled,
            num_channels,
            frame_length,
            ..
        } = self;
        let (n, frames) = (*num_channels, *frame_length);

        match (from, to) {
            (NonInterleaved, NonInterleaved) | (Interleaved, Interleaved) | (Bundled, Bundled) => {
                return;
            }
            (NonInterleaved, Interleaved) => {
                let (Some(src), Some(dst)) = (non_interleaved.as_ref(), interleaved.as_mut()) else {
                    return;
                };
                for ch in 0..n {
                    for (frame, &s) in src.channel(ch).iter().enumerate() {
                        dst.data[frame * n + ch] = s;
                    }
                }
                dst.sid = src.sid;
            }
            (NonInterleaved, Bundled) => {
                let Some(src) = non_interleaved.as_ref() else {
                    return;
                };
                for ch in 0..n {
                    bundled.write_channel(bundles, ch, src.channel(ch));
                }
                bundled.sid = src.sid;
            }
            (Interleaved, NonInterleaved) => {
                let (Some(src), Some(dst)) = (interleaved.as_ref(), non_interleaved.as_mut()) else {
                    return;
                };
                for ch in 0..n {
                    for (frame, d) in dst.channel_mut(ch).iter_mut().enumerate() {
                        *d = src.data[frame * n + ch];
                    }
                }
                dst.sid = src.sid;
            }
            (Interleaved, Bundled) => {
                let Some(src) = interleaved.as_ref() else {
                    return;
                };
                for (frame, samples) in src.data.chunks_exact(n).take(frames).enumerate() {
                    for (&lane, &s) in bundled.lanes.iter().zip(samples) {
                        bundles.set_lane_sample(lane, frame, s);
                    }
                }
                bundled.sid = src.sid;
            }
            (Bundled, NonInterleaved) => {
                let Some(dst) = non_interleaved.as_mut() else {
                    return;
                };
                for ch in 0..n {
                    bundled.read_channel(bundles, ch, dst.channel_mut(ch));
                }
                dst.sid = bundled.sid;
            }
            (Bundled, Interleaved) => {
                let Some(dst) = interleaved.as_mut() else {
                    return;
                };
                for (frame, samples) in dst.data.chunks_exact_mut(n).take(frames).enumerate() {
                    for (&lane, d) in bundled.lanes.iter().zip(samples.iter_mut()) {
                        *d = bundles.lane_sample(lane, frame);
                    }
                }
                dst.sid = bundled.sid;
            }
        }
        self.conversions += 1;
    }

    fn load_input_frame(&mut self, target: Layout, bundles: &mut BundleSequencer) {
        let Some(frame) = self.input_frame.as_ref() else {
            return;
        };
        let sid = frame.sid();
        match target {
            Layout::NonInterleaved => {
                if let Some(buf) = self.non_interleaved.as_mut() {
                    buf.write_channels(frame.channels(), sid);
                }
            }
            Layout::Interleaved => {
                if let Some(buf) = self.interleaved.as_mut() {
                    buf.write_channels(frame.channels(), sid);
                }
            }
            Layout::Bundled => self.bundled.write_channels(bundles, frame.channels(), sid),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Period boundary
    // ─────────────────────────────────────────────────────────────────────────

    /// Defer loading the input frame until the next layout request
    pub fn copy_from_input_audio_channels(&mut self) -> XbResult<()> {
        if self.input_frame.is_none() {
            return Err(XbError::NotInitialized(format!(
                "stream '{}' has no input frame",
                self.name
            )));
        }
        self.pending_input = true;
        self.current = None;
        Ok(())
    }

    /// Copy the current layout into the output frame and drop it.
    ///
    /// A stream whose input was never touched forwards the input frame. A
    /// stream with no data this period produces silence.
    pub fn copy_to_output_audio_channels(&mut self, bundles: &BundleSequencer) -> XbResult<()> {
        let Some(out) = self.output_frame.as_mut() else {
            return Err(XbError::NotInitialized(format!(
                "stream '{}' has no output frame",
                self.name
            )));
        };

        match self.current {
            Some(Layout::NonInterleaved) => {
                if let Some(buf) = self.non_interleaved.as_ref() {
                    buf.read_channels(out.channels_mut());
                    out.set_sid(buf.sid);
                }
            }
            Some(Layout::Interleaved) => {
                if let Some(buf) = self.interleaved.as_ref() {
                    buf.read_channels(out.channels_mut());
                    out.set_sid(buf.sid);
                }
            }
            Some(Layout::Bundled) => {
                self.bundled.read_channels(bundles, out.channels_mut());
                out.set_sid(self.bundled.sid);
            }
            None => match self.input_frame.as_ref() {
                Some(input) if self.pending_input => out.clone_from(input),
                _ => out.clear(),
            },
        }

        self.current = None;
        self.pending_input = false;
        Ok(())
    }

    /// Drop the current layout without copying anywhere
    pub fn reset_current(&mut self) {
        self.current = None;
        self.pending_input = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk read / write
    // ─────────────────────────────────────────────────────────────────────────

    /// Write all channels into the bundled layout and make it current
    pub fn write_from_non_interleaved<C: AsRef<[Sample]>>(
        &mut self,
        bundles: &mut BundleSequencer,
        input: &[C],
    ) -> XbResult<()> {
        if input.len() < self.num_channels {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' expects {} channels, got {}",
                self.name,
                self.num_channels,
                input.len()
            )));
        }
        if let Some(short) = input[..self.num_channels]
            .iter()
            .position(|c| c.as_ref().len() < self.frame_length)
        {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' channel {} is shorter than {} frames",
                self.name, short, self.frame_length
            )));
        }

        let sid = self.current_sid().unwrap_or(self.bundled.sid);
        self.bundled
            .write_channels(bundles, &input[..self.num_channels], sid);
        self.current = Some(Layout::Bundled);
        self.pending_input = false;
        Ok(())
    }

    /// Read the current layout into non-interleaved buffers without changing it
    pub fn read<C: AsMut<[Sample]>>(&self, bundles: &BundleSequencer, output: &mut [C]) -> XbResult<()> {
        if output.len() < self.num_channels
            || output[..self.num_channels]
                .iter_mut()
                .any(|c| c.as_mut().len() < self.frame_length)
        {
            return Err(XbError::InvalidParam(format!(
                "output buffers too small for stream '{}'",
                self.name
            )));
        }

        match self.current {
            Some(Layout::NonInterleaved) => {
                if let Some(buf) = self.non_interleaved.as_ref() {
                    buf.read_channels(output);
                }
            }
            Some(Layout::Interleaved) => {
                if let Some(buf) = self.interleaved.as_ref() {
                    buf.read_channels(output);
                }
            }
            Some(Layout::Bundled) => self.bundled.read_channels(bundles, output),
            None => {
                return Err(XbError::NotInitialized(format!(
                    "stream '{}' has no current representation",
                    self.name
                )));
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strided access
    // ─────────────────────────────────────────────────────────────────────────

    /// Visit every channel of the current layout without a layout change.
    /// With no current layout the bundled one is materialized first.
    pub fn for_each_channel_mut<F>(&mut self, bundles: &mut BundleSequencer, mut f: F)
    where
        F: FnMut(usize, StridedChannelMut<'_>),
    {
        let layout = match self.current {
            Some(layout) => layout,
            None => {
                self.materialize(Layout::Bundled, bundles);
                Layout::Bundled
            }
        };
        let (n, frames) = (self.num_channels, self.frame_length);

        match layout {
            Layout::NonInterleaved => {
                if let Some(buf) = self.non_interleaved.as_mut() {
                    for (ch, data) in buf.data.chunks_exact_mut(frames).enumerate() {
                        f(ch, StridedChannelMut { data, offset: 0, stride: 1, len: frames });
                    }
                }
            }
            Layout::Interleaved => {
                if let Some(buf) = self.interleaved.as_mut() {
                    for ch in 0..n {
                        f(ch, StridedChannelMut { data: buf.data.as_mut_slice(), offset: ch, stride: n, len: frames });
                    }
                }
            }
            Layout::Bundled => {
                for (ch, lane) in self.bundled.lanes.iter().enumerate() {
                    let data = bundles.bundle_mut(lane.pool, lane.bundle_index).data_mut();
                    f(ch, StridedChannelMut { data, offset: lane.lane, stride: BUNDLE_CHANNELS, len: frames });
                }
            }
        }
    }

    /// Read-only visit of every channel of the current layout
    pub fn for_each_channel<F>(&self, bundles: &BundleSequencer, mut f: F) -> XbResult<()>
    where
        F: FnMut(usize, StridedChannel<'_>),
    {
        let (n, frames) = (self.num_channels, self.frame_length);
        match self.current {
            Some(Layout::NonInterleaved) => {
                if let Some(buf) = self.non_interleaved.as_ref() {
                    for (ch, data) in buf.data.chunks_exact(frames).enumerate() {
                        f(ch, StridedChannel { data, offset: 0, stride: 1, len: frames });
                    }
                }
            }
            Some(Layout::Interleaved) => {
                if let Some(buf) = self.interleaved.as_ref() {
                    for ch in 0..n {
                        f(ch, StridedChannel { data: buf.data.as_slice(), offset: ch, stride: n, len: frames });
                    }
                }
            }
            Some(Layout::Bundled) => {
                for (ch, lane) in self.bundled.lanes.iter().enumerate() {
                    let data = bundles.bundle(lane.pool, lane.bundle_index).data();
                    f(ch, StridedChannel { data, offset: lane.lane, stride: BUNDLE_CHANNELS, len: frames });
                }
            }
            None => {
                return Err(XbError::NotInitialized(format!(
                    "stream '{}' has no current representation",
                    self.name
                )));
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // SID
    // ─────────────────────────────────────────────────────────────────────────

    fn current_sid(&self) -> Option<u32> {
        match self.current? {
            Layout::NonInterleaved => self.non_interleaved.as_ref().map(|b| b.sid),
            Layout::Interleaved => self.interleaved.as_ref().map(|b| b.sid),
            Layout::Bundled => Some(self.bundled.sid),
        }
    }

    /// SID of the current layout
    pub fn sid(&self) -> XbResult<u32> {
        if !self.has_sid {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' carries no SID",
                self.name
            )));
        }
        self.current_sid().ok_or_else(|| {
            XbError::NotInitialized(format!("stream '{}' has no current representation", self.name))
        })
    }

    pub fn set_sid(&mut self, sid: u32) -> XbResult<()> {
        if !self.has_sid {
            return Err(XbError::InvalidParam(format!(
                "stream '{}' carries no SID",
                self.name
            )));
        }
        match self.current {
            Some(Layout::NonInterleaved) => {
                if let Some(buf) = self.non_interleaved.as_mut() {
                    buf.sid = sid;
                }
            }
            Some(Layout::Interleaved) => {
                if let Some(buf) = self.interleaved.as_mut() {
                    buf.sid = sid;
                }
            }
            Some(Layout::Bundled) => self.bundled.sid = sid,
            None => {
                return Err(XbError::NotInitialized(format!(
                    "stream '{}' has no current representation",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Zero the stream's own buffers and frames. Bundles are cleared by the sequencer.
    pub fn clear_buffers(&mut self) {
        if let Some(buf) = self.non_interleaved.as_mut() {
            buf.data.fill(0.0);
            buf.sid = 0;
        }
        if let Some(buf) = self.interleaved.as_mut() {
            buf.data.fill(0.0);
            buf.sid = 0;
        }
        self.bundled.sid = 0;
        if let Some(frame) = self.input_frame.as_mut() {
            frame.clear();
        }
        if let Some(frame) = self.output_frame.as_mut() {
            frame.clear();
        }
        self.reset_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMES: usize = 8;

    fn stream(channels: usize, has_sid: bool) -> (AudioStream, BundleSequencer) {
        let mut bundles = BundleSequencer::with_frame_length(FRAMES).unwrap();
        let assignments = bundles.get_bundle_assignments(channels).unwrap();
        let desc = StreamDescriptor {
            id: StreamId(0),
            name: "test".into(),
            stream_type: StreamType::Intermediate,
            num_channels: channels,
            frame_length: FRAMES,
            has_sid,
        };
        (AudioStream::new(desc, assignments).unwrap(), bundles)
    }

    fn ramp(channels: usize) -> Vec<Vec<Sample>> {
        (0..channels)
            .map(|ch| (0..FRAMES).map(|i| (ch * 100 + i) as Sample * 0.01).collect())
            .collect()
    }

    #[test]
    fn test_new_validates_assignment_sum() {
        let mut bundles = BundleSequencer::with_frame_length(FRAMES).unwrap();
        let assignments = bundles.get_bundle_assignments(2).unwrap();
        let desc = StreamDescriptor {
            id: StreamId(0),
            name: "bad".into(),
            stream_type: StreamType::Intermediate,
            num_channels: 3,
            frame_length: FRAMES,
            has_sid: false,
        };
        assert!(matches!(
            AudioStream::new(desc, assignments),
            Err(XbError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_round_trip_bit_exact() {
        let (mut s, mut bundles) = stream(6, false);
        let input = ramp(6);
        s.write_from_non_interleaved(&mut bundles, &input).unwrap();
        assert_eq!(s.current_layout(), Some(Layout::Bundled));

        let mut out = vec![vec![0.0; FRAMES]; 6];
        s.read(&bundles, &mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_write_fewer_channels_rejected() {
        let (mut s, mut bundles) = stream(3, false);
        let input = ramp(2);
        assert!(matches!(
            s.write_from_non_interleaved(&mut bundles, &input),
            Err(XbError::InvalidParam(_))
        ));
        let short = vec![vec![0.0; FRAMES - 1]; 3];
        assert!(matches!(
            s.write_from_non_interleaved(&mut bundles, &short),
            Err(XbError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_read_without_current_fails() {
        let (s, bundles) = stream(2, false);
        let mut out = vec![vec![0.0; FRAMES]; 2];
        assert!(matches!(
            s.read(&bundles, &mut out),
            Err(XbError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_as_bundled_twice_copies_once() {
        let (mut s, mut bundles) = stream(2, false);
        s.as_non_interleaved(&mut bundles);
        assert_eq!(s.conversion_count(), 0);

        s.as_bundled(&mut bundles);
        assert_eq!(s.conversion_count(), 1);
        s.as_bundled(&mut bundles);
        assert_eq!(s.conversion_count(), 1);
        assert_eq!(s.current_layout(), Some(Layout::Bundled));
    }

    #[test]
    fn test_first_materialization_does_not_copy() {
        let (mut s, mut bundles) = stream(2, false);
        s.as_interleaved(&mut bundles);
        assert_eq!(s.conversion_count(), 0);
        assert_eq!(s.stride(), Some(2));
    }

    #[test]
    fn test_all_conversions_preserve_data() {
        for from in Layout::ALL {
            for to in Layout::ALL {
                let (mut s, mut bundles) = stream(5, false);
                let input = ramp(5);
                s.write_from_non_interleaved(&mut bundles, &input).unwrap();
                s.materialize(from, &mut bundles);
                s.materialize(to, &mut bundles);

                let mut out = vec![vec![0.0; FRAMES]; 5];
                s.read(&bundles, &mut out).unwrap();
                assert_eq!(out, input, "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_sid_preserved_across_layouts() {
        let (mut s, mut bundles) = stream(2, true);
        s.as_non_interleaved(&mut bundles);
        s.set_sid(0xDEAD_BEEF).unwrap();

        s.as_bundled(&mut bundles);
        assert_eq!(s.sid().unwrap(), 0xDEAD_BEEF);

        s.as_interleaved(&mut bundles);
        assert_eq!(s.sid().unwrap(), 0xDEAD_BEEF);
        assert_eq!(s.as_interleaved(&mut bundles).sid(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_sid_rejected_without_flag() {
        let (mut s, mut bundles) = stream(1, false);
        s.as_bundled(&mut bundles);
        assert!(matches!(s.set_sid(1), Err(XbError::InvalidParam(_))));
        assert!(matches!(s.sid(), Err(XbError::InvalidParam(_))));
    }

    #[test]
    fn test_pending_input_loaded_on_materialize() {
        let (mut s, mut bundles) = stream(2, true);
        s.attach_input_frame();
        let frame = s.input_frame_mut().unwrap();
        frame.channel_mut(0).fill(0.5);
        frame.channel_mut(1).fill(-0.5);
        frame.set_sid(9);

        s.copy_from_input_audio_channels().unwrap();
        assert_eq!(s.current_layout(), None);

        let ni = s.as_non_interleaved(&mut bundles);
        assert!(ni.channel(0).iter().all(|&x| x == 0.5));
        assert!(ni.channel(1).iter().all(|&x| x == -0.5));
        assert_eq!(s.sid().unwrap(), 9);
        assert_eq!(s.conversion_count(), 0);
    }

    #[test]
    fn test_copy_from_input_without_frame_fails() {
        let (mut s, _) = stream(2, false);
        assert!(matches!(
            s.copy_from_input_audio_channels(),
            Err(XbError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_copy_to_output_resets_current() {
        let (mut s, mut bundles) = stream(2, false);
        s.attach_output_frame();
        let input = ramp(2);
        s.write_from_non_interleaved(&mut bundles, &input).unwrap();
        s.as_interleaved(&mut bundles);

        s.copy_to_output_audio_channels(&bundles).unwrap();
        assert_eq!(s.current_layout(), None);
        assert_eq!(s.output_frame().unwrap().channels(), input.as_slice());
    }

    #[test]
    fn test_copy_to_output_forwards_untouched_input() {
        let (mut s, _bundles) = stream(1, false);
        s.attach_input_frame();
        s.attach_output_frame();
        s.input_frame_mut().unwrap().channel_mut(0).fill(0.25);
        s.copy_from_input_audio_channels().unwrap();

        let bundles = BundleSequencer::new();
        s.copy_to_output_audio_channels(&bundles).unwrap();
        assert!(s.output_frame().unwrap().channel(0).iter().all(|&x| x == 0.25));
    }

    #[test]
    fn test_strides_per_layout() {
        for (layout, expected) in [
            (Layout::NonInterleaved, 1),
            (Layout::Interleaved, 3),
            (Layout::Bundled, 4),
        ] {
            let (mut s, mut bundles) = stream(3, false);
            s.materialize(layout, &mut bundles);
            assert_eq!(s.stride(), Some(expected));

            let mut seen = Vec::new();
            s.for_each_channel_mut(&mut bundles, |ch, view| {
                assert_eq!(view.stride(), expected);
                assert_eq!(view.len(), FRAMES);
                seen.push(ch);
            });
            assert_eq!(seen, vec![0, 1, 2]);
            assert_eq!(s.current_layout(), Some(layout));
        }
    }

    #[test]
    fn test_strided_write_visible_after_conversion() {
        let (mut s, mut bundles) = stream(3, false);
        s.materialize(Layout::Interleaved, &mut bundles);
        s.for_each_channel_mut(&mut bundles, |ch, mut view| view.fill(ch as Sample + 1.0));

        let ni = s.as_non_interleaved(&mut bundles);
        assert!(ni.channel(0).iter().all(|&x| x == 1.0));
        assert!(ni.channel(2).iter().all(|&x| x == 3.0));
    }

    #[test]
    fn test_strided_visit_materializes_bundled() {
        let (mut s, mut bundles) = stream(2, false);
        s.for_each_channel_mut(&mut bundles, |_, mut view| view.set(0, 1.0));
        assert_eq!(s.current_layout(), Some(Layout::Bundled));

        let mut first = Vec::new();
        s.for_each_channel(&bundles, |_, view| first.push(view.get(0)))
            .unwrap();
        assert_eq!(first, vec![1.0, 1.0]);
    }

    #[test]
    fn test_clear_buffers() {
        let (mut s, mut bundles) = stream(2, false);
        s.attach_output_frame();
        s.as_non_interleaved(&mut bundles).channel_mut(0).fill(1.0);
        s.clear_buffers();
        assert_eq!(s.current_layout(), None);
        assert!(s.as_non_interleaved(&mut bundles).channel(0).iter().all(|&x| x == 0.0));
    }
}
