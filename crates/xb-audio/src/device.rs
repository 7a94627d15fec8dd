//! Audio devices
//!
//! Sinks are driven by a routing zone through the [`SinkDevice`] trait.
//! Sources are producers writing into a shared [`SourceRingBuffer`].
//!
//! A simulated sink is provided: its period clock is a crossbeam channel
//! ticked by the caller, and every committed period is handed back through a
//! second channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use xb_core::{Sample, XbResult};

use crate::error::{DeviceError, DeviceResult};
use crate::ringbuf::SourceRingBuffer;

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICE PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a device's period clock comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockType {
    /// The device provides the clock
    Provided,
    /// The device follows an external clock
    Received,
    /// External clock, asynchronously resampled
    ReceivedAsync,
    #[default]
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    pub name: String,
    pub num_channels: usize,
    pub sample_rate: u32,
    /// Frames per period
    pub period_size: usize,
    pub num_periods: usize,
    #[serde(default)]
    pub clock: ClockType,
}

impl DeviceParams {
    pub fn new(name: impl Into<String>, num_channels: usize, sample_rate: u32, period_size: usize) -> Self {
        Self {
            name: name.into(),
            num_channels,
            sample_rate,
            period_size,
            num_periods: 2,
            clock: ClockType::Provided,
        }
    }

    pub fn with_clock(mut self, clock: ClockType) -> Self {
        self.clock = clock;
        self
    }

    pub fn validate(&self) -> DeviceResult<()> {
        if self.num_channels == 0 || self.sample_rate == 0 || self.period_size == 0 || self.num_periods == 0 {
            return Err(DeviceError::InvalidConfig(format!(
                "device '{}' needs channels, a sample rate, a period size and periods",
                self.name
            )));
        }
        Ok(())
    }

    /// Period duration at the device's sample rate
    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.period_size as f64 / self.sample_rate as f64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINK CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// Playback device driven by a routing zone.
///
/// Period size, format and channel count are fixed once the device is open.
pub trait SinkDevice: Send {
    fn params(&self) -> &DeviceParams;

    /// True once the backend is open and accepts periods
    fn is_initialized(&self) -> bool;

    /// Block until the next period is due
    fn wait_for_period(&mut self, timeout: Duration) -> DeviceResult<()>;

    /// Interleaved buffer of one period
    fn period_buffer(&mut self) -> &mut [Sample];

    /// Hand the period buffer to the backend
    fn commit_period(&mut self) -> DeviceResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIMULATED SINK
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SimulatedSink {
    params: DeviceParams,
    initialized: bool,
    buffer: Vec<Sample>,
    trigger: Receiver<()>,
    committed: Sender<Vec<Sample>>,
    dropped: u64,
}

impl fmt::Debug for SimulatedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedSink")
            .field("params", &self.params)
            .field("initialized", &self.initialized)
            .field("dropped", &self.dropped)
            .finish()
    }
}

/// Test side of a simulated sink
#[derive(Debug, Clone)]
pub struct SimulatedSinkControl {
    trigger: Sender<()>,
    committed: Receiver<Vec<Sample>>,
}

impl SimulatedSink {
    /// Create a closed sink. `capacity` bounds queued ticks and committed periods.
    pub fn new(params: DeviceParams, capacity: usize) -> (Self, SimulatedSinkControl) {
        let (trigger_tx, trigger_rx) = bounded(capacity.max(1));
        let (committed_tx, committed_rx) = bounded(capacity.max(1));
        let buffer = vec![0.0; params.period_size * params.num_channels];
        (
            Self {
                params,
                initialized: false,
                buffer,
                trigger: trigger_rx,
                committed: committed_tx,
                dropped: 0,
            },
            SimulatedSinkControl {
                trigger: trigger_tx,
                committed: committed_rx,
            },
        )
    }

    pub fn open(&mut self) -> DeviceResult<()> {
        self.params.validate()?;
        self.initialized = true;
        log::debug!("simulated sink '{}' open", self.params.name);
        Ok(())
    }

    /// Committed periods that did not fit into the control channel
    pub fn dropped_periods(&self) -> u64 {
        self.dropped
    }
}

impl SinkDevice for SimulatedSink {
    fn params(&self) -> &DeviceParams {
        &self.params
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn wait_for_period(&mut self, timeout: Duration) -> DeviceResult<()> {
        if !self.initialized {
            return Err(DeviceError::NotOpen(self.params.name.clone()));
        }
        match self.trigger.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Closed),
        }
    }

    fn period_buffer(&mut self) -> &mut [Sample] {
        &mut self.buffer
    }

    fn commit_period(&mut self) -> DeviceResult<()> {
        if !self.initialized {
            return Err(DeviceError::NotOpen(self.params.name.clone()));
        }
        match self.committed.try_send(self.buffer.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(DeviceError::Closed),
        }
    }
}

impl SimulatedSinkControl {
    /// Signal one period. False when the sink is gone or the tick queue is full.
    pub fn tick(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    pub fn recv_period(&self, timeout: Duration) -> Option<Vec<Sample>> {
        self.committed.recv_timeout(timeout).ok()
    }

    pub fn try_recv_period(&self) -> Option<Vec<Sample>> {
        self.committed.try_recv().ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Capture device feeding a ring. Clones share the ring.
#[derive(Debug, Clone)]
pub struct SourceDevice {
    id: SourceId,
    name: String,
    sample_rate: u32,
    ring: Arc<SourceRingBuffer>,
}

impl SourceDevice {
    pub fn new(
        id: SourceId,
        name: impl Into<String>,
        num_channels: usize,
        sample_rate: u32,
        ring_frames: usize,
    ) -> XbResult<Self> {
        Ok(Self {
            id,
            name: name.into(),
            sample_rate,
            ring: Arc::new(SourceRingBuffer::new(num_channels, ring_frames)?),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_channels(&self) -> usize {
        self.ring.num_channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn ring(&self) -> &Arc<SourceRingBuffer> {
        &self.ring
    }

    /// Produce interleaved frames; returns frames accepted
    pub fn write(&self, interleaved: &[Sample]) -> usize {
        self.ring.write(interleaved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_sink_round_trip() {
        let (mut sink, control) = SimulatedSink::new(DeviceParams::new("sim", 2, 48000, 4), 4);
        assert!(matches!(
            sink.wait_for_period(Duration::from_millis(1)),
            Err(DeviceError::NotOpen(_))
        ));
        sink.open().unwrap();

        assert!(control.tick());
        sink.wait_for_period(Duration::from_millis(10)).unwrap();
        sink.period_buffer()[0] = 0.5;
        sink.commit_period().unwrap();

        let period = control.try_recv_period().unwrap();
        assert_eq!(period.len(), 8);
        assert_eq!(period[0], 0.5);
    }

    #[test]
    fn test_wait_times_out() {
        let (mut sink, _control) = SimulatedSink::new(DeviceParams::new("sim", 1, 48000, 4), 1);
        sink.open().unwrap();
        assert_eq!(sink.wait_for_period(Duration::from_millis(5)), Err(DeviceError::Timeout));
    }

    #[test]
    fn test_closed_when_control_dropped() {
        let (mut sink, control) = SimulatedSink::new(DeviceParams::new("sim", 1, 48000, 4), 1);
        sink.open().unwrap();
        drop(control);
        assert_eq!(sink.wait_for_period(Duration::from_millis(5)), Err(DeviceError::Closed));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (mut sink, _control) = SimulatedSink::new(DeviceParams::new("bad", 0, 48000, 4), 1);
        assert!(matches!(sink.open(), Err(DeviceError::InvalidConfig(_))));
        assert!(!sink.is_initialized());
    }
}
