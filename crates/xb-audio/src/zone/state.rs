//! Zone state machine, statistics and events

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use portable_atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use xb_core::XbError;

use crate::device::SourceId;
use crate::switch_matrix::ZonePortId;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ZoneState {
    Inactive = 0,
    /// Buffers are being prepared; the worker thread is not running yet
    Prepare = 1,
    Active = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneTransition {
    Prepare,
    Activate,
    Inactivate,
}

impl ZoneState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ZoneState::Prepare,
            2 => ZoneState::Active,
            _ => ZoneState::Inactive,
        }
    }

    /// Next state. Redundant transitions keep the current state.
    pub fn apply(self, transition: ZoneTransition) -> ZoneState {
        use ZoneState::*;
        use ZoneTransition as T;
        match (self, transition) {
            (Inactive, T::Prepare) => Prepare,
            (Inactive, T::Activate) => Inactive,
            (Prepare, T::Prepare) => Prepare,
            (Prepare, T::Activate) => Active,
            (Active, T::Prepare | T::Activate) => Active,
            (_, T::Inactivate) => Inactive,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of [`ZoneStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneStatsSnapshot {
    pub periods: u64,
    pub processing_failures: u64,
    pub underruns: u64,
    pub timeouts: u64,
    pub device_errors: u64,
    pub avg_period_time_us: f64,
    pub max_period_time_us: f64,
}

/// Atomic statistics for real-time access
#[derive(Debug, Default)]
pub struct ZoneStats {
    periods: AtomicU64,
    total_period_time_us: AtomicU64,
    max_period_time_us: AtomicU64,
    processing_failures: AtomicU64,
    underruns: AtomicU64,
    timeouts: AtomicU64,
    device_errors: AtomicU64,
}

impl ZoneStats {
    /// Record a completed period
    pub fn record_period(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.periods.fetch_add(1, Ordering::Relaxed);
        self.total_period_time_us.fetch_add(us, Ordering::Relaxed);
        self.max_period_time_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_processing_failure(&self) {
        self.processing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ZoneStatsSnapshot {
        let periods = self.periods.load(Ordering::Relaxed);
        let total = self.total_period_time_us.load(Ordering::Relaxed);
        ZoneStatsSnapshot {
            periods,
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            avg_period_time_us: if periods > 0 {
                total as f64 / periods as f64
            } else {
                0.0
            },
            max_period_time_us: self.max_period_time_us.load(Ordering::Relaxed) as f64,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.periods,
            &self.total_period_time_us,
            &self.max_period_time_us,
            &self.processing_failures,
            &self.underruns,
            &self.timeouts,
            &self.device_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Asynchronous notification from a zone
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    StateChanged {
        zone: Arc<str>,
        state: ZoneState,
    },
    ProcessingFailed {
        zone: Arc<str>,
        error: XbError,
    },
    SourceUnderrun {
        zone: Arc<str>,
        source: SourceId,
        port: ZonePortId,
        missing_frames: usize,
    },
    DeviceTimeout {
        zone: Arc<str>,
    },
    DeviceError {
        zone: Arc<str>,
        message: String,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// State shared between a zone's control side and its worker thread
#[derive(Debug)]
pub struct ZoneShared {
    name: Arc<str>,
    state: AtomicU8,
    running: AtomicBool,
    stats: ZoneStats,
    events: Sender<ZoneEvent>,
}

impl ZoneShared {
    pub(crate) fn new(name: Arc<str>, events: Sender<ZoneEvent>) -> Self {
        Self {
            name,
            state: AtomicU8::new(ZoneState::Inactive as u8),
            running: AtomicBool::new(false),
            stats: ZoneStats::default(),
            events,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn state(&self) -> ZoneState {
        ZoneState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &ZoneStats {
        &self.stats
    }

    /// Apply a transition; emits `StateChanged` only on an actual change
    pub fn transition(&self, transition: ZoneTransition) -> ZoneState {
        let mut previous = self.state();
        loop {
            let next = previous.apply(transition);
            if next == previous {
                return previous;
            }
            match self.state.compare_exchange(
                previous as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.emit(ZoneEvent::StateChanged {
                        zone: Arc::clone(&self.name),
                        state: next,
                    });
                    return next;
                }
                Err(actual) => previous = ZoneState::from_u8(actual),
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Never blocks; events are dropped when nobody drains the channel
    pub(crate) fn emit(&self, event: ZoneEvent) {
        let _ = self.events.try_send(event);
    }
}
