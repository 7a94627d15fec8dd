//! Engine configuration
//!
//! Defaults apply to every field missing from a JSON document, so a config
//! file only has to name what it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{XbError, XbResult};

/// SCHED_FIFO priorities accepted by the zone worker threads
pub const RT_PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 1..=99;

/// Engine-wide configuration shared by pipelines and routing zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames per period
    pub frame_length: usize,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Capacity of each module's command queue
    pub command_queue_capacity: usize,
    /// Capacity of each module's probe queue
    pub probe_queue_capacity: usize,
    /// Capacity of each switch matrix command queue
    pub matrix_queue_capacity: usize,
    /// Capacity of each routing zone event channel
    pub event_queue_capacity: usize,
    /// How long a zone thread waits for a sink period before reporting a timeout
    pub period_timeout_ms: u64,
    /// Elevate zone worker threads to real-time scheduling
    pub realtime_priority: bool,
    /// SCHED_FIFO priority used when `realtime_priority` is set, clamped to 1..=99
    pub rt_priority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_length: 256,
            sample_rate: 48000,
            command_queue_capacity: 64,
            probe_queue_capacity: 16,
            matrix_queue_capacity: 32,
            event_queue_capacity: 256,
            period_timeout_ms: 100,
            realtime_priority: false,
            rt_priority: 80,
        }
    }
}

impl EngineConfig {
    /// Parse from a JSON string and validate
    pub fn from_json(json: &str) -> XbResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> XbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| XbError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)?;
        log::debug!("engine config loaded from {}", path.display());
        Ok(config)
    }

    /// Reject sizes the engine cannot run with.
    ///
    /// An out-of-range `rt_priority` is only warned about; it is clamped when
    /// applied.
    pub fn validate(&self) -> XbResult<()> {
        if self.frame_length == 0 {
            return Err(XbError::Config("frame_length must be non-zero".into()));
        }
        if self.sample_rate == 0 {
            return Err(XbError::Config("sample_rate must be non-zero".into()));
        }
        if self.command_queue_capacity == 0
            || self.probe_queue_capacity == 0
            || self.matrix_queue_capacity == 0
            || self.event_queue_capacity == 0
        {
            return Err(XbError::Config("queue capacities must be non-zero".into()));
        }
        if self.period_timeout_ms == 0 {
            return Err(XbError::Config("period_timeout_ms must be non-zero".into()));
        }
        if self.realtime_priority && !RT_PRIORITY_RANGE.contains(&self.rt_priority) {
            log::warn!(
                "rt_priority {} is outside {:?} and will be clamped",
                self.rt_priority,
                RT_PRIORITY_RANGE
            );
        }
        Ok(())
    }

    /// Period duration in milliseconds
    pub fn period_ms(&self) -> f64 {
        self.frame_length as f64 / self.sample_rate as f64 * 1000.0
    }

    pub fn period_timeout(&self) -> Duration {
        Duration::from_millis(self.period_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.frame_length, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{ "frame_length": 64 }"#).unwrap();
        assert_eq!(config.frame_length, 64);
        assert_eq!(config.sample_rate, 48000);
    }

    #[test]
    fn test_zero_frame_length_rejected() {
        let err = EngineConfig::from_json(r#"{ "frame_length": 0 }"#).unwrap_err();
        assert!(matches!(err, XbError::Config(_)));
    }

    #[test]
    fn test_out_of_range_priority_is_not_fatal() {
        let config = EngineConfig {
            realtime_priority: true,
            rt_priority: 150,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!RT_PRIORITY_RANGE.contains(&config.rt_priority));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/xb-engine.json").unwrap_err();
        assert!(matches!(err, XbError::Config(_)));
    }

    #[test]
    fn test_period_ms() {
        let config = EngineConfig {
            frame_length: 480,
            sample_rate: 48000,
            ..Default::default()
        };
        assert!((config.period_ms() - 10.0).abs() < 1e-9);
    }
}
