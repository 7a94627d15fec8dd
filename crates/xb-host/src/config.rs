//! Host configuration (JSON)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use xb_audio::DeviceParams;
use xb_core::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub channels: usize,
}

/// Sine generator feeding one zone port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub channels: usize,
    pub frequency: f64,
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    pub port: String,
}

fn default_amplitude() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub sink: DeviceParams,
    pub ports: Vec<PortConfig>,
}

/// Gain mixer summing every port into the sink. Missing ports get unity gain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default)]
    pub gains: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub zone: ZoneConfig,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub mixer: Option<MixerConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let sink = DeviceParams::new("sim-out", 2, engine.sample_rate, engine.frame_length);
        Self {
            zone: ZoneConfig {
                name: "main".into(),
                sink,
                ports: vec![
                    PortConfig {
                        name: "music".into(),
                        channels: 2,
                    },
                    PortConfig {
                        name: "voice".into(),
                        channels: 2,
                    },
                ],
            },
            sources: vec![
                SourceConfig {
                    name: "tone-a".into(),
                    channels: 2,
                    frequency: 440.0,
                    amplitude: 0.5,
                    port: "music".into(),
                },
                SourceConfig {
                    name: "tone-b".into(),
                    channels: 2,
                    frequency: 660.0,
                    amplitude: 0.3,
                    port: "voice".into(),
                },
            ],
            mixer: Some(MixerConfig {
                gains: BTreeMap::from([("music".to_string(), 0.7), ("voice".to_string(), 1.0)]),
            }),
            engine,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: HostConfig =
            serde_json::from_str(&json).with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.zone.sink.validate()?;

        if self.zone.sink.period_size != self.engine.frame_length {
            bail!(
                "sink period {} differs from engine frame length {}",
                self.zone.sink.period_size,
                self.engine.frame_length
            );
        }
        for source in &self.sources {
            let Some(port) = self.zone.ports.iter().find(|p| p.name == source.port) else {
                bail!("source '{}' targets unknown port '{}'", source.name, source.port);
            };
            if port.channels != source.channels {
                bail!(
                    "source '{}' has {} channels, port '{}' has {}",
                    source.name,
                    source.channels,
                    port.name,
                    port.channels
                );
            }
        }
        if self.mixer.is_some() {
            if let Some(port) = self.zone.ports.iter().find(|p| p.channels != self.zone.sink.num_channels) {
                bail!(
                    "mixer needs {}-channel ports, '{}' has {}",
                    self.zone.sink.num_channels,
                    port.name,
                    port.channels
                );
            }
        } else {
            let total: usize = self.zone.ports.iter().map(|p| p.channels).sum();
            if total > self.zone.sink.num_channels {
                log::warn!(
                    "ports carry {} channels, sink '{}' only {}; the rest is dropped",
                    total,
                    self.zone.sink.name,
                    self.zone.sink.num_channels
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        HostConfig::default().validate().unwrap();
    }

    #[test]
    fn test_json_round_trip_keeps_defaults() {
        let json = r#"{
            "zone": {
                "name": "z",
                "sink": { "name": "s", "num_channels": 1, "sample_rate": 48000,
                          "period_size": 256, "num_periods": 2, "clock": "Provided" },
                "ports": [ { "name": "p", "channels": 1 } ]
            },
            "sources": [ { "name": "a", "channels": 1, "frequency": 100.0, "port": "p" } ]
        }"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.sources[0].amplitude, 0.5);
        assert!(config.mixer.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_mismatched_source() {
        let mut config = HostConfig::default();
        config.sources[0].channels = 1;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.sources[1].port = "missing".into();
        assert!(config.validate().is_err());
    }
}
