//! Crossbar Demo Host
//!
//! Usage:
//!   xb-host                          - run the built-in two-source demo
//!   xb-host --config host.json       - run a JSON-described zone
//!   xb-host --dump-config            - print the effective config and exit
//!
//! Sine sources feed a routing zone whose simulated sink is clocked by a
//! timer thread. Zone statistics are logged when the run ends.

mod config;

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use xb_audio::{
    SimulatedSink, SimulatedSinkControl, SourceDevice, SourceId, ZoneEvent, ZonePortId, ZoneRegistry,
};
use xb_core::{EngineConfig, Sample, XbError, XbResult};
use xb_realtime::modules::GainMixer;
use xb_realtime::{AudioChain, LinkType, PinId, PinParams, Pipeline, Properties};

use config::{HostConfig, PortConfig, SourceConfig};

#[derive(Parser)]
#[command(name = "xb-host", about = "Crossbar routing zone demo")]
struct Cli {
    /// JSON host configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Periods to run before stopping
    #[arg(short, long, default_value_t = 200)]
    periods: u64,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => {
            let config = HostConfig::default();
            config.validate()?;
            config
        }
    };

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    run(&config, cli.periods)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SINE SOURCES
// ═══════════════════════════════════════════════════════════════════════════════

struct SineSource {
    device: SourceDevice,
    phase: f64,
    step: f64,
    amplitude: f32,
    scratch: Vec<Sample>,
}

impl SineSource {
    fn new(id: u32, config: &SourceConfig, sample_rate: u32, ring_frames: usize) -> XbResult<Self> {
        Ok(Self {
            device: SourceDevice::new(SourceId(id), config.name.clone(), config.channels, sample_rate, ring_frames)?,
            phase: 0.0,
            step: TAU * config.frequency / sample_rate as f64,
            amplitude: config.amplitude,
            scratch: Vec::new(),
        })
    }

    /// Produce one period, the same signal on every channel
    fn produce(&mut self, frames: usize) -> usize {
        let channels = self.device.num_channels();
        self.scratch.resize(frames * channels, 0.0);
        for frame in self.scratch.chunks_exact_mut(channels) {
            let value = self.phase.sin() as f32 * self.amplitude;
            frame.fill(value);
            self.phase = (self.phase + self.step) % TAU;
        }
        self.device.write(&self.scratch)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// One input pin per port, all summed into a single output pin
fn build_mixer(
    engine: &EngineConfig,
    ports: &[PortConfig],
    channels: usize,
    gains: &BTreeMap<String, f32>,
) -> XbResult<(AudioChain, Vec<(String, PinId)>, PinId)> {
    let mut p = Pipeline::new("host-mixer", engine)?;
    let output = p.create_audio_pin(PinParams::new("out", channels))?;
    let mix_out = p.create_audio_pin(PinParams::new("mixer.out", channels))?;
    p.add_audio_output_pin(output)?;

    let mut mixer = GainMixer::new();
    let mut pins = Vec::with_capacity(ports.len());
    for port in ports {
        let input = p.create_audio_pin(PinParams::new(format!("in.{}", port.name), port.channels))?;
        let mix_in = p.create_audio_pin(PinParams::new(format!("mixer.{}", port.name), port.channels))?;
        p.add_audio_input_pin(input)?;
        let gain = gains.get(&port.name).copied().unwrap_or(1.0);
        mixer = mixer.with_gain(mix_in, mix_out, gain);
        pins.push((port.name.clone(), input, mix_in));
    }

    let module = p.add_processing_module("mixer", Box::new(mixer), Properties::new())?;
    for &(_, input, mix_in) in &pins {
        p.add_audio_pin_mapping(module, mix_in, mix_out)?;
        p.link(input, mix_in, LinkType::Immediate)?;
    }
    p.link(mix_out, output, LinkType::Immediate)?;

    let chain = p.init_audio_chain()?;
    let inputs = pins.into_iter().map(|(name, input, _)| (name, input)).collect();
    Ok((chain, inputs, output))
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUN
// ═══════════════════════════════════════════════════════════════════════════════

fn run(config: &HostConfig, periods: u64) -> Result<()> {
    let zone_name = config.zone.name.as_str();
    let sink_params = config.zone.sink.clone();
    let frames = sink_params.period_size;

    let registry = ZoneRegistry::new(config.engine.clone())?;
    registry.create_zone(zone_name)?;

    let (mut sink, control) = SimulatedSink::new(sink_params.clone(), 8);
    sink.open()?;

    let mut sources = config
        .sources
        .iter()
        .enumerate()
        .map(|(i, s)| SineSource::new(i as u32, s, sink_params.sample_rate, frames * 4))
        .collect::<XbResult<Vec<_>>>()?;

    let events = registry
        .with_zone(zone_name, |zone| {
            zone.link_sink_device(Box::new(sink))?;

            let mut ports: HashMap<&str, ZonePortId> = HashMap::new();
            for port in &config.zone.ports {
                ports.insert(&port.name, zone.add_port(port.name.clone(), port.channels)?);
            }

            if let Some(mixer) = &config.mixer {
                let (chain, inputs, output) =
                    build_mixer(&config.engine, &config.zone.ports, sink_params.num_channels, &mixer.gains)?;
                zone.add_pipeline(chain)?;
                for (port, pin) in inputs {
                    let id = ports
                        .get(port.as_str())
                        .copied()
                        .ok_or_else(|| XbError::InvalidParam(format!("unknown port '{}'", port)))?;
                    zone.link_port_to_pipeline(id, pin)?;
                }
                zone.link_pipeline_to_sink(output, 0)?;
            }

            for (source, source_config) in sources.iter().zip(&config.sources) {
                let port = ports
                    .get(source_config.port.as_str())
                    .copied()
                    .ok_or_else(|| XbError::InvalidParam(format!("unknown port '{}'", source_config.port)))?;
                zone.connect_source(&source.device, port)?;
            }

            zone.start()?;
            Ok(zone.events())
        })
        .context("failed to set up zone")?;

    // prime one period so the first tick never underruns
    for source in &mut sources {
        source.produce(frames);
    }

    let running = Arc::new(AtomicBool::new(true));
    let clock = spawn_clock(Arc::clone(&running), control.clone(), sources, sink_params.period_duration(), frames)?;

    let timeout = sink_params.period_duration() * 4 + config.engine.period_timeout();
    let mut received = 0u64;
    let mut peak: Sample = 0.0;
    while received < periods {
        let Some(buffer) = control.recv_period(timeout) else {
            log::warn!("no period within {:?}, stopping early", timeout);
            break;
        };
        received += 1;
        let period_peak = buffer.iter().fold(0.0, |m: Sample, s| m.max(s.abs()));
        peak = peak.max(period_peak);
        log::debug!("period {}: peak {:.3}", received, period_peak);
    }

    running.store(false, Ordering::Release);
    clock.join().map_err(|_| anyhow!("clock thread panicked"))?;

    let stats = registry.with_zone(zone_name, |zone| {
        zone.stop()?;
        Ok(zone.stats())
    })?;

    for event in events.try_iter() {
        match event {
            ZoneEvent::StateChanged { .. } => log::debug!("{:?}", event),
            other => log::warn!("{:?}", other),
        }
    }

    log::info!(
        "zone '{}': {} periods ({} received), peak {:.3}, {} underruns, {} timeouts, {} processing failures, avg {:.1} us, max {:.1} us",
        zone_name,
        stats.periods,
        received,
        peak,
        stats.underruns,
        stats.timeouts,
        stats.processing_failures,
        stats.avg_period_time_us,
        stats.max_period_time_us
    );
    Ok(())
}

/// Timer thread: refill every source, then signal the sink period
fn spawn_clock(
    running: Arc<AtomicBool>,
    control: SimulatedSinkControl,
    mut sources: Vec<SineSource>,
    period: Duration,
    frames: usize,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("xb-clock".into())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                if !control.tick() {
                    log::debug!("tick dropped");
                }
                thread::sleep(period);
                for source in &mut sources {
                    if source.produce(frames) < frames {
                        log::debug!("source '{}' ring full", source.device.name());
                    }
                }
            }
        })
        .context("failed to spawn clock thread")
}
