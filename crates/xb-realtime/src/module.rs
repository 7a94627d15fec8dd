//! Processing-Module Core
//!
//! Uniform per-period execution contract around a user DSP module.
//!
//! ```text
//!  control thread                       audio thread
//! ┌──────────────┐  ControlMessage  ┌───────────────────────────────┐
//! │ ModuleHandle │ ───────────────▶ │ ModuleCore::process()         │
//! │              │  ProbeCommand    │  1. apply commands            │
//! │              │ ───────────────▶ │  2. drain probe queue         │
//! └──────────────┘                  │  3. input probes              │
//!                                   │  4. process_child()           │
//!                                   │  5. output probes             │
//!                                   └───────────────────────────────┘
//! ```

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xb_core::{EngineConfig, XbError, XbResult};

use crate::chain::StreamSet;
use crate::pipeline::{ModuleId, PinId};
use crate::probe::{DataProbe, ProbeCommand, ProbeDirection, ProbeInjection, ProbeRecording};
use crate::properties::Properties;
use crate::stream::StreamId;

/// Maximum probes attached to one module at a time
pub const MAX_PROBES_PER_MODULE: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════════
// COMMANDS & STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Out-of-band command for a module. The meaning of `code` is module specific.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleCommand {
    pub code: u32,
    pub pins: [Option<PinId>; 2],
    pub value: f64,
}

impl ModuleCommand {
    pub fn new(code: u32, value: f64) -> Self {
        Self {
            code,
            pins: [None, None],
            value,
        }
    }

    pub fn with_pins(mut self, first: PinId, second: Option<PinId>) -> Self {
        self.pins = [Some(first), second];
        self
    }
}

/// Outcome of one `ModuleCore::process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Processed,
    /// Module is disabled. Not an error.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ControlMessage {
    Enable,
    Disable,
    Command(ModuleCommand),
}

// ═══════════════════════════════════════════════════════════════════════════════
// STREAM MAPPING & MODULE CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Output stream to its ordered contributing input streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMapping {
    entries: Vec<(StreamId, SmallVec<[StreamId; 4]>)>,
}

impl StreamMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `input` to the contributors of `output`
    pub fn add(&mut self, input: StreamId, output: StreamId) -> XbResult<()> {
        if input == output {
            return Err(XbError::InvalidParam(format!(
                "{} cannot be mapped onto itself",
                input
            )));
        }
        match self.entries.iter_mut().find(|(out, _)| *out == output) {
            Some((_, inputs)) => {
                if inputs.contains(&input) {
                    return Err(XbError::InvalidParam(format!(
                        "{} is already mapped to {}",
                        input, output
                    )));
                }
                inputs.push(input);
            }
            None => {
                let mut inputs = SmallVec::new();
                inputs.push(input);
                self.entries.push((output, inputs));
            }
        }
        Ok(())
    }

    pub fn inputs_of(&self, output: StreamId) -> &[StreamId] {
        self.entries
            .iter()
            .find(|(out, _)| *out == output)
            .map(|(_, inputs)| inputs.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &[StreamId])> {
        self.entries.iter().map(|(out, inputs)| (*out, inputs.as_slice()))
    }

    pub fn outputs(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.entries.iter().map(|(out, _)| *out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pin of a module and the stream it resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinBinding {
    pub pin: PinId,
    pub stream: StreamId,
    pub num_channels: usize,
}

/// Everything a module learns at init
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub id: ModuleId,
    pub name: String,
    pub frame_length: usize,
    pub sample_rate: u32,
    pub properties: Properties,
    in_place: Vec<StreamId>,
    mapping: StreamMapping,
    pins: Vec<PinBinding>,
}

impl ModuleConfig {
    pub fn new(
        id: ModuleId,
        name: impl Into<String>,
        frame_length: usize,
        sample_rate: u32,
        properties: Properties,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            frame_length,
            sample_rate,
            properties,
            in_place: Vec::new(),
            mapping: StreamMapping::new(),
            pins: Vec::new(),
        }
    }

    pub fn add_in_place_stream(&mut self, stream: StreamId) {
        if !self.in_place.contains(&stream) {
            self.in_place.push(stream);
        }
    }

    pub fn add_mapping(&mut self, input: StreamId, output: StreamId) -> XbResult<()> {
        self.mapping.add(input, output)
    }

    pub fn bind_pin(&mut self, pin: PinId, stream: StreamId, num_channels: usize) {
        if !self.pins.iter().any(|b| b.pin == pin) {
            self.pins.push(PinBinding {
                pin,
                stream,
                num_channels,
            });
        }
    }

    /// Streams processed in place
    pub fn streams_to_process(&self) -> &[StreamId] {
        &self.in_place
    }

    pub fn stream_mapping(&self) -> &StreamMapping {
        &self.mapping
    }

    pub fn pins(&self) -> &[PinBinding] {
        &self.pins
    }

    pub fn stream_of_pin(&self, pin: PinId) -> XbResult<StreamId> {
        self.pins
            .iter()
            .find(|b| b.pin == pin)
            .map(|b| b.stream)
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a pin of module '{}'", pin, self.name)))
    }

    /// Whether a probe in `direction` may attach to `stream`
    pub fn handles_stream(&self, stream: StreamId, direction: ProbeDirection) -> bool {
        if self.in_place.contains(&stream) {
            return true;
        }
        match direction {
            ProbeDirection::Input => self.mapping.iter().any(|(_, inputs)| inputs.contains(&stream)),
            ProbeDirection::Output => self.mapping.outputs().any(|out| out == stream),
        }
    }

    /// Every stream this module reads, in-place streams first
    pub fn input_streams(&self) -> Vec<StreamId> {
        let mut streams = self.in_place.clone();
        for (_, inputs) in self.mapping.iter() {
            for &s in inputs {
                if !streams.contains(&s) {
                    streams.push(s);
                }
            }
        }
        streams
    }

    /// Every stream this module writes, in-place streams first
    pub fn output_streams(&self) -> Vec<StreamId> {
        let mut streams = self.in_place.clone();
        for out in self.mapping.outputs() {
            if !streams.contains(&out) {
                streams.push(out);
            }
        }
        streams
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// DSP module driven by a `ModuleCore`
pub trait ProcessingModule: Send {
    /// Type name used in logs
    fn type_name(&self) -> &'static str;

    /// Called once from `init_audio_chain`, before the first period
    fn init(&mut self, _config: &ModuleConfig) -> XbResult<()> {
        Ok(())
    }

    /// Clear internal filter or ramp state
    fn reset(&mut self) {}

    /// Module-specific DSP step for one period
    fn process_child(&mut self, config: &ModuleConfig, streams: &mut StreamSet) -> XbResult<()>;

    /// Apply a command on the audio thread
    fn handle_command(&mut self, _config: &ModuleConfig, command: &ModuleCommand) -> XbResult<()> {
        Err(XbError::InvalidParam(format!(
            "{} does not accept command {}",
            self.type_name(),
            command.code
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE CORE (audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Audio-thread wrapper of one module
pub struct ModuleCore {
    module: Box<dyn ProcessingModule>,
    config: ModuleConfig,
    state: ModuleState,
    control: Consumer<ControlMessage>,
    probe_queue: Consumer<ProbeCommand>,
    probes: Vec<DataProbe>,
}

impl ModuleCore {
    /// Wrap an initialized module. Returns the core and its control handle.
    pub fn new(
        module: Box<dyn ProcessingModule>,
        config: ModuleConfig,
        engine: &EngineConfig,
        enabled: bool,
    ) -> (Self, ModuleHandle) {
        let (control_tx, control) = RingBuffer::new(engine.command_queue_capacity.max(1));
        let (probe_tx, probe_queue) = RingBuffer::new(engine.probe_queue_capacity.max(1));

        let handle = ModuleHandle {
            id: config.id,
            name: config.name.clone(),
            frame_length: config.frame_length,
            pins: config.pins.clone(),
            control: control_tx,
            probes: probe_tx,
        };
        let core = Self {
            module,
            config,
            state: if enabled {
                ModuleState::Enabled
            } else {
                ModuleState::Disabled
            },
            control,
            probe_queue,
            probes: Vec::with_capacity(MAX_PROBES_PER_MODULE),
        };
        (core, handle)
    }

    pub fn id(&self) -> ModuleId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn type_name(&self) -> &'static str {
        self.module.type_name()
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ModuleState::Enabled
    }

    pub fn active_probes(&self) -> usize {
        self.probes.len()
    }

    /// Reset the module, then enable it
    pub fn enable_processing(&mut self) {
        self.module.reset();
        self.state = ModuleState::Enabled;
    }

    /// Disable without touching module state
    pub fn disable_processing(&mut self) {
        self.state = ModuleState::Disabled;
    }

    /// Run one period
    pub fn process(&mut self, streams: &mut StreamSet) -> XbResult<ProcessStatus> {
        self.apply_control_messages();

        if self.state == ModuleState::Disabled {
            self.drain_probe_queue();
            return Ok(ProcessStatus::Off);
        }

        self.drain_probe_queue();
        self.run_probes(ProbeDirection::Input, streams);

        let result = self.module.process_child(&self.config, streams);
        if result.is_ok() {
            self.run_probes(ProbeDirection::Output, streams);
        }
        self.probes.retain(|p| !p.is_finished());

        result.map(|_| ProcessStatus::Processed)
    }

    fn apply_control_messages(&mut self) {
        while let Ok(message) = self.control.pop() {
            match message {
                ControlMessage::Enable => self.enable_processing(),
                ControlMessage::Disable => self.disable_processing(),
                ControlMessage::Command(command) => {
                    if let Err(e) = self.module.handle_command(&self.config, &command) {
                        log::warn!("module '{}': command {} rejected: {}", self.config.name, command.code, e);
                    }
                }
            }
        }
    }

    fn drain_probe_queue(&mut self) {
        while let Ok(command) = self.probe_queue.pop() {
            match command {
                ProbeCommand::Start(probe) => {
                    if !self.config.handles_stream(probe.stream(), probe.direction()) {
                        log::warn!(
                            "module '{}': probe rejected, {} is not an {:?} stream of this module",
                            self.config.name,
                            probe.stream(),
                            probe.direction()
                        );
                        continue;
                    }
                    self.probes
                        .retain(|p| !(p.stream() == probe.stream() && p.direction() == probe.direction()));
                    if self.probes.len() >= MAX_PROBES_PER_MODULE {
                        log::warn!("module '{}': probe rejected, too many probes", self.config.name);
                        continue;
                    }
                    self.probes.push(probe);
                }
                ProbeCommand::Stop { stream, direction } => {
                    self.probes
                        .retain(|p| !(p.stream() == stream && p.direction() == direction));
                }
            }
        }
    }

    fn run_probes(&mut self, direction: ProbeDirection, streams: &mut StreamSet) {
        let name = &self.config.name;
        for probe in self.probes.iter_mut().filter(|p| p.direction() == direction) {
            let result = streams
                .stream_mut(probe.stream())
                .and_then(|(stream, bundles)| probe.run(stream, bundles));
            if let Err(e) = result {
                log::warn!("module '{}': probe error: {}", name, e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE HANDLE (control thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Control-side handle of one module. Safe to use while the audio thread runs.
pub struct ModuleHandle {
    id: ModuleId,
    name: String,
    frame_length: usize,
    pins: Vec<PinBinding>,
    control: Producer<ControlMessage>,
    probes: Producer<ProbeCommand>,
}

impl ModuleHandle {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send_command(&mut self, command: ModuleCommand) -> XbResult<()> {
        self.push_control(ControlMessage::Command(command))
    }

    pub fn enable(&mut self) -> XbResult<()> {
        self.push_control(ControlMessage::Enable)
    }

    pub fn disable(&mut self) -> XbResult<()> {
        self.push_control(ControlMessage::Disable)
    }

    /// Record `num_frames` frames of the stream behind `pin`
    pub fn start_recording(
        &mut self,
        pin: PinId,
        direction: ProbeDirection,
        num_frames: usize,
    ) -> XbResult<ProbeRecording> {
        let binding = self.binding(pin)?;
        let (probe, recording) = DataProbe::record(
            binding.stream,
            direction,
            binding.num_channels,
            self.frame_length,
            num_frames,
        )?;
        self.push_probe(ProbeCommand::Start(probe))?;
        Ok(recording)
    }

    /// Replace `num_frames` frames of the stream behind `pin` with injected data
    pub fn start_injection(
        &mut self,
        pin: PinId,
        direction: ProbeDirection,
        num_frames: usize,
    ) -> XbResult<ProbeInjection> {
        let binding = self.binding(pin)?;
        let (probe, injection) = DataProbe::inject(
            binding.stream,
            direction,
            binding.num_channels,
            self.frame_length,
            num_frames,
        )?;
        self.push_probe(ProbeCommand::Start(probe))?;
        Ok(injection)
    }

    pub fn stop_probe(&mut self, pin: PinId, direction: ProbeDirection) -> XbResult<()> {
        let stream = self.binding(pin)?.stream;
        self.push_probe(ProbeCommand::Stop { stream, direction })
    }

    fn binding(&self, pin: PinId) -> XbResult<PinBinding> {
        self.pins
            .iter()
            .find(|b| b.pin == pin)
            .copied()
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a pin of module '{}'", pin, self.name)))
    }

    fn push_control(&mut self, message: ControlMessage) -> XbResult<()> {
        self.control
            .push(message)
            .map_err(|_| XbError::NoSpaceLeft(format!("command queue of module '{}' is full", self.name)))
    }

    fn push_probe(&mut self, command: ProbeCommand) -> XbResult<()> {
        self.probes
            .push(command)
            .map_err(|_| XbError::NoSpaceLeft(format!("probe queue of module '{}' is full", self.name)))
    }
}
