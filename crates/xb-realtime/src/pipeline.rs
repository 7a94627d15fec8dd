//! Pipeline setup
//!
//! A pipeline is built from pins, processing modules and links between pins.
//! `init_audio_chain` freezes it into an executable [`AudioChain`]:
//!
//! - pins joined by immediate links share one stream
//! - every distinct stream gets its bundle lanes from the sequencer
//! - modules are ordered topologically over immediate links
//! - delayed links become end-of-period copies, so the consumer sees the
//!   producer's previous period
//!
//! Every setup call validates before it mutates, so a failed call leaves the
//! pipeline unchanged. Once initialized, all setup calls fail with `Failed`.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use xb_core::{EngineConfig, XbError, XbResult};

use crate::chain::{AudioChain, ChainPort, DelayedCopy, StreamSet};
use crate::module::{ModuleConfig, ModuleCore, ProcessingModule};
use crate::properties::Properties;
use crate::stream::{StreamDescriptor, StreamId, StreamType};

// ═══════════════════════════════════════════════════════════════════════════════
// IDS & PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinId(pub u32);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pin#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinParams {
    pub name: String,
    pub num_channels: usize,
    #[serde(default)]
    pub has_sid: bool,
}

impl PinParams {
    pub fn new(name: impl Into<String>, num_channels: usize) -> Self {
        Self {
            name: name.into(),
            num_channels,
            has_sid: false,
        }
    }

    pub fn with_sid(mut self) -> Self {
        self.has_sid = true;
        self
    }
}

/// What a pin is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRole {
    Unassigned,
    PipelineInput,
    PipelineOutput,
    ModuleInput(ModuleId),
    ModuleOutput(ModuleId),
    /// In-place pin, both read and written by the module
    ModuleInOut(ModuleId),
}

impl PinRole {
    /// May be the source of a link
    pub fn produces(self) -> bool {
        matches!(
            self,
            PinRole::PipelineInput | PinRole::ModuleOutput(_) | PinRole::ModuleInOut(_)
        )
    }

    /// May be the target of a link
    pub fn consumes(self) -> bool {
        matches!(
            self,
            PinRole::PipelineOutput | PinRole::ModuleInput(_) | PinRole::ModuleInOut(_)
        )
    }

    pub fn module(self) -> Option<ModuleId> {
        match self {
            PinRole::ModuleInput(m) | PinRole::ModuleOutput(m) | PinRole::ModuleInOut(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Immediate,
    /// One period of lag; legal inside feedback cycles
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub from: PinId,
    pub to: PinId,
    pub link_type: LinkType,
}

struct PinEntry {
    params: PinParams,
    role: PinRole,
}

struct ModuleEntry {
    name: String,
    module: Box<dyn ProcessingModule>,
    properties: Properties,
    in_out: Vec<PinId>,
    mappings: Vec<(PinId, PinId)>,
    enabled: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Pipeline {
    name: String,
    config: EngineConfig,
    pins: Vec<PinEntry>,
    modules: Vec<ModuleEntry>,
    links: Vec<Link>,
    inputs: Vec<PinId>,
    outputs: Vec<PinId>,
    initialized: bool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("pins", &self.pins.len())
            .field("modules", &self.modules.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("links", &self.links)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>, config: &EngineConfig) -> XbResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config: config.clone(),
            pins: Vec::new(),
            modules: Vec::new(),
            links: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            initialized: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_length(&self) -> usize {
        self.config.frame_length
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn input_pins(&self) -> &[PinId] {
        &self.inputs
    }

    pub fn output_pins(&self) -> &[PinId] {
        &self.outputs
    }

    pub fn pin_params(&self, pin: PinId) -> XbResult<&PinParams> {
        self.pin(pin).map(|p| &p.params)
    }

    pub fn pin_role(&self, pin: PinId) -> XbResult<PinRole> {
        self.pin(pin).map(|p| p.role)
    }

    pub fn find_pin(&self, name: &str) -> Option<PinId> {
        self.pins
            .iter()
            .position(|p| p.params.name == name)
            .map(|i| PinId(i as u32))
    }

    fn pin(&self, pin: PinId) -> XbResult<&PinEntry> {
        self.pins
            .get(pin.0 as usize)
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not part of pipeline '{}'", pin, self.name)))
    }

    fn module(&self, id: ModuleId) -> XbResult<&ModuleEntry> {
        self.modules
            .get(id.0 as usize)
            .ok_or_else(|| XbError::InvalidParam(format!("{} is not part of pipeline '{}'", id, self.name)))
    }

    fn ensure_setup(&self) -> XbResult<()> {
        if self.initialized {
            return Err(XbError::Failed(format!(
                "pipeline '{}' is initialized and can no longer be changed",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_unassigned(&self, pin: PinId) -> XbResult<()> {
        let entry = self.pin(pin)?;
        if entry.role != PinRole::Unassigned {
            return Err(XbError::Failed(format!(
                "pin '{}' is already used as {:?}",
                entry.params.name, entry.role
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Setup
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_audio_pin(&mut self, params: PinParams) -> XbResult<PinId> {
        self.ensure_setup()?;
        if params.num_channels == 0 {
            return Err(XbError::InvalidParam(format!("pin '{}' has no channels", params.name)));
        }
        if self.pins.iter().any(|p| p.params.name == params.name) {
            return Err(XbError::InvalidParam(format!("pin '{}' already exists", params.name)));
        }
        let id = PinId(self.pins.len() as u32);
        log::debug!("pipeline '{}': created {} '{}' ({} ch)", self.name, id, params.name, params.num_channels);
        self.pins.push(PinEntry {
            params,
            role: PinRole::Unassigned,
        });
        Ok(id)
    }

    pub fn add_audio_input_pin(&mut self, pin: PinId) -> XbResult<()> {
        self.ensure_setup()?;
        self.ensure_unassigned(pin)?;
        self.pins[pin.0 as usize].role = PinRole::PipelineInput;
        self.inputs.push(pin);
        Ok(())
    }

    pub fn add_audio_output_pin(&mut self, pin: PinId) -> XbResult<()> {
        self.ensure_setup()?;
        self.ensure_unassigned(pin)?;
        self.pins[pin.0 as usize].role = PinRole::PipelineOutput;
        self.outputs.push(pin);
        Ok(())
    }

    pub fn add_processing_module(
        &mut self,
        name: impl Into<String>,
        module: Box<dyn ProcessingModule>,
        properties: Properties,
    ) -> XbResult<ModuleId> {
        self.ensure_setup()?;
        let name = name.into();
        if self.modules.iter().any(|m| m.name == name) {
            return Err(XbError::InvalidParam(format!("module '{}' already exists", name)));
        }
        let id = ModuleId(self.modules.len() as u32);
        log::debug!("pipeline '{}': added {} '{}' ({})", self.name, id, name, module.type_name());
        self.modules.push(ModuleEntry {
            name,
            module,
            properties,
            in_out: Vec::new(),
            mappings: Vec::new(),
            enabled: true,
        });
        Ok(id)
    }

    /// Initial state of a module once the chain starts
    pub fn set_module_enabled(&mut self, module: ModuleId, enabled: bool) -> XbResult<()> {
        self.ensure_setup()?;
        self.module(module)?;
        self.modules[module.0 as usize].enabled = enabled;
        Ok(())
    }

    /// Attach an in-place pin to a module
    pub fn add_audio_in_out_pin(&mut self, module: ModuleId, pin: PinId) -> XbResult<()> {
        self.ensure_setup()?;
        self.module(module)?;
        self.ensure_unassigned(pin)?;
        self.pins[pin.0 as usize].role = PinRole::ModuleInOut(module);
        self.modules[module.0 as usize].in_out.push(pin);
        Ok(())
    }

    /// Map a module input pin onto a module output pin
    pub fn add_audio_pin_mapping(&mut self, module: ModuleId, input: PinId, output: PinId) -> XbResult<()> {
        self.ensure_setup()?;
        let entry = self.module(module)?;
        let (in_pin, out_pin) = (self.pin(input)?, self.pin(output)?);

        if input == output {
            return Err(XbError::InvalidParam(format!("pin '{}' mapped onto itself", in_pin.params.name)));
        }
        if !matches!(in_pin.role, PinRole::Unassigned) && in_pin.role != PinRole::ModuleInput(module) {
            return Err(XbError::Failed(format!(
                "pin '{}' is already used as {:?}",
                in_pin.params.name, in_pin.role
            )));
        }
        if !matches!(out_pin.role, PinRole::Unassigned) && out_pin.role != PinRole::ModuleOutput(module) {
            return Err(XbError::Failed(format!(
                "pin '{}' is already used as {:?}",
                out_pin.params.name, out_pin.role
            )));
        }
        if in_pin.params.num_channels != out_pin.params.num_channels {
            return Err(XbError::InvalidParam(format!(
                "pin '{}' has {} channels, pin '{}' has {}",
                in_pin.params.name, in_pin.params.num_channels, out_pin.params.name, out_pin.params.num_channels
            )));
        }
        if entry.mappings.contains(&(input, output)) {
            return Err(XbError::InvalidParam(format!(
                "mapping '{}' -> '{}' already exists",
                in_pin.params.name, out_pin.params.name
            )));
        }

        self.pins[input.0 as usize].role = PinRole::ModuleInput(module);
        self.pins[output.0 as usize].role = PinRole::ModuleOutput(module);
        self.modules[module.0 as usize].mappings.push((input, output));
        Ok(())
    }

    pub fn link(&mut self, from: PinId, to: PinId, link_type: LinkType) -> XbResult<()> {
        self.ensure_setup()?;
        let (src, dst) = (self.pin(from)?, self.pin(to)?);

        if from == to {
            return Err(XbError::Failed(format!("pin '{}' linked to itself", src.params.name)));
        }
        if !src.role.produces() {
            return Err(XbError::Failed(format!(
                "pin '{}' ({:?}) cannot be a link source",
                src.params.name, src.role
            )));
        }
        if !dst.role.consumes() {
            return Err(XbError::Failed(format!(
                "pin '{}' ({:?}) cannot be a link target",
                dst.params.name, dst.role
            )));
        }
        if src.params.num_channels != dst.params.num_channels || src.params.has_sid != dst.params.has_sid {
            return Err(XbError::InvalidParam(format!(
                "pins '{}' and '{}' have different formats",
                src.params.name, dst.params.name
            )));
        }
        if self.links.iter().any(|l| l.to == to) {
            return Err(XbError::Failed(format!("pin '{}' already has an incoming link", dst.params.name)));
        }

        log::debug!(
            "pipeline '{}': link '{}' -> '{}' ({:?})",
            self.name,
            src.params.name,
            dst.params.name,
            link_type
        );
        self.links.push(Link { from, to, link_type });
        Ok(())
    }

    pub fn unlink(&mut self, from: PinId, to: PinId) -> XbResult<()> {
        self.ensure_setup()?;
        let index = self
            .links
            .iter()
            .position(|l| l.from == from && l.to == to)
            .ok_or_else(|| XbError::Failed(format!("no link from {} to {}", from, to)))?;
        self.links.remove(index);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Initialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve streams, bundles and execution order, and build the chain.
    ///
    /// On failure the pipeline stays in setup state.
    pub fn init_audio_chain(&mut self) -> XbResult<AudioChain> {
        self.ensure_setup()?;

        let order = self.execution_order()?;
        let pin_stream = self.resolve_streams();
        let descriptors = self.stream_descriptors(&pin_stream);
        let mut streams = StreamSet::from_descriptors(self.config.frame_length, descriptors)?;

        let stream_of = |pin: PinId| -> XbResult<StreamId> {
            pin_stream
                .get(pin.0 as usize)
                .copied()
                .flatten()
                .ok_or_else(|| XbError::InvalidPin(format!("{} has no stream", pin)))
        };

        let mut configs = Vec::with_capacity(order.len());
        for &index in &order {
            let entry = &self.modules[index];
            let mut config = ModuleConfig::new(
                ModuleId(index as u32),
                entry.name.clone(),
                self.config.frame_length,
                self.config.sample_rate,
                entry.properties.clone(),
            );
            for &pin in &entry.in_out {
                let stream = stream_of(pin)?;
                config.add_in_place_stream(stream);
                config.bind_pin(pin, stream, self.pins[pin.0 as usize].params.num_channels);
            }
            for &(input, output) in &entry.mappings {
                let (si, so) = (stream_of(input)?, stream_of(output)?);
                config.add_mapping(si, so)?;
                config.bind_pin(input, si, self.pins[input.0 as usize].params.num_channels);
                config.bind_pin(output, so, self.pins[output.0 as usize].params.num_channels);
            }
            configs.push(config);
        }

        for (&index, config) in order.iter().zip(&configs) {
            let entry = &mut self.modules[index];
            if let Err(e) = entry.module.init(config) {
                log::error!("pipeline '{}': init of module '{}' failed: {}", self.name, entry.name, e);
                return Err(e);
            }
        }

        let mut delayed = Vec::new();
        for link in self.links.iter().filter(|l| l.link_type == LinkType::Delayed) {
            let (source, target) = (stream_of(link.from)?, stream_of(link.to)?);
            if source == target {
                return Err(XbError::Failed(format!(
                    "delayed link {} -> {} resolves to a single stream",
                    link.from, link.to
                )));
            }
            let channels = self.pins[link.from.0 as usize].params.num_channels;
            delayed.push(DelayedCopy {
                source,
                target,
                scratch: vec![vec![0.0; self.config.frame_length]; channels],
            });
        }

        let mut inputs = Vec::with_capacity(self.inputs.len());
        let mut input_streams: Vec<StreamId> = Vec::new();
        for &pin in &self.inputs {
            let stream = stream_of(pin)?;
            streams.stream_mut(stream)?.0.attach_input_frame();
            if !input_streams.contains(&stream) {
                input_streams.push(stream);
            }
            inputs.push(self.chain_port(pin, stream));
        }
        let mut outputs = Vec::with_capacity(self.outputs.len());
        let mut output_streams: Vec<StreamId> = Vec::new();
        for &pin in &self.outputs {
            let stream = stream_of(pin)?;
            streams.stream_mut(stream)?.0.attach_output_frame();
            if !output_streams.contains(&stream) {
                output_streams.push(stream);
            }
            outputs.push(self.chain_port(pin, stream));
        }

        // Nothing below can fail: hand the modules over.
        let mut slots: Vec<Option<ModuleEntry>> = std::mem::take(&mut self.modules)
            .into_iter()
            .map(Some)
            .collect();
        let mut cores = Vec::with_capacity(order.len());
        let mut handles = Vec::with_capacity(order.len());
        for (index, config) in order.iter().copied().zip(configs) {
            if let Some(entry) = slots[index].take() {
                let (core, handle) = ModuleCore::new(entry.module, config, &self.config, entry.enabled);
                cores.push(core);
                handles.push(handle);
            }
        }
        self.initialized = true;

        log::info!(
            "pipeline '{}': audio chain ready, {} module(s), {} stream(s), {} bundle(s), {} delayed link(s)",
            self.name,
            cores.len(),
            streams.len(),
            streams.bundles().total_bundles(),
            delayed.len()
        );

        Ok(AudioChain {
            name: self.name.clone(),
            sample_rate: self.config.sample_rate,
            streams,
            modules: cores,
            handles,
            inputs,
            outputs,
            input_streams,
            output_streams,
            delayed,
            periods: 0,
        })
    }

    fn chain_port(&self, pin: PinId, stream: StreamId) -> ChainPort {
        let params = &self.pins[pin.0 as usize].params;
        ChainPort {
            pin,
            name: params.name.clone(),
            num_channels: params.num_channels,
            stream,
        }
    }

    /// Topological order of module indices over immediate links.
    ///
    /// Ties are broken by creation order.
    fn execution_order(&self) -> XbResult<Vec<usize>> {
        let n = self.modules.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for link in self.links.iter().filter(|l| l.link_type == LinkType::Immediate) {
            let from = self.pins[link.from.0 as usize].role.module();
            let to = self.pins[link.to.0 as usize].role.module();
            if let (Some(a), Some(b)) = (from, to) {
                let (a, b) = (a.0 as usize, b.0 as usize);
                if a == b {
                    return Err(XbError::Failed(format!(
                        "module '{}' feeds itself through an immediate link",
                        self.modules[a].name
                    )));
                }
                successors[a].push(b);
                in_degree[b] += 1;
            }
        }

        // Kahn's algorithm
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &next in &successors[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.modules[i].name.as_str())
                .collect();
            return Err(XbError::Failed(format!(
                "pipeline '{}' has an immediate-link cycle through {:?}",
                self.name, stuck
            )));
        }
        Ok(order)
    }

    /// Union pins joined by immediate links; returns the stream index of every pin
    fn resolve_streams(&self) -> Vec<Option<StreamId>> {
        let n = self.pins.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for link in self.links.iter().filter(|l| l.link_type == LinkType::Immediate) {
            let a = find(&mut parent, link.from.0 as usize);
            let b = find(&mut parent, link.to.0 as usize);
            if a != b {
                parent[b.max(a)] = a.min(b);
            }
        }

        let mut root_stream: Vec<Option<StreamId>> = vec![None; n];
        let mut pin_stream: Vec<Option<StreamId>> = vec![None; n];
        let mut next = 0u32;
        for pin in 0..n {
            if self.pins[pin].role == PinRole::Unassigned {
                log::debug!("pipeline '{}': pin '{}' is unused", self.name, self.pins[pin].params.name);
                continue;
            }
            let root = find(&mut parent, pin);
            let id = *root_stream[root].get_or_insert_with(|| {
                let id = StreamId(next);
                next += 1;
                id
            });
            pin_stream[pin] = Some(id);
        }
        pin_stream
    }

    fn stream_descriptors(&self, pin_stream: &[Option<StreamId>]) -> Vec<StreamDescriptor> {
        let count = pin_stream.iter().flatten().map(|s| s.index() + 1).max().unwrap_or(0);
        let mut descriptors: Vec<Option<StreamDescriptor>> = vec![None; count];

        for (pin, stream) in pin_stream.iter().enumerate() {
            let Some(stream) = *stream else { continue };
            let entry = &self.pins[pin];
            let stream_type = match entry.role {
                PinRole::PipelineInput => StreamType::Input,
                PinRole::PipelineOutput => StreamType::Output,
                _ => StreamType::Intermediate,
            };
            let rank = |t: StreamType| match t {
                StreamType::Input => 0,
                StreamType::Output => 1,
                StreamType::Intermediate => 2,
            };

            let slot = &mut descriptors[stream.index()];
            match slot {
                Some(desc) if rank(stream_type) < rank(desc.stream_type) => {
                    desc.stream_type = stream_type;
                    desc.name = entry.params.name.clone();
                }
                Some(_) => {}
                None => {
                    *slot = Some(StreamDescriptor {
                        id: stream,
                        name: entry.params.name.clone(),
                        stream_type,
                        num_channels: entry.params.num_channels,
                        frame_length: self.config.frame_length,
                        has_sid: entry.params.has_sid,
                    });
                }
            }
        }
        descriptors.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StreamSet;
    use crate::module::ModuleConfig;

    struct Passthrough;

    impl ProcessingModule for Passthrough {
        fn type_name(&self) -> &'static str {
            "passthrough"
        }

        fn process_child(&mut self, _config: &ModuleConfig, _streams: &mut StreamSet) -> XbResult<()> {
            Ok(())
        }
    }

    struct FailingInit;

    impl ProcessingModule for FailingInit {
        fn type_name(&self) -> &'static str {
            "failing-init"
        }

        fn init(&mut self, _config: &ModuleConfig) -> XbResult<()> {
            Err(XbError::InvalidParam("bad property".into()))
        }

        fn process_child(&mut self, _config: &ModuleConfig, _streams: &mut StreamSet) -> XbResult<()> {
            Ok(())
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            frame_length: 16,
            ..Default::default()
        }
    }

    /// Module with one input and one output pin
    fn add_module(p: &mut Pipeline, name: &str) -> (ModuleId, PinId, PinId) {
        let m = p.add_processing_module(name, Box::new(Passthrough), Properties::new()).unwrap();
        let i = p.create_audio_pin(PinParams::new(format!("{}.in", name), 2)).unwrap();
        let o = p.create_audio_pin(PinParams::new(format!("{}.out", name), 2)).unwrap();
        p.add_audio_pin_mapping(m, i, o).unwrap();
        (m, i, o)
    }

    #[test]
    fn test_immediate_cycle_fails() {
        let mut p = Pipeline::new("cycle", &config()).unwrap();
        let (_, a_in, a_out) = add_module(&mut p, "a");
        let (_, b_in, b_out) = add_module(&mut p, "b");
        p.link(a_out, b_in, LinkType::Immediate).unwrap();
        p.link(b_out, a_in, LinkType::Immediate).unwrap();

        assert!(matches!(p.init_audio_chain(), Err(XbError::Failed(_))));
        assert!(!p.is_initialized());
    }

    #[test]
    fn test_cycle_with_delayed_link_succeeds() {
        let mut p = Pipeline::new("feedback", &config()).unwrap();
        let (_, a_in, a_out) = add_module(&mut p, "a");
        let (_, b_in, b_out) = add_module(&mut p, "b");
        p.link(a_out, b_in, LinkType::Immediate).unwrap();
        p.link(b_out, a_in, LinkType::Delayed).unwrap();

        let chain = p.init_audio_chain().unwrap();
        assert_eq!(chain.execution_order(), vec!["a", "b"]);
        assert!(p.is_initialized());
    }

    #[test]
    fn test_self_loop_fails() {
        let mut p = Pipeline::new("self", &config()).unwrap();
        let (_, a_in, a_out) = add_module(&mut p, "a");
        p.link(a_out, a_in, LinkType::Immediate).unwrap();
        assert!(matches!(p.init_audio_chain(), Err(XbError::Failed(_))));
    }

    #[test]
    fn test_topological_order_ignores_creation_order() {
        let mut p = Pipeline::new("order", &config()).unwrap();
        let (_, c_in, _) = add_module(&mut p, "c");
        let (_, b_in, b_out) = add_module(&mut p, "b");
        let (_, _, a_out) = add_module(&mut p, "a");
        p.link(a_out, b_in, LinkType::Immediate).unwrap();
        p.link(b_out, c_in, LinkType::Immediate).unwrap();

        let chain = p.init_audio_chain().unwrap();
        assert_eq!(chain.execution_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_linked_pins_share_stream() {
        let mut p = Pipeline::new("share", &config()).unwrap();
        let input = p.create_audio_pin(PinParams::new("in", 2)).unwrap();
        let output = p.create_audio_pin(PinParams::new("out", 2)).unwrap();
        p.add_audio_input_pin(input).unwrap();
        p.add_audio_output_pin(output).unwrap();
        let (_, a_in, a_out) = add_module(&mut p, "a");
        p.link(input, a_in, LinkType::Immediate).unwrap();
        p.link(a_out, output, LinkType::Immediate).unwrap();

        let chain = p.init_audio_chain().unwrap();
        assert_eq!(chain.streams().len(), 2);
        assert_eq!(chain.stream_by_name("in").unwrap().stream_type(), StreamType::Input);
        assert_eq!(chain.stream_by_name("out").unwrap().stream_type(), StreamType::Output);
        assert_eq!(chain.input_ports()[0].stream, chain.stream_by_name("in").unwrap().id());
    }

    #[test]
    fn test_link_validation() {
        let mut p = Pipeline::new("links", &config()).unwrap();
        let input = p.create_audio_pin(PinParams::new("in", 2)).unwrap();
        let mono = p.create_audio_pin(PinParams::new("mono", 1)).unwrap();
        let unused = p.create_audio_pin(PinParams::new("unused", 2)).unwrap();
        p.add_audio_input_pin(input).unwrap();
        p.add_audio_output_pin(mono).unwrap();
        let (_, a_in, a_out) = add_module(&mut p, "a");

        assert!(matches!(p.link(input, mono, LinkType::Immediate), Err(XbError::InvalidParam(_))));
        assert!(matches!(p.link(input, unused, LinkType::Immediate), Err(XbError::Failed(_))));
        assert!(matches!(p.link(a_in, a_out, LinkType::Immediate), Err(XbError::Failed(_))));
        assert!(matches!(p.link(PinId(99), a_in, LinkType::Immediate), Err(XbError::InvalidPin(_))));

        p.link(input, a_in, LinkType::Immediate).unwrap();
        assert!(matches!(p.link(a_out, a_in, LinkType::Delayed), Err(XbError::Failed(_))));

        p.unlink(input, a_in).unwrap();
        assert!(matches!(p.unlink(input, a_in), Err(XbError::Failed(_))));
        assert!(p.links().is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut p = Pipeline::new("dup", &config()).unwrap();
        p.create_audio_pin(PinParams::new("x", 1)).unwrap();
        assert!(matches!(p.create_audio_pin(PinParams::new("x", 1)), Err(XbError::InvalidParam(_))));
        assert!(matches!(p.create_audio_pin(PinParams::new("y", 0)), Err(XbError::InvalidParam(_))));
        add_module(&mut p, "m");
        assert!(matches!(
            p.add_processing_module("m", Box::new(Passthrough), Properties::new()),
            Err(XbError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_pin_roles_are_exclusive() {
        let mut p = Pipeline::new("roles", &config()).unwrap();
        let pin = p.create_audio_pin(PinParams::new("p", 2)).unwrap();
        p.add_audio_input_pin(pin).unwrap();
        assert!(matches!(p.add_audio_output_pin(pin), Err(XbError::Failed(_))));

        let m = p.add_processing_module("m", Box::new(Passthrough), Properties::new()).unwrap();
        assert!(matches!(p.add_audio_in_out_pin(m, pin), Err(XbError::Failed(_))));
        assert_eq!(p.pin_role(pin).unwrap(), PinRole::PipelineInput);
    }

    #[test]
    fn test_setup_after_init_fails() {
        let mut p = Pipeline::new("frozen", &config()).unwrap();
        let (m, a_in, a_out) = add_module(&mut p, "a");
        p.init_audio_chain().unwrap();

        assert!(matches!(p.create_audio_pin(PinParams::new("late", 1)), Err(XbError::Failed(_))));
        assert!(matches!(p.link(a_out, a_in, LinkType::Delayed), Err(XbError::Failed(_))));
        assert!(matches!(p.set_module_enabled(m, false), Err(XbError::Failed(_))));
        assert!(matches!(p.init_audio_chain(), Err(XbError::Failed(_))));
    }

    #[test]
    fn test_failed_module_init_keeps_setup_state() {
        let mut p = Pipeline::new("init", &config()).unwrap();
        let m = p.add_processing_module("bad", Box::new(FailingInit), Properties::new()).unwrap();
        let pin = p.create_audio_pin(PinParams::new("io", 1)).unwrap();
        p.add_audio_in_out_pin(m, pin).unwrap();

        assert!(matches!(p.init_audio_chain(), Err(XbError::InvalidParam(_))));
        assert!(!p.is_initialized());
        assert!(p.create_audio_pin(PinParams::new("still-open", 1)).is_ok());
    }

    #[test]
    fn test_in_place_chain_shares_one_stream() {
        let mut p = Pipeline::new("inplace", &config()).unwrap();
        let input = p.create_audio_pin(PinParams::new("in", 4)).unwrap();
        let output = p.create_audio_pin(PinParams::new("out", 4)).unwrap();
        p.add_audio_input_pin(input).unwrap();
        p.add_audio_output_pin(output).unwrap();
        let m = p.add_processing_module("vol", Box::new(Passthrough), Properties::new()).unwrap();
        let io = p.create_audio_pin(PinParams::new("vol.io", 4)).unwrap();
        p.add_audio_in_out_pin(m, io).unwrap();
        p.link(input, io, LinkType::Immediate).unwrap();
        p.link(io, output, LinkType::Immediate).unwrap();

        let chain = p.init_audio_chain().unwrap();
        assert_eq!(chain.streams().len(), 1);
        assert_eq!(chain.streams().streams()[0].stream_type(), StreamType::Input);
        assert_eq!(chain.input_ports()[0].stream, chain.output_ports()[0].stream);
    }
}
