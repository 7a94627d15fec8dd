//! Routing Zone
//!
//! A routing zone drives one sink device from its own worker thread:
//!
//! ```text
//!  wait for sink period ─▶ switch matrix ─▶ audio chain ─▶ sink write-back
//!                                                              │
//!                        every k-th period: derived zones ◀────┘
//! ```
//!
//! The zone's runtime (sink, matrix jobs, conversion buffers, chain and
//! derived runtimes) is moved into the worker thread on `start` and handed
//! back through the join handle on `stop`. The real-time path takes no
//! locks.
//!
//! States: `Inactive -> Prepare -> Active -> Inactive`. Setup calls fail with
//! `Failed` unless the zone is inactive and not attached to a base zone.

mod runtime;
mod state;

pub use state::{ZoneEvent, ZoneShared, ZoneState, ZoneStats, ZoneStatsSnapshot, ZoneTransition};

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded};
use xb_core::{EngineConfig, XbError, XbResult};
use xb_realtime::{AudioChain, ChainPort, PinId};

use crate::device::{ClockType, DeviceParams, SinkDevice, SourceDevice, SourceId};
use crate::switch_matrix::{SwitchMatrix, ZonePort, ZonePortId};
use crate::thread_priority::promote_current_thread;
use runtime::{DerivedRuntime, PortLink, SinkLink, ZoneRuntime, worker_loop};

pub struct RoutingZone {
    name: Arc<str>,
    config: EngineConfig,
    initialized: bool,
    shared: Arc<ZoneShared>,
    events: Receiver<ZoneEvent>,
    matrix: SwitchMatrix,
    /// Present unless the worker thread or a base zone owns it
    runtime: Option<Box<ZoneRuntime>>,
    thread: Option<JoinHandle<Option<Box<ZoneRuntime>>>>,
    sink_params: Option<DeviceParams>,
    sink_ready: bool,
    chain_inputs: Vec<ChainPort>,
    chain_outputs: Vec<ChainPort>,
    base: Option<Arc<str>>,
    derived: Vec<Arc<str>>,
}

impl fmt::Debug for RoutingZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingZone")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ports", &self.matrix.ports())
            .field("sink", &self.sink_params.as_ref().map(|p| &p.name))
            .field("base", &self.base)
            .field("derived", &self.derived)
            .finish()
    }
}

impl RoutingZone {
    pub fn new(name: impl Into<String>, config: &EngineConfig) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = bounded(config.event_queue_capacity.max(1));
        let shared = Arc::new(ZoneShared::new(Arc::clone(&name), tx));
        let (matrix, matrix_runtime) = SwitchMatrix::new(name.to_string(), config.matrix_queue_capacity);
        let runtime = ZoneRuntime::new(Arc::clone(&shared), matrix_runtime);

        Self {
            name,
            config: config.clone(),
            initialized: false,
            shared,
            events: rx,
            matrix,
            runtime: Some(Box::new(runtime)),
            thread: None,
            sink_params: None,
            sink_ready: false,
            chain_inputs: Vec::new(),
            chain_outputs: Vec::new(),
            base: None,
            derived: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn state(&self) -> ZoneState {
        self.shared.state()
    }

    /// True only while preparing to start
    pub fn is_active_pending(&self) -> bool {
        self.state() == ZoneState::Prepare
    }

    pub fn is_active(&self) -> bool {
        self.state() == ZoneState::Active
    }

    pub fn stats(&self) -> ZoneStatsSnapshot {
        self.shared.stats().snapshot()
    }

    /// Receiver of this zone's events
    pub fn events(&self) -> Receiver<ZoneEvent> {
        self.events.clone()
    }

    pub fn ports(&self) -> &[ZonePort] {
        self.matrix.ports()
    }

    pub fn sink_params(&self) -> Option<&DeviceParams> {
        self.sink_params.as_ref()
    }

    /// Frames per period of the linked sink
    pub fn frame_length(&self) -> Option<usize> {
        self.sink_params.as_ref().map(|p| p.period_size)
    }

    pub fn base_zone(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn derived_zones(&self) -> impl Iterator<Item = &str> {
        self.derived.iter().map(|d| d.as_ref())
    }

    pub fn has_pipeline(&self) -> bool {
        !self.chain_inputs.is_empty() || !self.chain_outputs.is_empty()
    }

    pub fn connections(&self) -> &[(SourceId, ZonePortId)] {
        self.matrix.connections()
    }

    pub fn dummy_sources(&self) -> &[SourceId] {
        self.matrix.dummy_sources()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Setup
    // ─────────────────────────────────────────────────────────────────────────

    fn setup_runtime(&mut self) -> XbResult<&mut ZoneRuntime> {
        if !self.initialized {
            return Err(XbError::NotInitialized(format!("zone '{}' is not initialized", self.name)));
        }
        if let Some(base) = &self.base {
            return Err(XbError::Failed(format!(
                "zone '{}' is attached to base zone '{}'",
                self.name, base
            )));
        }
        if self.state() != ZoneState::Inactive {
            return Err(XbError::Failed(format!("zone '{}' is not inactive", self.name)));
        }
        self.runtime
            .as_deref_mut()
            .ok_or_else(|| XbError::Failed(format!("zone '{}' is running", self.name)))
    }

    pub fn init(&mut self) -> XbResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.config.validate()?;
        self.initialized = true;
        log::debug!("zone '{}' initialized", self.name);
        Ok(())
    }

    /// Take ownership of the sink this zone drives
    pub fn link_sink_device(&mut self, sink: Box<dyn SinkDevice>) -> XbResult<()> {
        let params = sink.params().clone();
        let ready = sink.is_initialized();
        let rt = self.setup_runtime()?;
        if rt.sink.is_some() {
            return Err(XbError::Failed(format!("zone '{}' already has a sink device", self.name)));
        }
        if let Some(chain) = &rt.chain {
            if chain.frame_length() != params.period_size {
                return Err(XbError::InvalidParam(format!(
                    "sink '{}' period {} differs from pipeline frame length {}",
                    params.name,
                    params.period_size,
                    chain.frame_length()
                )));
            }
        }
        rt.sink = Some(sink);
        log::debug!("zone '{}': linked sink '{}'", self.name, params.name);
        self.sink_params = Some(params);
        self.sink_ready = ready;
        Ok(())
    }

    pub fn add_port(&mut self, name: impl Into<String>, num_channels: usize) -> XbResult<ZonePortId> {
        self.setup_runtime()?;
        let id = self.matrix.add_port(name.into(), num_channels)?;
        let port = self.matrix.port(id)?.clone();
        if let Some(rt) = self.runtime.as_deref_mut() {
            rt.ports.push(port);
        }
        Ok(id)
    }

    /// Attach an initialized audio chain as this zone's pipeline
    pub fn add_pipeline(&mut self, chain: AudioChain) -> XbResult<()> {
        let sink_frames = self.frame_length();
        let rt = self.setup_runtime()?;
        if rt.chain.is_some() {
            return Err(XbError::Failed("zone already has a pipeline".into()));
        }
        if let Some(frames) = sink_frames {
            if frames != chain.frame_length() {
                return Err(XbError::InvalidParam(format!(
                    "pipeline frame length {} differs from sink period {}",
                    chain.frame_length(),
                    frames
                )));
            }
        }
        let inputs = chain.input_ports().to_vec();
        let outputs = chain.output_ports().to_vec();
        let chain_name = chain.name().to_string();
        rt.chain = Some(chain);
        log::info!("zone '{}': pipeline '{}' attached", self.name, chain_name);
        self.chain_inputs = inputs;
        self.chain_outputs = outputs;
        Ok(())
    }

    /// Feed a zone port into a pipeline input pin
    pub fn link_port_to_pipeline(&mut self, port: ZonePortId, pin: PinId) -> XbResult<()> {
        let port_info = self.matrix.port(port)?.clone();
        let input = self
            .chain_inputs
            .iter()
            .find(|p| p.pin == pin)
            .cloned()
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a pipeline input of zone '{}'", pin, self.name)))?;
        if input.num_channels != port_info.num_channels {
            return Err(XbError::InvalidParam(format!(
                "port '{}' has {} channels, pin '{}' has {}",
                port_info.name, port_info.num_channels, input.name, input.num_channels
            )));
        }

        let rt = self.setup_runtime()?;
        if rt.port_links.iter().any(|l| l.pin == pin) {
            return Err(XbError::Failed(format!("pin '{}' is already fed by a port", input.name)));
        }
        rt.port_links.push(PortLink {
            port_index: port.index(),
            pin,
        });
        Ok(())
    }

    /// Write a pipeline output pin to sink channels starting at `first_channel`
    pub fn link_pipeline_to_sink(&mut self, pin: PinId, first_channel: usize) -> XbResult<()> {
        let sink_channels = self
            .sink_params
            .as_ref()
            .map(|p| p.num_channels)
            .ok_or_else(|| XbError::NotInitialized(format!("zone '{}' has no sink device", self.name)))?;
        let output = self
            .chain_outputs
            .iter()
            .find(|p| p.pin == pin)
            .cloned()
            .ok_or_else(|| XbError::InvalidPin(format!("{} is not a pipeline output of zone '{}'", pin, self.name)))?;
        if first_channel + output.num_channels > sink_channels {
            return Err(XbError::InvalidParam(format!(
                "pin '{}' needs sink channels {}..{}, sink has {}",
                output.name,
                first_channel,
                first_channel + output.num_channels,
                sink_channels
            )));
        }

        let rt = self.setup_runtime()?;
        if rt.sink_links.iter().any(|l| l.pin == pin) {
            return Err(XbError::Failed(format!("pin '{}' is already linked to the sink", output.name)));
        }
        rt.sink_links.push(SinkLink { pin, first_channel });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Switch matrix (allowed while active)
    // ─────────────────────────────────────────────────────────────────────────

    fn flush_matrix(&mut self) {
        if let Some(rt) = self.runtime.as_deref_mut() {
            rt.matrix.drain_commands();
        }
    }

    pub fn connect_source(&mut self, source: &SourceDevice, port: ZonePortId) -> XbResult<()> {
        self.matrix.connect(source, port)?;
        self.flush_matrix();
        Ok(())
    }

    pub fn disconnect_source(&mut self, source: SourceId, port: ZonePortId) -> XbResult<()> {
        self.matrix.disconnect(source, port)?;
        self.flush_matrix();
        Ok(())
    }

    pub fn add_dummy_source(&mut self, source: &SourceDevice) -> XbResult<()> {
        self.matrix.add_dummy_source(source)?;
        self.flush_matrix();
        Ok(())
    }

    pub fn remove_dummy_source(&mut self, source: SourceId) -> XbResult<()> {
        self.matrix.remove_dummy_source(source)?;
        self.flush_matrix();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Prepare buffers and start the worker thread.
    ///
    /// Starting an active zone is a no-op. A worker that already exited
    /// because its sink closed is reaped first.
    pub fn start(&mut self) -> XbResult<()> {
        if let Some(base) = &self.base {
            return Err(XbError::Failed(format!(
                "derived zone '{}' runs with base zone '{}' and cannot be started on its own",
                self.name, base
            )));
        }
        if !self.initialized {
            return Err(XbError::NotInitialized(format!("zone '{}' is not initialized", self.name)));
        }
        if self.thread.is_some() {
            if self.shared.is_running() {
                return Ok(());
            }
            self.stop()?;
        }
        let Some(mut rt) = self.runtime.take() else {
            return Err(XbError::Failed(format!("zone '{}' has no runtime", self.name)));
        };

        if let Err(e) = self.check_startable(&rt) {
            self.runtime = Some(rt);
            return Err(e);
        }

        self.shared.transition(ZoneTransition::Prepare);
        if let Err(e) = rt.prepare() {
            self.shared.transition(ZoneTransition::Inactivate);
            self.runtime = Some(rt);
            return Err(e);
        }

        rt.set_derived_state(ZoneTransition::Prepare);

        let (rt_tx, rt_rx) = bounded::<Box<ZoneRuntime>>(1);
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let timeout = self.config.period_timeout();
        let priority = self.config.realtime_priority.then_some(self.config.rt_priority);
        shared.set_running(true);

        let spawned = thread::Builder::new()
            .name(format!("xb-zone-{}", self.name))
            .spawn(move || {
                let Ok(rt) = rt_rx.recv() else {
                    return None;
                };
                if let Some(priority) = priority {
                    promote_current_thread(priority);
                }
                rt.set_derived_state(ZoneTransition::Activate);
                shared.transition(ZoneTransition::Activate);
                let _ = ready_tx.send(());
                let rt = worker_loop(rt, timeout);
                Some(rt)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_running(false);
                self.shared.transition(ZoneTransition::Inactivate);
                rt.set_derived_state(ZoneTransition::Inactivate);
                self.runtime = Some(rt);
                return Err(XbError::Failed(format!("failed to spawn zone thread: {}", e)));
            }
        };
        if let Err(e) = rt_tx.send(rt) {
            self.shared.set_running(false);
            self.shared.transition(ZoneTransition::Inactivate);
            let _ = handle.join();
            let rt = e.into_inner();
            rt.set_derived_state(ZoneTransition::Inactivate);
            self.runtime = Some(rt);
            return Err(XbError::Failed(format!("zone '{}' thread exited early", self.name)));
        }
        let _ = ready_rx.recv();

        self.thread = Some(handle);
        log::info!("zone '{}' started", self.name);
        Ok(())
    }

    fn check_startable(&self, rt: &ZoneRuntime) -> XbResult<()> {
        let Some(sink) = rt.sink.as_ref() else {
            return Err(XbError::Failed(format!("zone '{}' has no sink device", self.name)));
        };
        if sink.params().clock == ClockType::Undefined {
            return Err(XbError::Failed(format!(
                "sink '{}' of zone '{}' has no defined clock",
                sink.params().name,
                self.name
            )));
        }
        if !sink.is_initialized() {
            return Err(XbError::Failed(format!("sink '{}' is not initialized", sink.params().name)));
        }
        if rt.ports.is_empty() {
            return Err(XbError::Failed(format!("zone '{}' has no ports", self.name)));
        }
        Ok(())
    }

    /// Stop the worker thread. Buffers are cleared but stay allocated.
    pub fn stop(&mut self) -> XbResult<()> {
        let Some(handle) = self.thread.take() else {
            self.shared.transition(ZoneTransition::Inactivate);
            return Ok(());
        };

        self.shared.set_running(false);
        let result = match handle.join() {
            Ok(Some(mut rt)) => {
                rt.clear();
                self.runtime = Some(rt);
                Ok(())
            }
            Ok(None) | Err(_) => {
                log::error!("zone '{}': worker thread lost its runtime", self.name);
                Err(XbError::Failed(format!("zone '{}' worker thread panicked", self.name)))
            }
        };
        self.shared.transition(ZoneTransition::Inactivate);
        log::info!("zone '{}' stopped", self.name);
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Derived zones
    // ─────────────────────────────────────────────────────────────────────────

    fn has_ready_sink(&self) -> bool {
        match self.runtime.as_deref() {
            Some(rt) => rt.sink_ready(),
            None => self.sink_ready,
        }
    }

    /// Run `derived` from this zone's thread every k-th period, where
    /// k = derived period / base period.
    pub fn add_derived_zone(&mut self, derived: &mut RoutingZone) -> XbResult<()> {
        if !self.initialized {
            return Err(XbError::NotInitialized(format!("base zone '{}' is not initialized", self.name)));
        }
        if !derived.initialized {
            return Err(XbError::NotInitialized(format!(
                "derived zone '{}' is not initialized",
                derived.name
            )));
        }
        if !self.has_ready_sink() {
            return Err(XbError::Failed(format!(
                "base zone '{}' has no initialized sink device",
                self.name
            )));
        }
        if !derived.has_ready_sink() {
            return Err(XbError::Failed(format!(
                "derived zone '{}' has no initialized sink device",
                derived.name
            )));
        }
        if self.state() != ZoneState::Inactive || derived.state() != ZoneState::Inactive {
            return Err(XbError::Failed("base and derived zones must be inactive".into()));
        }
        if self.base.is_some() || derived.base.is_some() || !derived.derived.is_empty() || self.name == derived.name {
            return Err(XbError::Failed(format!(
                "zone '{}' cannot be derived from '{}'",
                derived.name, self.name
            )));
        }

        let (Some(base_params), Some(derived_params)) = (&self.sink_params, &derived.sink_params) else {
            return Err(XbError::Failed("zones without sink parameters".into()));
        };
        if base_params.sample_rate != derived_params.sample_rate {
            return Err(XbError::InvalidParam(format!(
                "sample rates differ: {} vs {}",
                base_params.sample_rate, derived_params.sample_rate
            )));
        }
        let (base_period, derived_period) = (base_params.period_size, derived_params.period_size);
        if derived_period < base_period || derived_period % base_period != 0 {
            return Err(XbError::InvalidParam(format!(
                "derived period {} is not a multiple of base period {}",
                derived_period, base_period
            )));
        }
        let ratio = derived_period / base_period;

        let (Some(base_rt), Some(derived_rt)) = (self.runtime.as_deref_mut(), derived.runtime.take()) else {
            return Err(XbError::Failed("zone runtime unavailable".into()));
        };
        base_rt.derived.push(DerivedRuntime {
            ratio,
            countdown: ratio,
            runtime: derived_rt,
        });
        derived.base = Some(Arc::clone(&self.name));
        self.derived.push(Arc::clone(&derived.name));
        log::info!("zone '{}' derived from '{}' (ratio {})", derived.name, self.name, ratio);
        Ok(())
    }

    /// Detach a derived zone and hand its runtime back
    pub fn delete_derived_zone(&mut self, derived: &mut RoutingZone) -> XbResult<()> {
        if derived.base.as_deref() != Some(&*self.name) {
            return Err(XbError::Failed(format!(
                "zone '{}' is not derived from '{}'",
                derived.name, self.name
            )));
        }
        let Some(base_rt) = self.runtime.as_deref_mut() else {
            return Err(XbError::Failed(format!("base zone '{}' is running", self.name)));
        };
        let index = base_rt
            .derived
            .iter()
            .position(|d| d.runtime.name() == &*derived.name)
            .ok_or_else(|| XbError::Failed(format!("derived runtime of '{}' not found", derived.name)))?;

        let entry = base_rt.derived.remove(index);
        derived.runtime = Some(entry.runtime);
        derived.base = None;
        self.derived.retain(|d| d != &derived.name);
        Ok(())
    }
}

impl Drop for RoutingZone {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}
