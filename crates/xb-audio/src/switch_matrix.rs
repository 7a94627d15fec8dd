//! Switch Matrix
//!
//! Copies one period of frames from source rings into the conversion
//! buffers of a routing zone. Several sources connected to one port are
//! summed.
//!
//! ```text
//!  control thread                          zone thread
//! ┌──────────────┐   MatrixCommand    ┌──────────────────────────┐
//! │ SwitchMatrix │ ─────────────────▶ │ MatrixRuntime::run()     │
//! │  validates   │    (rtrb SPSC)     │  1. drain commands       │
//! │  connections │                    │  2. zero port buffers    │
//! └──────────────┘                    │  3. mix every connection │
//!                                     │  4. drain dummy sources  │
//!                                     └──────────────────────────┘
//! ```

use std::fmt;

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use xb_core::{XbError, XbResult};
use xb_realtime::AudioFrame;

use crate::device::{SourceDevice, SourceId};
use crate::ringbuf::RingReader;

/// Connections the runtime can hold before it has to grow its job list
const JOB_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZonePortId(pub u32);

impl ZonePortId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ZonePortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// Input port of a routing zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePort {
    pub id: ZonePortId,
    pub name: String,
    pub num_channels: usize,
}

struct MatrixJob {
    source: SourceId,
    port: ZonePortId,
    reader: RingReader,
}

enum MatrixCommand {
    Connect(Box<MatrixJob>),
    Disconnect { source: SourceId, port: ZonePortId },
    AddDummy(SourceId, Box<RingReader>),
    RemoveDummy(SourceId),
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROL SIDE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SwitchMatrix {
    zone: String,
    ports: Vec<ZonePort>,
    connections: Vec<(SourceId, ZonePortId)>,
    dummies: Vec<SourceId>,
    commands: Producer<MatrixCommand>,
}

impl fmt::Debug for SwitchMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchMatrix")
            .field("zone", &self.zone)
            .field("ports", &self.ports)
            .field("connections", &self.connections)
            .field("dummies", &self.dummies)
            .finish()
    }
}

impl SwitchMatrix {
    pub fn new(zone: impl Into<String>, queue_capacity: usize) -> (Self, MatrixRuntime) {
        let (tx, rx) = RingBuffer::new(queue_capacity.max(1));
        (
            Self {
                zone: zone.into(),
                ports: Vec::new(),
                connections: Vec::new(),
                dummies: Vec::new(),
                commands: tx,
            },
            MatrixRuntime {
                commands: rx,
                jobs: Vec::with_capacity(JOB_CAPACITY),
                dummies: Vec::new(),
            },
        )
    }

    pub fn ports(&self) -> &[ZonePort] {
        &self.ports
    }

    pub fn port(&self, id: ZonePortId) -> XbResult<&ZonePort> {
        self.ports
            .get(id.index())
            .ok_or_else(|| XbError::InvalidParam(format!("{} does not exist in zone '{}'", id, self.zone)))
    }

    pub fn connections(&self) -> &[(SourceId, ZonePortId)] {
        &self.connections
    }

    pub fn dummy_sources(&self) -> &[SourceId] {
        &self.dummies
    }

    /// Register a new port. Ports are numbered in creation order.
    pub(crate) fn add_port(&mut self, name: String, num_channels: usize) -> XbResult<ZonePortId> {
        if num_channels == 0 {
            return Err(XbError::InvalidParam(format!("port '{}' has no channels", name)));
        }
        if self.ports.iter().any(|p| p.name == name) {
            return Err(XbError::InvalidParam(format!("port '{}' already exists", name)));
        }
        let id = ZonePortId(self.ports.len() as u32);
        self.ports.push(ZonePort { id, name, num_channels });
        Ok(id)
    }

    pub fn connect(&mut self, source: &SourceDevice, port: ZonePortId) -> XbResult<()> {
        let target = self.port(port)?;
        if self.connections.contains(&(source.id(), port)) {
            return Err(XbError::Failed(format!(
                "{} is already connected to '{}'",
                source.id(),
                target.name
            )));
        }
        if source.num_channels() != target.num_channels {
            return Err(XbError::Failed(format!(
                "source '{}' has {} channels, port '{}' has {}",
                source.name(),
                source.num_channels(),
                target.name,
                target.num_channels
            )));
        }

        let reader = source.ring().connect_reader()?;
        let job = Box::new(MatrixJob {
            source: source.id(),
            port,
            reader,
        });
        self.push(MatrixCommand::Connect(job))?;
        self.connections.push((source.id(), port));
        log::debug!("zone '{}': connected '{}' to {}", self.zone, source.name(), port);
        Ok(())
    }

    pub fn disconnect(&mut self, source: SourceId, port: ZonePortId) -> XbResult<()> {
        let index = self
            .connections
            .iter()
            .position(|&c| c == (source, port))
            .ok_or_else(|| XbError::Failed(format!("{} is not connected to {}", source, port)))?;
        self.push(MatrixCommand::Disconnect { source, port })?;
        self.connections.remove(index);
        Ok(())
    }

    /// Read and discard a source every period so it never fills up
    pub fn add_dummy_source(&mut self, source: &SourceDevice) -> XbResult<()> {
        if self.dummies.contains(&source.id()) {
            return Err(XbError::Failed(format!("'{}' is already a dummy source", source.name())));
        }
        let reader = source.ring().connect_reader()?;
        self.push(MatrixCommand::AddDummy(source.id(), Box::new(reader)))?;
        self.dummies.push(source.id());
        Ok(())
    }

    pub fn remove_dummy_source(&mut self, source: SourceId) -> XbResult<()> {
        let index = self
            .dummies
            .iter()
            .position(|&d| d == source)
            .ok_or_else(|| XbError::Failed(format!("{} is not a dummy source", source)))?;
        self.push(MatrixCommand::RemoveDummy(source))?;
        self.dummies.remove(index);
        Ok(())
    }

    fn push(&mut self, command: MatrixCommand) -> XbResult<()> {
        self.commands.push(command).map_err(|_| {
            XbError::NoSpaceLeft(format!("switch matrix queue of zone '{}' is full", self.zone))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME SIDE
// ═══════════════════════════════════════════════════════════════════════════════

/// Zone-thread half of a switch matrix
pub struct MatrixRuntime {
    commands: Consumer<MatrixCommand>,
    jobs: Vec<MatrixJob>,
    dummies: Vec<(SourceId, Box<RingReader>)>,
}

impl fmt::Debug for MatrixRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixRuntime")
            .field("jobs", &self.jobs.len())
            .field("dummies", &self.dummies.len())
            .finish()
    }
}

impl MatrixRuntime {
    pub fn num_connections(&self) -> usize {
        self.jobs.len()
    }

    /// Apply queued connection changes
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                MatrixCommand::Connect(job) => self.jobs.push(*job),
                MatrixCommand::Disconnect { source, port } => {
                    self.jobs.retain(|j| !(j.source == source && j.port == port));
                }
                MatrixCommand::AddDummy(source, reader) => self.dummies.push((source, reader)),
                MatrixCommand::RemoveDummy(source) => self.dummies.retain(|(s, _)| *s != source),
            }
        }
    }

    /// Run one period.
    ///
    /// `buffers` are indexed by port id. Every connection that delivers fewer
    /// than `frames` frames is reported through `on_underrun` with the
    /// number of missing frames; the missing part stays silent.
    pub fn run<F>(&mut self, buffers: &mut [AudioFrame], frames: usize, mut on_underrun: F)
    where
        F: FnMut(SourceId, ZonePortId, usize),
    {
        self.drain_commands();

        for buffer in buffers.iter_mut() {
            buffer.clear();
        }

        for job in &mut self.jobs {
            let Some(buffer) = buffers.get_mut(job.port.index()) else {
                continue;
            };
            let read = job.reader.mix_into(buffer, frames);
            if read < frames {
                on_underrun(job.source, job.port, frames - read);
            }
        }

        for (_, reader) in &mut self.dummies {
            reader.skip_available();
        }
    }
}
