//! Zone runtime: everything the worker thread owns while a zone is active

use std::sync::Arc;
use std::time::{Duration, Instant};

use xb_core::{Sample, XbError, XbResult};
use xb_realtime::{AudioChain, AudioFrame, PinId};

use super::state::{ZoneEvent, ZoneShared, ZoneTransition};
use crate::device::SinkDevice;
use crate::error::DeviceError;
use crate::switch_matrix::{MatrixRuntime, ZonePort};

/// Zone port feeding a pipeline input pin
#[derive(Debug, Clone, Copy)]
pub(crate) struct PortLink {
    pub(crate) port_index: usize,
    pub(crate) pin: PinId,
}

/// Pipeline output pin written to consecutive sink channels
#[derive(Debug, Clone, Copy)]
pub(crate) struct SinkLink {
    pub(crate) pin: PinId,
    pub(crate) first_channel: usize,
}

pub(crate) struct DerivedRuntime {
    pub(crate) ratio: usize,
    pub(crate) countdown: usize,
    pub(crate) runtime: Box<ZoneRuntime>,
}

pub(crate) struct ZoneRuntime {
    pub(crate) shared: Arc<ZoneShared>,
    pub(crate) sink: Option<Box<dyn SinkDevice>>,
    pub(crate) matrix: MatrixRuntime,
    pub(crate) ports: Vec<ZonePort>,
    /// One conversion buffer per port, allocated in prepare
    pub(crate) buffers: Vec<AudioFrame>,
    pub(crate) chain: Option<AudioChain>,
    pub(crate) port_links: Vec<PortLink>,
    pub(crate) sink_links: Vec<SinkLink>,
    pub(crate) derived: Vec<DerivedRuntime>,
}

impl ZoneRuntime {
    pub(crate) fn new(shared: Arc<ZoneShared>, matrix: MatrixRuntime) -> Self {
        Self {
            shared,
            sink: None,
            matrix,
            ports: Vec::new(),
            buffers: Vec::new(),
            chain: None,
            port_links: Vec::new(),
            sink_links: Vec::new(),
            derived: Vec::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.shared.name()
    }

    /// Frames per period, from the linked sink
    pub(crate) fn frame_length(&self) -> Option<usize> {
        self.sink.as_ref().map(|s| s.params().period_size)
    }

    pub(crate) fn sink_ready(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| s.is_initialized())
    }

    /// Allocate conversion buffers for every port, derived zones included
    pub(crate) fn prepare(&mut self) -> XbResult<()> {
        let frames = self
            .frame_length()
            .ok_or_else(|| XbError::Failed(format!("zone '{}' has no sink device", self.name())))?;
        if let Some(chain) = &self.chain {
            if chain.frame_length() != frames {
                return Err(XbError::Failed(format!(
                    "pipeline '{}' runs {} frames, sink of zone '{}' {}",
                    chain.name(),
                    chain.frame_length(),
                    self.name(),
                    frames
                )));
            }
        }

        let ready = self.buffers.len() == self.ports.len()
            && self
                .buffers
                .iter()
                .zip(&self.ports)
                .all(|(b, p)| b.num_channels() == p.num_channels && b.frame_length() == frames);
        if !ready {
            let mut buffers = Vec::new();
            buffers.try_reserve_exact(self.ports.len())?;
            buffers.extend(self.ports.iter().map(|p| AudioFrame::new(p.num_channels, frames)));
            self.buffers = buffers;
        }

        for derived in &mut self.derived {
            derived.runtime.prepare()?;
            derived.countdown = derived.ratio;
        }
        Ok(())
    }

    /// Zero conversion buffers and bundles without freeing them
    pub(crate) fn clear(&mut self) {
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        if let Some(chain) = &mut self.chain {
            chain.clear_buffers();
        }
        for derived in &mut self.derived {
            derived.runtime.clear();
        }
    }

    /// Matrix copy, pipeline, sink write-back, commit
    pub(crate) fn run_period(&mut self) {
        let started = Instant::now();
        let Some(frames) = self.frame_length() else {
            return;
        };

        let shared = &self.shared;
        self.matrix.run(&mut self.buffers, frames, |source, port, missing| {
            shared.stats().record_underrun();
            log::warn!(
                "zone '{}': {} underrun on {}, {} frame(s) missing",
                shared.name(),
                source,
                port,
                missing
            );
            shared.emit(ZoneEvent::SourceUnderrun {
                zone: Arc::clone(shared.name()),
                source,
                port,
                missing_frames: missing,
            });
        });

        if let Some(chain) = &mut self.chain {
            let result = feed_chain(chain, &self.port_links, &self.buffers).and_then(|_| chain.process());
            if let Err(e) = result {
                self.shared.stats().record_processing_failure();
                self.shared.emit(ZoneEvent::ProcessingFailed {
                    zone: Arc::clone(self.shared.name()),
                    error: e,
                });
            }
        }

        self.write_sink();
        self.shared.stats().record_period(started.elapsed());
    }

    fn write_sink(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let channels = sink.params().num_channels;
        let out = sink.period_buffer();
        out.fill(0.0);

        match &self.chain {
            Some(chain) => {
                for link in &self.sink_links {
                    if let Ok(frame) = chain.output_frame(link.pin) {
                        interleave(frame.channels(), out, channels, link.first_channel);
                    }
                }
            }
            None => {
                let mut first_channel = 0;
                for buffer in &self.buffers {
                    interleave(buffer.channels(), out, channels, first_channel);
                    first_channel += buffer.num_channels();
                }
            }
        }

        if let Err(e) = sink.commit_period() {
            self.shared.stats().record_device_error();
            self.shared.emit(ZoneEvent::DeviceError {
                zone: Arc::clone(self.shared.name()),
                message: e.to_string(),
            });
        }
    }

    pub(crate) fn set_derived_state(&self, transition: ZoneTransition) {
        for derived in &self.derived {
            derived.runtime.shared.transition(transition);
        }
    }
}

fn feed_chain(chain: &mut AudioChain, links: &[PortLink], buffers: &[AudioFrame]) -> XbResult<()> {
    for link in links {
        let Some(buffer) = buffers.get(link.port_index) else {
            continue;
        };
        let frame = chain.input_frame_mut(link.pin)?;
        for (dst, src) in frame.channels_mut().iter_mut().zip(buffer.channels()) {
            dst.copy_from_slice(src);
        }
    }
    Ok(())
}

/// Write non-interleaved channels into an interleaved buffer starting at `first_channel`
fn interleave(channels: &[Vec<Sample>], out: &mut [Sample], out_channels: usize, first_channel: usize) {
    for (offset, channel) in channels.iter().enumerate() {
        let target = first_channel + offset;
        if target >= out_channels {
            break;
        }
        for (frame, &sample) in out.chunks_exact_mut(out_channels).zip(channel) {
            frame[target] = sample;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER LOOP
// ═══════════════════════════════════════════════════════════════════════════════

/// Body of a zone worker thread. Returns the runtime once `running` is cleared
/// or the sink closes; derived zones are left inactive. A closed sink also
/// leaves the zone itself inactive.
pub(crate) fn worker_loop(mut rt: Box<ZoneRuntime>, timeout: Duration) -> Box<ZoneRuntime> {
    let shared = Arc::clone(&rt.shared);

    while shared.is_running() {
        let Some(sink) = rt.sink.as_mut() else {
            break;
        };
        match sink.wait_for_period(timeout) {
            Ok(()) => {}
            Err(DeviceError::Timeout) => {
                shared.stats().record_timeout();
                shared.emit(ZoneEvent::DeviceTimeout {
                    zone: Arc::clone(shared.name()),
                });
                continue;
            }
            Err(e) => {
                log::error!("zone '{}': sink failed: {}", shared.name(), e);
                shared.stats().record_device_error();
                shared.emit(ZoneEvent::DeviceError {
                    zone: Arc::clone(shared.name()),
                    message: e.to_string(),
                });
                if e == DeviceError::Closed {
                    shared.set_running(false);
                    shared.transition(ZoneTransition::Inactivate);
                    break;
                }
                continue;
            }
        }
        if !shared.is_running() {
            break;
        }

        rt.run_period();

        for derived in &mut rt.derived {
            derived.countdown = derived.countdown.saturating_sub(1);
            if derived.countdown == 0 {
                derived.countdown = derived.ratio;
                derived.runtime.run_period();
            }
        }
    }

    rt.set_derived_state(ZoneTransition::Inactivate);
    rt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_offsets_and_clamps() {
        let mut out = vec![0.0; 6];
        let channels = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        interleave(&channels, &mut out, 3, 1);
        assert_eq!(out, vec![0.0, 1.0, 3.0, 0.0, 2.0, 4.0]);

        let mut out = vec![0.0; 4];
        interleave(&channels, &mut out, 2, 1);
        assert_eq!(out, vec![0.0, 1.0, 0.0, 2.0]);
    }
}
