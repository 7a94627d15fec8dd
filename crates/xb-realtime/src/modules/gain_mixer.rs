//! Gain mixer
//!
//! Every output stream is the weighted sum of the input streams mapped onto
//! it. Gains are per (input, output) pair and can be changed at runtime.

use xb_core::{Sample, XbError, XbResult, clear, mix_add};

use crate::chain::StreamSet;
use crate::module::{ModuleCommand, ModuleConfig, ProcessingModule};
use crate::pipeline::PinId;
use crate::stream::StreamId;

/// Command code: set the gain of `pins[0]` into `pins[1]`, or into every
/// output when `pins[1]` is `None`
pub const SET_GAIN: u32 = 1;

/// Property holding the gain of every pair not set explicitly
pub const DEFAULT_GAIN_PROPERTY: &str = "default_gain";

/// Property listing one gain per (input, output) pair, outputs in mapping
/// order and inputs in mapping order within each output
pub const GAINS_PROPERTY: &str = "gains";

#[derive(Debug, Clone, Copy)]
struct GainEntry {
    input: StreamId,
    output: StreamId,
    gain: Sample,
}

#[derive(Debug, Default)]
pub struct GainMixer {
    preset: Vec<(PinId, PinId, Sample)>,
    gains: Vec<GainEntry>,
}

impl GainMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial gain of one pair, applied at init
    pub fn with_gain(mut self, input: PinId, output: PinId, gain: Sample) -> Self {
        self.preset.push((input, output, gain));
        self
    }

    pub fn gain(&self, input: StreamId, output: StreamId) -> Option<Sample> {
        self.gains
            .iter()
            .find(|e| e.input == input && e.output == output)
            .map(|e| e.gain)
    }

    fn entry_mut(&mut self, input: StreamId, output: StreamId) -> XbResult<&mut GainEntry> {
        self.gains
            .iter_mut()
            .find(|e| e.input == input && e.output == output)
            .ok_or_else(|| XbError::InvalidParam(format!("{} is not mapped to {}", input, output)))
    }
}

impl ProcessingModule for GainMixer {
    fn type_name(&self) -> &'static str {
        "gain_mixer"
    }

    fn init(&mut self, config: &ModuleConfig) -> XbResult<()> {
        if !config.streams_to_process().is_empty() {
            return Err(XbError::InvalidParam(format!(
                "gain mixer '{}' has no in-place pins",
                config.name
            )));
        }
        let default_gain = config.properties.get_float_or(DEFAULT_GAIN_PROPERTY, 1.0)? as Sample;

        self.gains.clear();
        for (output, inputs) in config.stream_mapping().iter() {
            for &input in inputs {
                self.gains.push(GainEntry {
                    input,
                    output,
                    gain: default_gain,
                });
            }
        }

        if config.properties.contains(GAINS_PROPERTY) {
            let gains = config.properties.get_float_list(GAINS_PROPERTY)?;
            if gains.len() != self.gains.len() {
                return Err(XbError::InvalidParam(format!(
                    "gain mixer '{}' has {} pairs, '{}' lists {}",
                    config.name,
                    self.gains.len(),
                    GAINS_PROPERTY,
                    gains.len()
                )));
            }
            for (entry, &gain) in self.gains.iter_mut().zip(gains) {
                entry.gain = gain as Sample;
            }
        }

        for (in_pin, out_pin, gain) in std::mem::take(&mut self.preset) {
            let (input, output) = (config.stream_of_pin(in_pin)?, config.stream_of_pin(out_pin)?);
            self.entry_mut(input, output)?.gain = gain;
        }
        Ok(())
    }

    fn process_child(&mut self, config: &ModuleConfig, streams: &mut StreamSet) -> XbResult<()> {
        for (output, inputs) in config.stream_mapping().iter() {
            {
                let (out, bundles) = streams.stream_mut(output)?;
                for channel in out.as_non_interleaved(bundles).channels_mut() {
                    clear(channel);
                }
            }

            for &input in inputs {
                let gain = self.gain(input, output).unwrap_or(0.0);
                let (src, dst, bundles) = streams.stream_pair_mut(input, output)?;
                let src = src.as_non_interleaved(bundles);
                let dst = dst.as_non_interleaved(bundles);
                for ch in 0..dst.num_channels().min(src.num_channels()) {
                    mix_add(dst.channel_mut(ch), src.channel(ch), gain);
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, config: &ModuleConfig, command: &ModuleCommand) -> XbResult<()> {
        if command.code != SET_GAIN {
            return Err(XbError::InvalidParam(format!("unknown gain mixer command {}", command.code)));
        }
        let in_pin = command.pins[0]
            .ok_or_else(|| XbError::InvalidParam("set gain needs an input pin".into()))?;
        let input = config.stream_of_pin(in_pin)?;
        let gain = command.value as Sample;

        match command.pins[1] {
            Some(out_pin) => {
                let output = config.stream_of_pin(out_pin)?;
                self.entry_mut(input, output)?.gain = gain;
            }
            None => {
                let mut found = false;
                for entry in self.gains.iter_mut().filter(|e| e.input == input) {
                    entry.gain = gain;
                    found = true;
                }
                if !found {
                    return Err(XbError::InvalidPin(format!("{} feeds no output", in_pin)));
                }
            }
        }
        Ok(())
    }
}
