//! In-place volume with a one-period linear ramp on every change

use xb_core::{Sample, XbError, XbResult};

use crate::chain::StreamSet;
use crate::module::{ModuleCommand, ModuleConfig, ProcessingModule};

/// Command code: ramp to `value` over the next period
pub const SET_VOLUME: u32 = 1;

/// Property holding the initial linear gain
pub const GAIN_PROPERTY: &str = "gain";

const RAMP_THRESHOLD: Sample = 1e-6;

#[derive(Debug, Clone)]
pub struct Volume {
    current: Sample,
    target: Sample,
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Volume {
    pub fn new(gain: Sample) -> Self {
        Self {
            current: gain,
            target: gain,
        }
    }

    pub fn gain(&self) -> Sample {
        self.current
    }

    pub fn target(&self) -> Sample {
        self.target
    }

    pub fn set_target(&mut self, gain: Sample) {
        self.target = gain;
    }

    fn is_ramping(&self) -> bool {
        (self.target - self.current).abs() > RAMP_THRESHOLD
    }
}

impl ProcessingModule for Volume {
    fn type_name(&self) -> &'static str {
        "volume"
    }

    fn init(&mut self, config: &ModuleConfig) -> XbResult<()> {
        if config.streams_to_process().is_empty() || !config.stream_mapping().is_empty() {
            return Err(XbError::InvalidParam(format!(
                "volume '{}' works on in-place pins only",
                config.name
            )));
        }
        if config.properties.contains(GAIN_PROPERTY) {
            let gain = config.properties.get_float(GAIN_PROPERTY)? as Sample;
            self.current = gain;
            self.target = gain;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.current = self.target;
    }

    fn process_child(&mut self, config: &ModuleConfig, streams: &mut StreamSet) -> XbResult<()> {
        let (start, end) = (self.current, self.target);
        let ramping = self.is_ramping();

        for &id in config.streams_to_process() {
            let (stream, bundles) = streams.stream_mut(id)?;
            stream.for_each_channel_mut(bundles, |_, mut view| {
                if ramping {
                    let step = (end - start) / view.len() as Sample;
                    for (i, s) in view.iter_mut().enumerate() {
                        *s *= start + step * (i + 1) as Sample;
                    }
                } else if (start - 1.0).abs() > RAMP_THRESHOLD {
                    for s in view.iter_mut() {
                        *s *= start;
                    }
                }
            });
        }

        self.current = end;
        Ok(())
    }

    fn handle_command(&mut self, _config: &ModuleConfig, command: &ModuleCommand) -> XbResult<()> {
        match command.code {
            SET_VOLUME => {
                self.set_target(command.value as Sample);
                Ok(())
            }
            code => Err(XbError::InvalidParam(format!("unknown volume command {}", code))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ModuleId, PinId};
    use crate::properties::{Properties, PropertyValue};
    use crate::stream::{StreamDescriptor, StreamId, StreamType};
    use approx::assert_relative_eq;

    const FRAMES: usize = 4;

    fn setup(props: Properties) -> (Volume, ModuleConfig, StreamSet) {
        let streams = StreamSet::from_descriptors(
            FRAMES,
            vec![StreamDescriptor {
                id: StreamId(0),
                name: "v".into(),
                stream_type: StreamType::Intermediate,
                num_channels: 1,
                frame_length: FRAMES,
                has_sid: false,
            }],
        )
        .unwrap();
        let mut config = ModuleConfig::new(ModuleId(0), "vol", FRAMES, 48000, props);
        config.add_in_place_stream(StreamId(0));
        config.bind_pin(PinId(0), StreamId(0), 1);

        let mut volume = Volume::default();
        volume.init(&config).unwrap();
        (volume, config, streams)
    }

    fn fill_ones(streams: &mut StreamSet) {
        let (stream, bundles) = streams.stream_mut(StreamId(0)).unwrap();
        stream.write_from_non_interleaved(bundles, &[vec![1.0; FRAMES]]).unwrap();
    }

    fn read(streams: &StreamSet) -> Vec<Sample> {
        let mut out = vec![vec![0.0; FRAMES]];
        streams.stream(StreamId(0)).unwrap().read(streams.bundles(), &mut out).unwrap();
        out.remove(0)
    }

    #[test]
    fn test_initial_gain_from_property() {
        let props = Properties::new().with(GAIN_PROPERTY, PropertyValue::Float(0.5));
        let (mut volume, config, mut streams) = setup(props);
        fill_ones(&mut streams);
        volume.process_child(&config, &mut streams).unwrap();
        assert_eq!(read(&streams), vec![0.5; FRAMES]);
    }

    #[test]
    fn test_ramp_reaches_target_in_one_period() {
        let (mut volume, config, mut streams) = setup(Properties::new());
        volume
            .handle_command(&config, &ModuleCommand::new(SET_VOLUME, 0.0))
            .unwrap();

        fill_ones(&mut streams);
        volume.process_child(&config, &mut streams).unwrap();
        let ramp = read(&streams);
        assert_relative_eq!(ramp[0], 0.75);
        assert_relative_eq!(ramp[1], 0.5);
        assert_relative_eq!(ramp[3], 0.0);
        assert_relative_eq!(volume.gain(), 0.0);

        fill_ones(&mut streams);
        volume.process_child(&config, &mut streams).unwrap();
        assert_eq!(read(&streams), vec![0.0; FRAMES]);
    }

    #[test]
    fn test_reset_snaps_to_target() {
        let (mut volume, _config, _) = setup(Properties::new());
        volume.set_target(0.25);
        volume.reset();
        assert_relative_eq!(volume.gain(), 0.25);
    }

    #[test]
    fn test_mapping_pins_rejected() {
        let mut config = ModuleConfig::new(ModuleId(0), "vol", FRAMES, 48000, Properties::new());
        config.add_mapping(StreamId(0), StreamId(1)).unwrap();
        assert!(Volume::default().init(&config).is_err());
    }
}
