//! End-to-End Audio Chain Tests
//!
//! Builds pipelines through the public setup API and runs them period by
//! period:
//! - 2x2 gain mixer
//! - delayed feedback links
//! - in-place modules and pass-through
//! - runtime commands and data probes

use approx::assert_abs_diff_eq;
use xb_core::{EngineConfig, Sample, XbError, XbResult};
use xb_realtime::modules::gain_mixer::{GAINS_PROPERTY, SET_GAIN};
use xb_realtime::modules::volume::SET_VOLUME;
use xb_realtime::modules::{GainMixer, Volume};
use xb_realtime::{
    AudioChain, LinkType, ModuleCommand, ModuleConfig, ModuleId, PinId, PinParams, Pipeline,
    ProbeDirection, ProcessingModule, Properties, PropertyValue, StreamSet,
};

const FRAMES: usize = 64;

fn engine_config() -> EngineConfig {
    EngineConfig {
        frame_length: FRAMES,
        ..Default::default()
    }
}

fn pin(p: &mut Pipeline, name: &str, channels: usize) -> PinId {
    p.create_audio_pin(PinParams::new(name, channels)).unwrap()
}

fn input_signal(period: usize, pin: usize, ch: usize) -> Vec<Sample> {
    (0..FRAMES)
        .map(|i| {
            let t = (period * FRAMES + i) as Sample;
            ((t * 0.01 * (ch + 1) as Sample).sin() * 0.5) * if pin == 0 { 1.0 } else { -0.7 }
        })
        .collect()
}

fn fill_input(chain: &mut AudioChain, pin: PinId, period: usize, pin_index: usize) {
    let frame = chain.input_frame_mut(pin).unwrap();
    for ch in 0..frame.num_channels() {
        let signal = input_signal(period, pin_index, ch);
        frame.channel_mut(ch).copy_from_slice(&signal);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 2x2 GAIN MIXER
// ═══════════════════════════════════════════════════════════════════════════════

struct Mixer2x2 {
    chain: AudioChain,
    mixer: ModuleId,
    inputs: [PinId; 2],
    outputs: [PinId; 2],
    module_in: [PinId; 2],
    module_out: [PinId; 2],
}

/// out0 = 0.5 * in0 + 0.25 * in1, out1 = in0 - in1
fn build_mixer_2x2() -> Mixer2x2 {
    let mut p = Pipeline::new("mixer", &engine_config()).unwrap();
    let inputs = [pin(&mut p, "in0", 2), pin(&mut p, "in1", 2)];
    let outputs = [pin(&mut p, "out0", 2), pin(&mut p, "out1", 2)];
    let module_in = [pin(&mut p, "mix.in0", 2), pin(&mut p, "mix.in1", 2)];
    let module_out = [pin(&mut p, "mix.out0", 2), pin(&mut p, "mix.out1", 2)];

    for &i in &inputs {
        p.add_audio_input_pin(i).unwrap();
    }
    for &o in &outputs {
        p.add_audio_output_pin(o).unwrap();
    }

    let module = GainMixer::new()
        .with_gain(module_in[0], module_out[0], 0.5)
        .with_gain(module_in[1], module_out[0], 0.25)
        .with_gain(module_in[1], module_out[1], -1.0);
    let mixer = p.add_processing_module("mix", Box::new(module), Properties::new()).unwrap();
    for &mi in &module_in {
        for &mo in &module_out {
            p.add_audio_pin_mapping(mixer, mi, mo).unwrap();
        }
    }

    for k in 0..2 {
        p.link(inputs[k], module_in[k], LinkType::Immediate).unwrap();
        p.link(module_out[k], outputs[k], LinkType::Immediate).unwrap();
    }

    Mixer2x2 {
        chain: p.init_audio_chain().unwrap(),
        mixer,
        inputs,
        outputs,
        module_in,
        module_out,
    }
}

#[test]
fn test_gain_mixer_2x2_over_periods() {
    let mut m = build_mixer_2x2();
    assert_eq!(m.chain.streams().len(), 4);

    for period in 0..6 {
        fill_input(&mut m.chain, m.inputs[0], period, 0);
        fill_input(&mut m.chain, m.inputs[1], period, 1);
        m.chain.process().unwrap();

        for ch in 0..2 {
            let a = input_signal(period, 0, ch);
            let b = input_signal(period, 1, ch);
            let out0 = m.chain.output_frame(m.outputs[0]).unwrap().channel(ch);
            let out1 = m.chain.output_frame(m.outputs[1]).unwrap().channel(ch);
            for i in 0..FRAMES {
                assert_abs_diff_eq!(out0[i], 0.5 * a[i] + 0.25 * b[i], epsilon = 1e-6);
                assert_abs_diff_eq!(out1[i], a[i] - b[i], epsilon = 1e-6);
            }
        }
    }
    assert_eq!(m.chain.periods(), 6);
}

#[test]
fn test_gain_command_applies_next_period() {
    let mut m = build_mixer_2x2();
    let mut handle = m.chain.take_module_handle(m.mixer).unwrap();
    assert!(m.chain.take_module_handle(m.mixer).is_none());

    handle
        .send_command(ModuleCommand::new(SET_GAIN, 0.0).with_pins(m.module_in[1], None))
        .unwrap();

    fill_input(&mut m.chain, m.inputs[0], 0, 0);
    fill_input(&mut m.chain, m.inputs[1], 0, 1);
    m.chain.process().unwrap();

    let a = input_signal(0, 0, 1);
    let out0 = m.chain.output_frame(m.outputs[0]).unwrap().channel(1);
    let out1 = m.chain.output_frame(m.outputs[1]).unwrap().channel(1);
    for i in 0..FRAMES {
        assert_abs_diff_eq!(out0[i], 0.5 * a[i], epsilon = 1e-6);
        assert_abs_diff_eq!(out1[i], a[i], epsilon = 1e-6);
    }
}

fn listed_gain_mixer(gains: Vec<f64>) -> XbResult<(AudioChain, [PinId; 2], PinId)> {
    let mut p = Pipeline::new("listed", &engine_config())?;
    let inputs = [pin(&mut p, "in0", 1), pin(&mut p, "in1", 1)];
    let output = pin(&mut p, "out", 1);
    let mix_in = [pin(&mut p, "mix.in0", 1), pin(&mut p, "mix.in1", 1)];
    let mix_out = pin(&mut p, "mix.out", 1);
    p.add_audio_output_pin(output)?;

    let props = Properties::new().with(GAINS_PROPERTY, PropertyValue::FloatList(gains));
    let mixer = p.add_processing_module("mix", Box::new(GainMixer::new()), props)?;
    for k in 0..2 {
        p.add_audio_input_pin(inputs[k])?;
        p.add_audio_pin_mapping(mixer, mix_in[k], mix_out)?;
        p.link(inputs[k], mix_in[k], LinkType::Immediate)?;
    }
    p.link(mix_out, output, LinkType::Immediate)?;
    Ok((p.init_audio_chain()?, inputs, output))
}

#[test]
fn test_gain_list_property_sets_pairs_in_mapping_order() {
    let (mut chain, inputs, output) = listed_gain_mixer(vec![0.5, -2.0]).unwrap();
    chain.input_frame_mut(inputs[0]).unwrap().channel_mut(0).fill(1.0);
    chain.input_frame_mut(inputs[1]).unwrap().channel_mut(0).fill(0.25);
    chain.process().unwrap();

    let out = chain.output_frame(output).unwrap().channel(0);
    assert!(out.iter().all(|&s| (s - 0.0).abs() < 1e-6), "{:?}", &out[..4]);

    chain.input_frame_mut(inputs[1]).unwrap().channel_mut(0).fill(0.0);
    chain.process().unwrap();
    let out = chain.output_frame(output).unwrap().channel(0);
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6), "{:?}", &out[..4]);

    assert!(matches!(listed_gain_mixer(vec![1.0]), Err(XbError::InvalidParam(_))));
}

#[test]
fn test_disabled_mixer_outputs_silence() {
    let mut m = build_mixer_2x2();
    let mut handle = m.chain.take_module_handle(m.mixer).unwrap();
    handle.disable().unwrap();

    fill_input(&mut m.chain, m.inputs[0], 0, 0);
    fill_input(&mut m.chain, m.inputs[1], 0, 1);
    m.chain.process().unwrap();

    let out = m.chain.output_frame(m.outputs[0]).unwrap();
    assert!(out.channels().iter().flatten().all(|&s| s == 0.0));
}

#[test]
fn test_output_probe_matches_output_frame() {
    let mut m = build_mixer_2x2();
    let mut handle = m.chain.take_module_handle(m.mixer).unwrap();
    let mut recording = handle
        .start_recording(m.module_out[1], ProbeDirection::Output, FRAMES)
        .unwrap();

    fill_input(&mut m.chain, m.inputs[0], 3, 0);
    fill_input(&mut m.chain, m.inputs[1], 3, 1);
    m.chain.process().unwrap();

    let mut recorded = Vec::new();
    recording.drain_into(&mut recorded);
    assert_eq!(recorded.len(), 2 * FRAMES);

    let out = m.chain.output_frame(m.outputs[1]).unwrap();
    for ch in 0..2 {
        for i in 0..FRAMES {
            assert_abs_diff_eq!(recorded[ch * FRAMES + i], out.channel(ch)[i], epsilon = 1e-6);
        }
    }

    assert!(matches!(
        handle.start_recording(m.inputs[0], ProbeDirection::Input, FRAMES),
        Err(XbError::InvalidPin(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// DELAYED LINKS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_delayed_feedback_lags_one_period() {
    let mut p = Pipeline::new("echo", &engine_config()).unwrap();
    let input = pin(&mut p, "in", 1);
    let output = pin(&mut p, "out", 1);
    let m_in = pin(&mut p, "fb.in", 1);
    let m_fb = pin(&mut p, "fb.loop", 1);
    let m_out = pin(&mut p, "fb.out", 1);
    p.add_audio_input_pin(input).unwrap();
    p.add_audio_output_pin(output).unwrap();

    let module = GainMixer::new().with_gain(m_fb, m_out, 0.5);
    let fb = p.add_processing_module("fb", Box::new(module), Properties::new()).unwrap();
    p.add_audio_pin_mapping(fb, m_in, m_out).unwrap();
    p.add_audio_pin_mapping(fb, m_fb, m_out).unwrap();

    p.link(input, m_in, LinkType::Immediate).unwrap();
    p.link(m_out, output, LinkType::Immediate).unwrap();
    p.link(m_out, m_fb, LinkType::Delayed).unwrap();

    let mut chain = p.init_audio_chain().unwrap();
    let expected = [1.0, 0.5, 0.25, 0.125];
    for (period, &value) in expected.iter().enumerate() {
        let level = if period == 0 { 1.0 } else { 0.0 };
        chain.input_frame_mut(input).unwrap().channel_mut(0).fill(level);
        chain.process().unwrap();
        let out = chain.output_frame(output).unwrap().channel(0);
        assert!(out.iter().all(|&s| (s - value).abs() < 1e-6), "period {}: {:?}", period, &out[..4]);
    }
}

#[test]
fn test_immediate_cycle_rejected_delayed_accepted() {
    let build = |kind: LinkType| -> XbResult<AudioChain> {
        let mut p = Pipeline::new("loop", &engine_config())?;
        let a_io = p.create_audio_pin(PinParams::new("a.io", 1))?;
        let b_in = p.create_audio_pin(PinParams::new("b.in", 1))?;
        let b_out = p.create_audio_pin(PinParams::new("b.out", 1))?;
        let a = p.add_processing_module("a", Box::new(Volume::default()), Properties::new())?;
        let b = p.add_processing_module("b", Box::new(GainMixer::new()), Properties::new())?;
        p.add_audio_in_out_pin(a, a_io)?;
        p.add_audio_pin_mapping(b, b_in, b_out)?;
        p.link(a_io, b_in, LinkType::Immediate)?;
        p.link(b_out, a_io, kind)?;
        p.init_audio_chain()
    };

    assert!(matches!(build(LinkType::Immediate), Err(XbError::Failed(_))));
    let chain = build(LinkType::Delayed).unwrap();
    assert_eq!(chain.execution_order(), vec!["a", "b"]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-PLACE PROCESSING
// ═══════════════════════════════════════════════════════════════════════════════

fn volume_chain(gain: f64) -> (AudioChain, PinId, PinId, ModuleId) {
    let mut p = Pipeline::new("volume", &engine_config()).unwrap();
    let input = pin(&mut p, "in", 6);
    let output = pin(&mut p, "out", 6);
    let io = pin(&mut p, "vol.io", 6);
    p.add_audio_input_pin(input).unwrap();
    p.add_audio_output_pin(output).unwrap();
    let props = Properties::new().with("gain", PropertyValue::Float(gain));
    let vol = p.add_processing_module("vol", Box::new(Volume::default()), props).unwrap();
    p.add_audio_in_out_pin(vol, io).unwrap();
    p.link(input, io, LinkType::Immediate).unwrap();
    p.link(io, output, LinkType::Immediate).unwrap();
    (p.init_audio_chain().unwrap(), input, output, vol)
}

#[test]
fn test_in_place_volume_on_multichannel_stream() {
    let (mut chain, input, output, _) = volume_chain(0.5);
    {
        let frame = chain.input_frame_mut(input).unwrap();
        for ch in 0..6 {
            frame.channel_mut(ch).fill(ch as Sample + 1.0);
        }
    }
    chain.process().unwrap();

    let out = chain.output_frame(output).unwrap();
    for ch in 0..6 {
        assert!(out.channel(ch).iter().all(|&s| (s - (ch as Sample + 1.0) * 0.5).abs() < 1e-6));
    }
}

#[test]
fn test_disabled_in_place_module_passes_input_through() {
    let (mut chain, input, output, vol) = volume_chain(0.0);
    let mut handle = chain.take_module_handle(vol).unwrap();
    handle.disable().unwrap();

    chain.input_frame_mut(input).unwrap().channel_mut(4).fill(0.3);
    chain.process().unwrap();
    assert!(chain.output_frame(output).unwrap().channel(4).iter().all(|&s| s == 0.3));

    handle.enable().unwrap();
    handle.send_command(ModuleCommand::new(SET_VOLUME, 0.0)).unwrap();
    chain.process().unwrap();
    assert!(chain.output_frame(output).unwrap().channel(4).iter().all(|&s| s == 0.0));
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAILURES
// ═══════════════════════════════════════════════════════════════════════════════

struct Broken;

impl ProcessingModule for Broken {
    fn type_name(&self) -> &'static str {
        "broken"
    }

    fn process_child(&mut self, _config: &ModuleConfig, _streams: &mut StreamSet) -> XbResult<()> {
        Err(XbError::Failed("dsp fault".into()))
    }
}

#[test]
fn test_module_failure_silences_outputs() {
    let mut p = Pipeline::new("broken", &engine_config()).unwrap();
    let input = pin(&mut p, "in", 1);
    let output = pin(&mut p, "out", 1);
    let io = pin(&mut p, "b.io", 1);
    p.add_audio_input_pin(input).unwrap();
    p.add_audio_output_pin(output).unwrap();
    let b = p.add_processing_module("b", Box::new(Broken), Properties::new()).unwrap();
    p.add_audio_in_out_pin(b, io).unwrap();
    p.link(input, io, LinkType::Immediate).unwrap();
    p.link(io, output, LinkType::Immediate).unwrap();
    let mut chain = p.init_audio_chain().unwrap();

    chain.input_frame_mut(input).unwrap().channel_mut(0).fill(1.0);
    assert!(matches!(chain.process(), Err(XbError::Failed(_))));
    assert!(chain.output_frame(output).unwrap().channel(0).iter().all(|&s| s == 0.0));
}
