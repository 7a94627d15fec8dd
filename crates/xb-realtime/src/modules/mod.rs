//! Built-in processing modules

pub mod gain_mixer;
pub mod volume;

pub use gain_mixer::GainMixer;
pub use volume::Volume;
