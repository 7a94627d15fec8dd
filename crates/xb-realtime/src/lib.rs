//! # Crossbar Real-Time Engine
//!
//! Everything that runs once per period on the audio thread:
//! - Channel bundles and the bundle sequencer
//! - Audio streams with lazily converted layouts
//! - Processing-module core with commands and data probes
//! - Pipeline setup and the executable audio chain

pub mod bundle;
pub mod chain;
pub mod frame;
pub mod module;
pub mod modules;
pub mod pipeline;
pub mod probe;
pub mod properties;
pub mod sequencer;
pub mod stream;

pub use bundle::*;
pub use chain::*;
pub use frame::*;
pub use module::*;
pub use pipeline::*;
pub use probe::*;
pub use properties::*;
pub use sequencer::*;
pub use stream::*;
