//! xb-core: Shared types for the crossbar engine
//!
//! Sample type, bundle geometry, the error taxonomy used by every crate and
//! the engine configuration.

mod config;
mod error;
mod sample;

pub use config::*;
pub use error::*;
pub use sample::*;
