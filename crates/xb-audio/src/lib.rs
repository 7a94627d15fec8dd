//! xb-audio: Routing zones, switch matrix and device endpoints
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ SourceDevice │────▶│ SwitchMatrix  │────▶│ AudioChain  │────▶│ SinkDevice  │
//! │              │     │               │     │             │     │             │
//! │ - ring       │     │ - zone ports  │     │ - modules   │     │ - period    │
//! │ - readers    │     │ - jobs        │     │ - streams   │     │ - clock     │
//! └──────────────┘     └───────────────┘     └─────────────┘     └─────────────┘
//!                      └──────────── RoutingZone worker thread ──────────────┘
//! ```

mod device;
mod error;
mod registry;
mod ringbuf;
mod switch_matrix;
mod thread_priority;
mod zone;

pub use device::*;
pub use error::*;
pub use registry::*;
pub use ringbuf::*;
pub use switch_matrix::*;
pub use thread_priority::*;
pub use zone::*;
