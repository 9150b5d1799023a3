//! childproc core - platform-independent building blocks
//!
//! This crate provides the launch configuration, the error taxonomy, the
//! output buffers and timeout bookkeeping, and the traits that the
//! platform-specific crates implement for pipe multiplexing and signal
//! delivery.

mod buffer;
mod config;
mod error;
mod input;
mod pipes;
mod signal;
mod sink;
mod status;
mod timeout;
mod utils;

pub use buffer::*;
pub use config::*;
pub use error::*;
pub use input::*;
pub use pipes::*;
pub use signal::*;
pub use sink::*;
pub use status::*;
pub use timeout::*;
pub use utils::*;
