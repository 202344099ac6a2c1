//! playlab-core - I/O-light primitives shared by the orchestration binary
//!
//! This crate provides the error taxonomy, retry poller, port allocator,
//! config patchers, and service descriptors that the orchestrator composes.

mod config;
mod error;
mod patch;
mod platform;
mod ports;
mod retry;

pub use config::*;
pub use error::*;
pub use patch::*;
pub use platform::*;
pub use ports::*;
pub use retry::*;
