//! Telemetry gate server: HTTP surface and settings
//!
//! The binary in `main.rs` wires these together; integration tests drive the
//! router directly.

pub mod api;
pub mod config;
