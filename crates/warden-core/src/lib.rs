//! # warden-core
//!
//! Shared types for the warden process supervisor: process definitions and
//! their JSON/TOML decoding, the control-plane wire types, and the in-memory
//! log ring buffer.

pub mod config;
pub mod logbuf;
pub mod protocol;
pub mod types;

pub use logbuf::{LogBuffer, LogRecord, LogSubscription};
pub use types::{LogLevel, ProcessDefinition, ProcessState, ProcessStatus};
