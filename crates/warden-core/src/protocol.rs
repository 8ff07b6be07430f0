//! Control-plane wire types.
//!
//! Every message on the wire is one length-prefixed MessagePack frame: a
//! 4-byte big-endian payload length followed by the msgpack encoding of one
//! of the structs below (maps keyed by field name). A request is a
//! [`RequestHeader`] frame followed by a command-specific body frame; a
//! response is a [`ResponseHeader`] frame followed by a body frame when the
//! command defines one and the header carries no error.

use serde::{Deserialize, Serialize};

/// Protocol versions accepted by the handshake.
pub const MIN_IPC_VERSION: i32 = 1;
pub const MAX_IPC_VERSION: i32 = 1;

pub mod commands {
	pub const HANDSHAKE: &str = "handshake";
	pub const REGISTER: &str = "register";
	pub const DEREGISTER: &str = "deregister";
	pub const START: &str = "start";
	pub const STOP: &str = "stop";
	pub const RESTART: &str = "restart";
	pub const MONITOR: &str = "monitor";
}

pub mod errors {
	pub const UNSUPPORTED_COMMAND: &str = "Unsupported command";
	pub const UNSUPPORTED_IPC_VERSION: &str = "Unsupported IPC version";
	pub const DUPLICATE_HANDSHAKE: &str = "Handshake already performed";
	pub const HANDSHAKE_REQUIRED: &str = "Handshake required";
	pub const MONITOR_EXISTS: &str = "Monitor already exists";
	pub const INVALID_LOG_LEVEL: &str = "Invalid log level";
}

/// Sent before each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
	pub command: String,
	pub seq: u64,
}

/// Sent before each response. An empty `error` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
	pub seq: u64,
	pub error: String,
}

impl ResponseHeader {
	pub fn ok(seq: u64) -> Self {
		Self {
			seq,
			error: String::new(),
		}
	}

	pub fn error(seq: u64, error: impl Into<String>) -> Self {
		Self {
			seq,
			error: error.into(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
	pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
	pub config_paths: Vec<String>,
	pub start_on_load: bool,
	/// Accepted for forward compatibility; the agent does not watch files.
	pub watch_paths: bool,
}

/// Request and response body for the name-list commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamesBody {
	pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsBody {
	pub pids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRequest {
	pub log_level: String,
}

/// One streamed log line, pushed after a `monitor` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBody {
	pub log: String,
}
