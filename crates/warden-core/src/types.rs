use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// A supervised program as declared in a configuration file. Immutable once
/// registered; the runtime state lives on the supervisor, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
	/// Unique name identifying the process within one agent.
	pub name: String,

	/// A disabled process stays registered but refuses to start.
	#[serde(default)]
	pub disabled: bool,

	/// Executable to run. Resolved against PATH when not an explicit path.
	pub program: String,

	#[serde(default)]
	pub arguments: Vec<String>,

	/// Extra environment variables, merged over the agent's own environment.
	#[serde(default)]
	pub environment: HashMap<String, String>,

	#[serde(default)]
	pub working_directory: Option<PathBuf>,

	/// User and group to run as. Only honored when the agent runs as root.
	#[serde(default)]
	pub user_name: Option<String>,
	#[serde(default)]
	pub group_name: Option<String>,

	/// Respawn the process when it exits on its own.
	#[serde(default = "default_true")]
	pub keep_alive: bool,

	/// Start the process as soon as it is registered.
	#[serde(default = "default_true")]
	pub run_at_load: bool,

	/// Signal name used to ask the process to exit gracefully.
	#[serde(default = "default_kill_signal")]
	pub kill_signal: String,

	/// Seconds to wait after `kill_signal` before force-killing.
	#[serde(default = "default_kill_timeout", rename = "kill_timeout")]
	pub kill_timeout_secs: u64,

	/// Minimum seconds between consecutive respawns.
	#[serde(default = "default_throttle", rename = "throttle_interval")]
	pub throttle_interval_secs: u64,

	/// When set, the child PID is written here on start and removed on stop.
	#[serde(default)]
	pub pid_file: Option<PathBuf>,
}

fn default_true() -> bool {
	true
}
fn default_kill_signal() -> String {
	"SIGQUIT".to_string()
}
fn default_kill_timeout() -> u64 {
	10
}
fn default_throttle() -> u64 {
	10
}

impl ProcessDefinition {
	/// Minimal definition with all defaults, mainly for tests and tools.
	pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			disabled: false,
			program: program.into(),
			arguments: Vec::new(),
			environment: HashMap::new(),
			working_directory: None,
			user_name: None,
			group_name: None,
			keep_alive: default_true(),
			run_at_load: default_true(),
			kill_signal: default_kill_signal(),
			kill_timeout_secs: default_kill_timeout(),
			throttle_interval_secs: default_throttle(),
			pid_file: None,
		}
	}

	pub fn kill_timeout(&self) -> Duration {
		Duration::from_secs(self.kill_timeout_secs)
	}

	pub fn throttle_interval(&self) -> Duration {
		Duration::from_secs(self.throttle_interval_secs)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
	Stopped,
	Starting,
	Running,
	Stopping,
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running)
	}
}

impl std::fmt::Display for ProcessState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ProcessState::Stopped => "stopped",
			ProcessState::Starting => "starting",
			ProcessState::Running => "running",
			ProcessState::Stopping => "stopping",
		};
		f.write_str(s)
	}
}

/// Point-in-time snapshot of a supervised process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
	pub state: ProcessState,
	pub pid: i32,
	pub started_at: Option<SystemTime>,
	pub last_exit_status: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Trace,
	Debug,
	Info,
	Warn,
	Error,
}

impl FromStr for LogLevel {
	type Err = ParseLogLevelError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"trace" => Ok(LogLevel::Trace),
			"debug" => Ok(LogLevel::Debug),
			"info" => Ok(LogLevel::Info),
			"warn" | "warning" => Ok(LogLevel::Warn),
			"error" => Ok(LogLevel::Error),
			_ => Err(ParseLogLevelError(s.to_string())),
		}
	}
}

impl std::fmt::Display for LogLevel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			LogLevel::Trace => "trace",
			LogLevel::Debug => "debug",
			LogLevel::Info => "info",
			LogLevel::Warn => "warn",
			LogLevel::Error => "error",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLogLevelError(pub String);
