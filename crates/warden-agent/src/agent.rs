use crate::registry::{Registry, RegistryError};
use crate::runner::{ExecRunner, Runner, parse_signal};
use crate::supervisor::{SupervisedProcess, SupervisorError};
use crate::{ipc, trace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use warden_core::config::{self, ConfigError};
use warden_core::logbuf::LogBuffer;
use warden_core::types::LogLevel;

/// Agent-wide settings. Defaults live here as associated constants so tests
/// can override them per instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub rpc_addr: String,
	pub log_level: LogLevel,
	/// Outer deadline for a graceful daemon shutdown.
	pub graceful_timeout: Duration,
	pub log_capacity: usize,
}

impl AgentConfig {
	pub const DEFAULT_RPC_ADDR: &'static str = "127.0.0.1:7373";
	pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(3);
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			rpc_addr: Self::DEFAULT_RPC_ADDR.to_string(),
			log_level: LogLevel::Info,
			graceful_timeout: Self::DEFAULT_GRACEFUL_TIMEOUT,
			log_capacity: warden_core::logbuf::DEFAULT_CAPACITY,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Registry(#[from] RegistryError),

	#[error(transparent)]
	Supervisor(#[from] SupervisorError),

	#[error("unknown kill signal '{signal}' in '{name}'")]
	UnknownSignal { name: String, signal: String },
}

/// Ties the registry, log buffer, and runner together; the IPC layer talks
/// to the rest of the system through this.
pub struct Agent {
	config: AgentConfig,
	logbuf: Arc<LogBuffer>,
	registry: Registry,
	runner: Arc<dyn Runner>,
}

impl Agent {
	pub fn new(config: AgentConfig) -> Arc<Self> {
		Self::with_runner(config, Arc::new(ExecRunner))
	}

	pub fn with_runner(config: AgentConfig, runner: Arc<dyn Runner>) -> Arc<Self> {
		let logbuf = Arc::new(LogBuffer::new(config.log_capacity));
		let registry = Registry::new(Arc::clone(&logbuf));
		Arc::new(Self {
			config,
			logbuf,
			registry,
			runner,
		})
	}

	pub fn config(&self) -> &AgentConfig {
		&self.config
	}

	pub fn log_buffer(&self) -> &Arc<LogBuffer> {
		&self.logbuf
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Register every definition found at `path` (a file, or a directory of
	/// `*.json` / `*.toml` files in lexicographic order). When
	/// `start_on_load` is set, definitions with `run_at_load` are started;
	/// launch failures are logged, the process stays registered.
	pub async fn register_path(
		&self,
		path: &Path,
		start_on_load: bool,
	) -> Result<Vec<String>, AgentError> {
		let mut names = Vec::new();
		for file in config::expand_config_path(path)? {
			let def = config::load_definition(&file)?;
			if parse_signal(&def.kill_signal).is_none() {
				return Err(AgentError::UnknownSignal {
					name: def.name.clone(),
					signal: def.kill_signal.clone(),
				});
			}

			let name = def.name.clone();
			let run_at_load = def.run_at_load;
			let proc = SupervisedProcess::spawn(def, Arc::clone(&self.runner));

			if let Err(e) = self.registry.add(Arc::clone(&proc)) {
				proc.shutdown().await;
				return Err(e.into());
			}
			tracing::info!(name = %name, config = %file.display(), "registered process");

			if start_on_load && run_at_load {
				if let Err(e) = proc.start().await {
					tracing::warn!(name = %name, error = %e, "failed to start process at load");
				}
			}
			names.push(name);
		}
		Ok(names)
	}

	pub async fn start_process(&self, name: &str) -> Result<i32, AgentError> {
		let proc = self
			.registry
			.find_by_name(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
		Ok(proc.start().await?)
	}

	pub async fn stop_process(&self, name: &str) -> Result<(), AgentError> {
		let proc = self
			.registry
			.find_by_name(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
		Ok(proc.stop().await?)
	}

	pub async fn restart_process(&self, name: &str) -> Result<i32, AgentError> {
		let proc = self
			.registry
			.find_by_name(name)
			.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
		Ok(proc.restart().await?)
	}

	pub async fn deregister_process(&self, name: &str) -> Result<(), AgentError> {
		Ok(self.registry.remove(name).await?)
	}

	pub async fn shutdown(&self) {
		tracing::info!("shutting down all processes");
		self.registry.shutdown().await;
	}
}

/// Run the agent daemon until a shutdown signal arrives. Returns the process
/// exit code.
///
/// SIGINT and SIGTERM trigger a graceful shutdown bounded by
/// [`AgentConfig::graceful_timeout`]; a second signal or a blown deadline
/// exits 1. SIGHUP is accepted but exits 1 without stopping children.
pub async fn run_daemon(config: AgentConfig, boot_paths: Vec<PathBuf>) -> i32 {
	let agent = Agent::new(config.clone());

	trace::init_logging(config.log_level, Arc::clone(agent.log_buffer()));

	for path in &boot_paths {
		match agent.register_path(path, true).await {
			Ok(names) => {
				tracing::info!(count = names.len(), path = %path.display(), "loaded processes")
			}
			Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to load config"),
		}
	}

	let listener = match TcpListener::bind(&config.rpc_addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!(addr = %config.rpc_addr, error = %e, "failed to bind RPC listener");
			return 1;
		}
	};
	tracing::info!(addr = %config.rpc_addr, "agent RPC listening");

	let ipc = ipc::AgentIpc::start(listener, Arc::clone(&agent));

	let mut sigint = match signal(SignalKind::interrupt()) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!(error = %e, "failed to install signal handler");
			return 1;
		}
	};
	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!(error = %e, "failed to install signal handler");
			return 1;
		}
	};
	let mut sighup = match signal(SignalKind::hangup()) {
		Ok(s) => s,
		Err(e) => {
			tracing::error!(error = %e, "failed to install signal handler");
			return 1;
		}
	};

	let graceful = tokio::select! {
		_ = sigint.recv() => true,
		_ = sigterm.recv() => true,
		_ = sighup.recv() => {
			tracing::info!("caught SIGHUP, exiting");
			false
		}
	};
	if !graceful {
		return 1;
	}

	tracing::info!("gracefully shutting down agent");
	let shutdown = async {
		ipc.shutdown().await;
		agent.shutdown().await;
	};

	tokio::select! {
		_ = shutdown => 0,
		_ = tokio::time::sleep(config.graceful_timeout) => {
			tracing::error!("graceful shutdown deadline exceeded");
			1
		}
		_ = sigint.recv() => 1,
		_ = sigterm.recv() => 1,
	}
}
