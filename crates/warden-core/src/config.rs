use crate::types::ProcessDefinition;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("error reading '{path}': {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("error decoding '{path}': {message}")]
	Decode { path: PathBuf, message: String },

	#[error("error decoding '{path}': unknown format")]
	UnknownFormat { path: PathBuf },

	#[error("invalid definition in '{path}': {message}")]
	Invalid { path: PathBuf, message: String },
}

fn io_err(path: &Path, source: std::io::Error) -> ConfigError {
	ConfigError::Io {
		path: path.to_path_buf(),
		source,
	}
}

/// Load one process definition from a JSON or TOML file.
///
/// Files ending in `.json` or `.toml` are decoded by extension. Anything else
/// is sniffed: JSON first, then TOML, else rejected as unknown format.
/// Unknown keys are ignored in both formats.
pub fn load_definition(path: &Path) -> Result<ProcessDefinition, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
	let def = decode_definition(path, &content)?;
	validate_definition(path, &def)?;
	Ok(def)
}

fn decode_definition(path: &Path, content: &str) -> Result<ProcessDefinition, ConfigError> {
	match extension(path) {
		Some("json") => serde_json::from_str(content).map_err(|e| ConfigError::Decode {
			path: path.to_path_buf(),
			message: e.to_string(),
		}),
		Some("toml") => toml::from_str(content).map_err(|e| ConfigError::Decode {
			path: path.to_path_buf(),
			message: e.to_string(),
		}),
		_ => {
			if let Ok(def) = serde_json::from_str(content) {
				return Ok(def);
			}
			if let Ok(def) = toml::from_str(content) {
				return Ok(def);
			}
			Err(ConfigError::UnknownFormat {
				path: path.to_path_buf(),
			})
		}
	}
}

fn validate_definition(path: &Path, def: &ProcessDefinition) -> Result<(), ConfigError> {
	if def.name.is_empty() {
		return Err(ConfigError::Invalid {
			path: path.to_path_buf(),
			message: "name must not be empty".to_string(),
		});
	}
	if def.program.is_empty() {
		return Err(ConfigError::Invalid {
			path: path.to_path_buf(),
			message: "program must not be empty".to_string(),
		});
	}
	Ok(())
}

fn extension(path: &Path) -> Option<&str> {
	path.extension().and_then(|e| e.to_str())
}

/// Expand a config path into concrete definition files.
///
/// A file is returned as-is. A directory yields every `*.json` and `*.toml`
/// file directly inside it, in lexicographic order. Not recursive.
pub fn expand_config_path(path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
	let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
	if !meta.is_dir() {
		return Ok(vec![path.to_path_buf()]);
	}

	let mut files = Vec::new();
	let entries = std::fs::read_dir(path).map_err(|e| io_err(path, e))?;
	for entry in entries {
		let entry = entry.map_err(|e| io_err(path, e))?;
		let entry_path = entry.path();
		if entry_path.is_dir() {
			continue;
		}
		if matches!(extension(&entry_path), Some("json") | Some("toml")) {
			files.push(entry_path);
		}
	}
	files.sort();
	Ok(files)
}

/// Agent settings read from `--config-file` / `--config-dir` files.
///
/// Every field is optional so later files and command-line flags can
/// override earlier ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFileConfig {
	/// Address the RPC listener binds to.
	#[serde(default)]
	pub rpc_addr: Option<String>,

	/// Agent log level (debug/info/warn/error).
	#[serde(default)]
	pub log_level: Option<String>,

	/// Directory of process definitions registered when the agent boots.
	#[serde(default)]
	pub config_dir: Option<PathBuf>,
}

impl AgentFileConfig {
	/// Overlay `other` on top of `self`; set fields win.
	pub fn merge(self, other: AgentFileConfig) -> AgentFileConfig {
		AgentFileConfig {
			rpc_addr: other.rpc_addr.or(self.rpc_addr),
			log_level: other.log_level.or(self.log_level),
			config_dir: other.config_dir.or(self.config_dir),
		}
	}
}

fn decode_agent_config(path: &Path, content: &str) -> Result<AgentFileConfig, ConfigError> {
	match extension(path) {
		Some("json") => serde_json::from_str(content).map_err(|e| ConfigError::Decode {
			path: path.to_path_buf(),
			message: e.to_string(),
		}),
		Some("toml") => toml::from_str(content).map_err(|e| ConfigError::Decode {
			path: path.to_path_buf(),
			message: e.to_string(),
		}),
		_ => {
			if let Ok(config) = serde_json::from_str(content) {
				return Ok(config);
			}
			if let Ok(config) = toml::from_str(content) {
				return Ok(config);
			}
			Err(ConfigError::UnknownFormat {
				path: path.to_path_buf(),
			})
		}
	}
}

/// Read agent config files and directories in order, merging as we go.
pub fn read_agent_config_paths(paths: &[PathBuf]) -> Result<AgentFileConfig, ConfigError> {
	let mut result = AgentFileConfig::default();
	for path in paths {
		for file in expand_config_path(path)? {
			let content = std::fs::read_to_string(&file).map_err(|e| io_err(&file, e))?;
			let config = decode_agent_config(&file, &content)?;
			result = result.merge(config);
		}
	}
	Ok(result)
}
