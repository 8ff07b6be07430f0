use clap::{Parser, Subcommand};
use std::path::PathBuf;
use warden_agent::agent::{self, AgentConfig};
use warden_agent::client::RpcClient;
use warden_core::config;
use warden_core::types::LogLevel;

#[derive(Parser)]
#[command(name = "warden", version, about = "Per-host process supervisor")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the supervisor agent in the foreground
	Agent {
		/// JSON or TOML agent config file; may be given multiple times
		#[arg(long = "config-file")]
		config_file: Vec<PathBuf>,

		/// Directory of agent config files; may be given multiple times
		#[arg(long = "config-dir")]
		config_dir: Vec<PathBuf>,

		/// Log level (debug/info/warn/error)
		#[arg(long = "log-level")]
		log_level: Option<String>,

		/// Address to bind the RPC listener to
		#[arg(long = "rpc-addr")]
		rpc_addr: Option<String>,
	},

	/// Register processes from config files with the agent
	Register {
		/// Process config files or directories
		#[arg(required = true)]
		paths: Vec<String>,

		/// Don't start processes even if configured to start on load
		#[arg(long = "no-start")]
		no_start: bool,

		/// Don't watch the config files for changes
		#[arg(long = "no-watch")]
		no_watch: bool,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},

	/// Remove registered processes, stopping them first
	Deregister {
		#[arg(required = true)]
		names: Vec<String>,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},

	/// Start registered processes
	Start {
		#[arg(required = true)]
		names: Vec<String>,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},

	/// Stop running processes
	Stop {
		#[arg(required = true)]
		names: Vec<String>,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},

	/// Restart processes
	Restart {
		#[arg(required = true)]
		names: Vec<String>,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},

	/// Stream agent and process logs
	Monitor {
		/// Minimum log level to stream
		#[arg(long = "log-level", default_value = "info")]
		log_level: String,

		#[arg(long = "rpc-addr", default_value = AgentConfig::DEFAULT_RPC_ADDR)]
		rpc_addr: String,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
	match cli.command {
		Command::Agent {
			config_file,
			config_dir,
			log_level,
			rpc_addr,
		} => cmd_agent(config_file, config_dir, log_level, rpc_addr).await,

		Command::Register {
			paths,
			no_start,
			no_watch,
			rpc_addr,
		} => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			match client.register(paths, !no_watch, !no_start).await {
				Ok(names) => {
					println!("Successfully registered processes: {}", names.join(", "));
					0
				}
				Err(e) => {
					eprintln!("Error registering processes: {}", e);
					1
				}
			}
		}

		Command::Deregister { names, rpc_addr } => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			match client.deregister(names).await {
				Ok(removed) => {
					println!("Successfully deregistered processes: {}", removed.join(", "));
					0
				}
				Err(e) => {
					eprintln!("Error deregistering processes: {}", e);
					1
				}
			}
		}

		Command::Start { names, rpc_addr } => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			match client.start(names).await {
				Ok(pids) => {
					println!("Successfully started processes with PIDs: {}", join_pids(&pids));
					0
				}
				Err(e) => {
					eprintln!("Error starting processes: {}", e);
					1
				}
			}
		}

		Command::Stop { names, rpc_addr } => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			match client.stop(names).await {
				Ok(stopped) => {
					println!("Successfully stopped processes: {}", stopped.join(", "));
					0
				}
				Err(e) => {
					eprintln!("Error stopping processes: {}", e);
					1
				}
			}
		}

		Command::Restart { names, rpc_addr } => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			match client.restart(names).await {
				Ok(pids) => {
					println!("Successfully restarted processes with PIDs: {}", join_pids(&pids));
					0
				}
				Err(e) => {
					eprintln!("Error restarting processes: {}", e);
					1
				}
			}
		}

		Command::Monitor {
			log_level,
			rpc_addr,
		} => {
			let client = match connect(&rpc_addr).await {
				Some(client) => client,
				None => return 1,
			};
			let mut logs = match client.monitor(&log_level).await {
				Ok(logs) => logs,
				Err(e) => {
					eprintln!("Error starting monitor: {}", e);
					return 1;
				}
			};
			loop {
				tokio::select! {
					line = logs.recv() => match line {
						Some(line) => println!("{}", line),
						None => {
							eprintln!("Connection to agent lost");
							return 1;
						}
					},
					_ = tokio::signal::ctrl_c() => {
						client.close().await;
						return 0;
					}
				}
			}
		}
	}
}

async fn cmd_agent(
	config_file: Vec<PathBuf>,
	config_dir: Vec<PathBuf>,
	log_level: Option<String>,
	rpc_addr: Option<String>,
) -> i32 {
	let mut paths = config_file;
	paths.extend(config_dir);

	let file_config = match config::read_agent_config_paths(&paths) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{}", e);
			return 1;
		}
	};

	let mut config = AgentConfig::default();
	if let Some(addr) = rpc_addr.or(file_config.rpc_addr) {
		config.rpc_addr = addr;
	}
	let level = log_level.or(file_config.log_level);
	if let Some(level) = level {
		match level.parse::<LogLevel>() {
			Ok(level) => config.log_level = level,
			Err(e) => {
				eprintln!("{}", e);
				return 1;
			}
		}
	}

	let boot_paths = file_config.config_dir.into_iter().collect();
	agent::run_daemon(config, boot_paths).await
}

async fn connect(addr: &str) -> Option<RpcClient> {
	match RpcClient::connect(addr).await {
		Ok(client) => Some(client),
		Err(e) => {
			eprintln!("Error connecting to warden agent at {}: {}", addr, e);
			None
		}
	}
}

fn join_pids(pids: &[i32]) -> String {
	pids.iter()
		.map(|pid| pid.to_string())
		.collect::<Vec<_>>()
		.join(", ")
}
