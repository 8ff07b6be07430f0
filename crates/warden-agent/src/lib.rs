//! # warden-agent
//!
//! Runtime of the warden process supervisor: the per-process supervisor
//! loops, the registry that owns them, the child-process runner, and both
//! ends of the control-plane RPC.
//!
//! The daemon entrypoint is [`agent::run_daemon`]; command-line clients use
//! [`client::RpcClient`].

pub mod agent;
pub mod client;
pub mod codec;
pub mod ipc;
pub mod registry;
pub mod runner;
pub mod supervisor;
pub mod trace;

pub use agent::{Agent, AgentConfig};
pub use client::RpcClient;
pub use registry::Registry;
pub use runner::{ExecRunner, Runner};
pub use supervisor::SupervisedProcess;
