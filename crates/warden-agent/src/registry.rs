use crate::supervisor::SupervisedProcess;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use warden_core::logbuf::{LogBuffer, LogRecord};
use warden_core::types::LogLevel;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("process already registered: {0}")]
	Duplicate(String),

	#[error("no such process: {0}")]
	NotFound(String),
}

/// Name-keyed table of supervisors owned by a running agent.
///
/// The registry owns the supervisors and pumps each child's output into the
/// shared log buffer; supervisors never reach back into the registry. Map
/// locks cover only map mutation, never I/O.
pub struct Registry {
	logbuf: Arc<LogBuffer>,
	procs: Mutex<HashMap<String, Arc<SupervisedProcess>>>,
	pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Registry {
	pub fn new(logbuf: Arc<LogBuffer>) -> Self {
		Self {
			logbuf,
			procs: Mutex::new(HashMap::new()),
			pumps: Mutex::new(HashMap::new()),
		}
	}

	/// Insert a supervisor by name and start pumping its output into the
	/// log buffer. Fails when the name is taken; the caller keeps ownership
	/// of the rejected supervisor.
	pub fn add(&self, proc: Arc<SupervisedProcess>) -> Result<(), RegistryError> {
		let name = proc.name().to_string();
		{
			let mut procs = self.procs.lock().expect("registry poisoned");
			if procs.contains_key(&name) {
				return Err(RegistryError::Duplicate(name));
			}
			procs.insert(name.clone(), Arc::clone(&proc));
		}

		if let Some(output) = proc.take_output() {
			let handle = tokio::spawn(pump_output(
				output,
				Arc::clone(&self.logbuf),
				name.clone(),
			));
			self.pumps.lock().expect("registry poisoned").insert(name, handle);
		}

		Ok(())
	}

	/// Shut the named supervisor down, wait for its child to be gone, and
	/// drop the entry. Removing an absent name is a safe `NotFound`.
	pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
		let proc = {
			let mut procs = self.procs.lock().expect("registry poisoned");
			procs.remove(name)
		}
		.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

		proc.shutdown().await;

		if let Some(pump) = self.pumps.lock().expect("registry poisoned").remove(name) {
			pump.abort();
		}
		tracing::info!(name, "deregistered process");
		Ok(())
	}

	pub fn find_by_name(&self, name: &str) -> Option<Arc<SupervisedProcess>> {
		self.procs.lock().expect("registry poisoned").get(name).cloned()
	}

	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self
			.procs
			.lock()
			.expect("registry poisoned")
			.keys()
			.cloned()
			.collect();
		names.sort();
		names
	}

	pub fn len(&self) -> usize {
		self.procs.lock().expect("registry poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Shut down every supervisor concurrently and clear the table. Each
	/// supervisor's own kill timeout bounds how long its child may linger,
	/// so this completes even with unresponsive children.
	pub async fn shutdown(&self) {
		let procs: Vec<Arc<SupervisedProcess>> = {
			let mut map = self.procs.lock().expect("registry poisoned");
			map.drain().map(|(_, p)| p).collect()
		};

		let mut tasks = JoinSet::new();
		for proc in procs {
			tasks.spawn(async move { proc.shutdown().await });
		}
		while tasks.join_next().await.is_some() {}

		let pumps: Vec<JoinHandle<()>> = {
			let mut map = self.pumps.lock().expect("registry poisoned");
			map.drain().map(|(_, h)| h).collect()
		};
		for pump in pumps {
			pump.abort();
		}
	}
}

/// Forward a child's output chunks to the log buffer, one line per record.
/// Partial lines are carried until the newline arrives.
async fn pump_output(mut output: mpsc::Receiver<Vec<u8>>, logbuf: Arc<LogBuffer>, source: String) {
	let mut pending: Vec<u8> = Vec::new();

	while let Some(chunk) = output.recv().await {
		pending.extend_from_slice(&chunk);
		while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
			let line: Vec<u8> = pending.drain(..=pos).collect();
			append_line(&logbuf, &source, &line);
		}
	}

	if !pending.is_empty() {
		append_line(&logbuf, &source, &pending);
	}
}

fn append_line(logbuf: &LogBuffer, source: &str, raw: &[u8]) {
	let line = String::from_utf8_lossy(raw)
		.trim_end_matches(['\n', '\r'])
		.to_string();
	logbuf.append(LogRecord::new(LogLevel::Info, source, line));
}
