use crate::runner::{LaunchError, Runner, parse_signal};
use nix::sys::signal::Signal;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use warden_core::types::{ProcessDefinition, ProcessState, ProcessStatus};

/// Ceiling for the crash-loop respawn delay.
pub const MAX_RESPAWN_DELAY: Duration = Duration::from_secs(60);

/// Consecutive rapid exits before the respawn delay starts doubling.
const RAPID_EXIT_THRESHOLD: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
	#[error("process is disabled")]
	Disabled,

	#[error("operation not valid while {0}")]
	WrongState(ProcessState),

	#[error(transparent)]
	Launch(#[from] LaunchError),

	#[error("supervisor is shut down")]
	Terminated,
}

/// Lifecycle hints published to whoever is listening. Lossy by design; the
/// supervisor's state is the authoritative record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	Start,
	Stop,
}

enum Op {
	Start,
	Stop,
	Restart,
	Shutdown,
}

type Reply = oneshot::Sender<Result<i32, SupervisorError>>;

struct Command {
	op: Op,
	reply: Reply,
}

struct StatusInner {
	state: ProcessState,
	pid: i32,
	started_at: Option<SystemTime>,
	last_exit_status: Option<i32>,
}

struct ProcShared {
	def: Arc<ProcessDefinition>,
	status: Mutex<StatusInner>,
	events: broadcast::Sender<Event>,
	stopped: Notify,
}

/// One supervised child program. Cheap to share; all mutations happen on the
/// dedicated control loop, commands and exit notifications are serialized on
/// a single queue so observations stay consistent.
pub struct SupervisedProcess {
	shared: Arc<ProcShared>,
	cmd_tx: mpsc::Sender<Command>,
	terminated: watch::Receiver<bool>,
	output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl SupervisedProcess {
	/// Create the supervisor for `def` and spawn its control loop.
	pub fn spawn(def: ProcessDefinition, runner: Arc<dyn Runner>) -> Arc<Self> {
		let def = Arc::new(def);
		let (cmd_tx, cmd_rx) = mpsc::channel(16);
		let (output_tx, output_rx) = mpsc::channel(64);
		let (events, _) = broadcast::channel(8);
		let (term_tx, term_rx) = watch::channel(false);

		let shared = Arc::new(ProcShared {
			def,
			status: Mutex::new(StatusInner {
				state: ProcessState::Stopped,
				pid: 0,
				started_at: None,
				last_exit_status: None,
			}),
			events,
			stopped: Notify::new(),
		});

		tokio::spawn(control_loop(
			Arc::clone(&shared),
			runner,
			output_tx,
			cmd_rx,
			term_tx,
		));

		Arc::new(Self {
			shared,
			cmd_tx,
			terminated: term_rx,
			output_rx: Mutex::new(Some(output_rx)),
		})
	}

	pub fn definition(&self) -> &ProcessDefinition {
		&self.shared.def
	}

	pub fn name(&self) -> &str {
		&self.shared.def.name
	}

	pub fn status(&self) -> ProcessStatus {
		let status = self.shared.status.lock().expect("status poisoned");
		ProcessStatus {
			state: status.state,
			pid: status.pid,
			started_at: status.started_at,
			last_exit_status: status.last_exit_status,
		}
	}

	pub fn state(&self) -> ProcessState {
		self.shared.status.lock().expect("status poisoned").state
	}

	pub fn pid(&self) -> i32 {
		self.shared.status.lock().expect("status poisoned").pid
	}

	/// Lifecycle event stream. Events are dropped when nobody is listening
	/// or a listener lags; poll [`Self::status`] for the truth.
	pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
		self.shared.events.subscribe()
	}

	/// The merged stdout/stderr channel. The registry takes this exactly
	/// once when the process is added.
	pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
		self.output_rx.lock().expect("output poisoned").take()
	}

	/// Resolves on the next transition to `Stopped`. Any number of callers
	/// may wait; all observe the same transition.
	pub async fn wait(&self) {
		self.shared.stopped.notified().await;
	}

	async fn command(&self, op: Op) -> Result<i32, SupervisorError> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Command { op, reply })
			.await
			.map_err(|_| SupervisorError::Terminated)?;
		rx.await.map_err(|_| SupervisorError::Terminated)?
	}

	/// Start the child. Idempotent: returns the existing pid when already
	/// running.
	pub async fn start(&self) -> Result<i32, SupervisorError> {
		self.command(Op::Start).await
	}

	/// Ask the child to exit with the definition's kill signal; force-kills
	/// after the kill timeout. Idempotent on a stopped process.
	pub async fn stop(&self) -> Result<(), SupervisorError> {
		self.command(Op::Stop).await.map(|_| ())
	}

	/// Stop, wait out the throttle, start again. Resolves with the new pid
	/// once the relaunch has been attempted.
	pub async fn restart(&self) -> Result<i32, SupervisorError> {
		self.command(Op::Restart).await
	}

	/// Gracefully stop and permanently suppress respawn, then wait for the
	/// control loop to finish.
	pub async fn shutdown(&self) {
		let _ = self.command(Op::Shutdown).await;
		let mut terminated = self.terminated.clone();
		let _ = terminated.wait_for(|done| *done).await;
	}
}

async fn control_loop(
	shared: Arc<ProcShared>,
	runner: Arc<dyn Runner>,
	output_tx: mpsc::Sender<Vec<u8>>,
	mut cmd_rx: mpsc::Receiver<Command>,
	term_tx: watch::Sender<bool>,
) {
	let throttle = shared.def.throttle_interval();

	// Child bookkeeping, owned exclusively by this task.
	let mut exit_rx: Option<oneshot::Receiver<i32>> = None;
	let mut child_pid: i32 = 0;
	let mut started = Instant::now();
	let mut stopping = false;
	let mut kill_at: Option<Instant> = None;

	let mut shutting_down = false;
	let mut cmd_closed = false;
	let mut respawn_at: Option<Instant> = None;
	let mut restart_reply: Option<Reply> = None;

	// Crash-loop backoff.
	let mut delay = throttle;
	let mut rapid_exits: u32 = 0;

	loop {
		let kill_time = kill_at;
		let respawn_time = respawn_at;

		tokio::select! {
			cmd = cmd_rx.recv(), if !cmd_closed => {
				let Some(Command { op, reply }) = cmd else {
					// Every handle is gone; wind down like a shutdown.
					cmd_closed = true;
					shutting_down = true;
					respawn_at = None;
					if exit_rx.is_some() && !stopping {
						kill_at = initiate_stop(&shared, child_pid, &mut stopping);
					}
					if exit_rx.is_none() {
						break;
					}
					continue;
				};

				match op {
					Op::Start => {
						if shutting_down {
							let _ = reply.send(Err(SupervisorError::Terminated));
						} else if exit_rx.is_some() {
							if stopping {
								let _ = reply.send(Err(SupervisorError::WrongState(ProcessState::Stopping)));
							} else {
								// Already running.
								let _ = reply.send(Ok(child_pid));
							}
						} else {
							respawn_at = None;
							let result = attempt_start(&shared, runner.as_ref(), &output_tx);
							match result {
								Ok((pid, rx)) => {
									exit_rx = Some(rx);
									child_pid = pid;
									started = Instant::now();
									let _ = reply.send(Ok(pid));
								}
								Err(e) => {
									let _ = reply.send(Err(e));
								}
							}
						}
					}
					Op::Stop => {
						respawn_at = None;
						if let Some(pending) = restart_reply.take() {
							let _ = pending.send(Err(SupervisorError::Terminated));
						}
						if exit_rx.is_some() && !stopping {
							kill_at = initiate_stop(&shared, child_pid, &mut stopping);
						}
						let _ = reply.send(Ok(child_pid));
					}
					Op::Restart => {
						if shutting_down {
							let _ = reply.send(Err(SupervisorError::Terminated));
						} else if exit_rx.is_some() {
							if !stopping {
								kill_at = initiate_stop(&shared, child_pid, &mut stopping);
							}
							if let Some(previous) = restart_reply.replace(reply) {
								let _ = previous.send(Err(SupervisorError::Terminated));
							}
						} else {
							respawn_at = None;
							let result = attempt_start(&shared, runner.as_ref(), &output_tx);
							match result {
								Ok((pid, rx)) => {
									exit_rx = Some(rx);
									child_pid = pid;
									started = Instant::now();
									let _ = reply.send(Ok(pid));
								}
								Err(e) => {
									let _ = reply.send(Err(e));
								}
							}
						}
					}
					Op::Shutdown => {
						shutting_down = true;
						respawn_at = None;
						if let Some(pending) = restart_reply.take() {
							let _ = pending.send(Err(SupervisorError::Terminated));
						}
						if exit_rx.is_some() && !stopping {
							kill_at = initiate_stop(&shared, child_pid, &mut stopping);
						}
						let _ = reply.send(Ok(0));
						if exit_rx.is_none() {
							break;
						}
					}
				}
			}

			status = async { exit_rx.as_mut().expect("child armed").await }, if exit_rx.is_some() => {
				let status = status.unwrap_or(-1);
				let was_stopping = stopping;
				exit_rx = None;
				child_pid = 0;
				stopping = false;
				kill_at = None;

				record_exit(&shared, status);

				let uptime = started.elapsed();
				if restart_reply.is_some() {
					respawn_at = Some(Instant::now() + throttle);
				} else if !was_stopping
					&& !shutting_down
					&& shared.def.keep_alive
					&& !shared.def.disabled
				{
					if uptime >= throttle {
						rapid_exits = 0;
						delay = throttle;
					} else {
						rapid_exits += 1;
						if rapid_exits >= RAPID_EXIT_THRESHOLD {
							delay = std::cmp::min(delay * 2, MAX_RESPAWN_DELAY);
						}
					}
					let wait = delay.saturating_sub(uptime);
					tracing::info!(
						name = %shared.def.name,
						delay_secs = wait.as_secs(),
						"scheduling respawn"
					);
					respawn_at = Some(Instant::now() + wait);
				}

				if shutting_down {
					break;
				}
			}

			_ = tokio::time::sleep_until(kill_time.unwrap_or_else(Instant::now)), if kill_time.is_some() => {
				kill_at = None;
				tracing::warn!(
					name = %shared.def.name,
					pid = child_pid,
					"kill timeout expired, sending SIGKILL"
				);
				send_signal(child_pid, Signal::SIGKILL);
			}

			_ = tokio::time::sleep_until(respawn_time.unwrap_or_else(Instant::now)), if respawn_time.is_some() && !shutting_down => {
				respawn_at = None;
				let result = attempt_start(&shared, runner.as_ref(), &output_tx);
				let outcome = match result {
					Ok((pid, rx)) => {
						exit_rx = Some(rx);
						child_pid = pid;
						started = Instant::now();
						Ok(pid)
					}
					Err(e) => Err(e),
				};
				if let Some(pending) = restart_reply.take() {
					let _ = pending.send(outcome);
				}
			}
		}
	}

	if let Some(pending) = restart_reply.take() {
		let _ = pending.send(Err(SupervisorError::Terminated));
	}
	let _ = term_tx.send(true);
}

/// Launch the child and publish the Running state. Runs on the control loop.
fn attempt_start(
	shared: &ProcShared,
	runner: &dyn Runner,
	output_tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(i32, oneshot::Receiver<i32>), SupervisorError> {
	if shared.def.disabled {
		return Err(SupervisorError::Disabled);
	}

	{
		let mut status = shared.status.lock().expect("status poisoned");
		status.state = ProcessState::Starting;
	}

	let (exit_tx, exit_rx) = oneshot::channel();
	match runner.exec(&shared.def, output_tx.clone(), exit_tx) {
		Ok(pid) => {
			{
				let mut status = shared.status.lock().expect("status poisoned");
				status.state = ProcessState::Running;
				status.pid = pid;
				status.started_at = Some(SystemTime::now());
			}
			write_pid_file(&shared.def, pid);
			let _ = shared.events.send(Event::Start);
			tracing::info!(name = %shared.def.name, pid, "process started");
			Ok((pid, exit_rx))
		}
		Err(e) => {
			{
				let mut status = shared.status.lock().expect("status poisoned");
				status.state = ProcessState::Stopped;
			}
			tracing::warn!(name = %shared.def.name, error = %e, "failed to launch process");
			Err(e.into())
		}
	}
}

/// Send the graceful signal and arm the kill timeout. A zero timeout
/// escalates to SIGKILL immediately.
fn initiate_stop(shared: &ProcShared, pid: i32, stopping: &mut bool) -> Option<Instant> {
	let sig = parse_signal(&shared.def.kill_signal).unwrap_or(Signal::SIGQUIT);
	tracing::info!(name = %shared.def.name, pid, signal = %sig, "stopping process");
	send_signal(pid, sig);
	*stopping = true;

	{
		let mut status = shared.status.lock().expect("status poisoned");
		status.state = ProcessState::Stopping;
	}

	let timeout = shared.def.kill_timeout();
	if timeout.is_zero() {
		send_signal(pid, Signal::SIGKILL);
		None
	} else {
		Some(Instant::now() + timeout)
	}
}

fn record_exit(shared: &ProcShared, status: i32) {
	{
		let mut inner = shared.status.lock().expect("status poisoned");
		inner.state = ProcessState::Stopped;
		inner.pid = 0;
		inner.started_at = None;
		inner.last_exit_status = Some(status);
	}
	remove_pid_file(&shared.def);
	let _ = shared.events.send(Event::Stop);
	shared.stopped.notify_waiters();
	tracing::info!(name = %shared.def.name, status, "process exited");
}

fn send_signal(pid: i32, sig: Signal) {
	if pid <= 0 {
		return;
	}
	if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig) {
		tracing::debug!(pid, signal = %sig, error = %e, "signal delivery failed");
	}
}

fn write_pid_file(def: &ProcessDefinition, pid: i32) {
	if let Some(path) = &def.pid_file {
		if let Err(e) = std::fs::write(path, format!("{}\n", pid)) {
			tracing::warn!(name = %def.name, path = %path.display(), error = %e, "failed to write pid file");
		}
	}
}

fn remove_pid_file(def: &ProcessDefinition) {
	if let Some(path) = &def.pid_file {
		let _ = std::fs::remove_file(path);
	}
}
