use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use warden_agent::runner::{ExecRunner, LaunchError, Runner};
use warden_agent::supervisor::{Event, SupervisedProcess, SupervisorError};
use warden_core::types::{ProcessDefinition, ProcessState};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("warden-sup-{}-{}", n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn shell_def(name: &str, script: &str) -> ProcessDefinition {
	let mut def = ProcessDefinition::new(name, "sh");
	def.arguments = vec!["-c".to_string(), script.to_string()];
	def.keep_alive = false;
	def
}

fn spawn_real(def: ProcessDefinition) -> Arc<SupervisedProcess> {
	SupervisedProcess::spawn(def, Arc::new(ExecRunner))
}

async fn wait_for_state(proc: &SupervisedProcess, state: ProcessState, timeout: Duration) {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if proc.state() == state {
			return;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("timed out waiting for {}, current {}", state, proc.state());
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
}

// A runner the tests drive by hand: children are imaginary, exits happen
// when the test says so. Pids are far outside any real pid range so stray
// signals hit nothing.
struct ScriptedRunner {
	execs: AtomicU32,
	fail: AtomicBool,
	exits: std::sync::Mutex<Vec<oneshot::Sender<i32>>>,
}

impl ScriptedRunner {
	fn new() -> Self {
		Self {
			execs: AtomicU32::new(0),
			fail: AtomicBool::new(false),
			exits: std::sync::Mutex::new(Vec::new()),
		}
	}

	fn exec_count(&self) -> u32 {
		self.execs.load(Ordering::SeqCst)
	}

	fn exit_next(&self, status: i32) {
		let sender = self.exits.lock().unwrap().remove(0);
		let _ = sender.send(status);
	}
}

impl Runner for ScriptedRunner {
	fn exec(
		&self,
		def: &ProcessDefinition,
		_output: mpsc::Sender<Vec<u8>>,
		exit: oneshot::Sender<i32>,
	) -> Result<i32, LaunchError> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(LaunchError::NotFound(def.program.clone()));
		}
		let n = self.execs.fetch_add(1, Ordering::SeqCst) + 1;
		self.exits.lock().unwrap().push(exit);
		Ok(2_000_000_000 + n as i32)
	}
}

async fn wait_for_execs(runner: &ScriptedRunner, count: u32, timeout: Duration) {
	let deadline = tokio::time::Instant::now() + timeout;
	while runner.exec_count() < count {
		if tokio::time::Instant::now() >= deadline {
			panic!(
				"timed out waiting for {} execs, saw {}",
				count,
				runner.exec_count()
			);
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

// --- Lifecycle with real children ---

#[tokio::test]
async fn start_and_stop_lifecycle() {
	let proc = spawn_real(shell_def("sleeper", "sleep 30"));
	assert_eq!(proc.state(), ProcessState::Stopped);
	assert_eq!(proc.pid(), 0);

	let pid = proc.start().await.unwrap();
	assert!(pid > 0);
	assert_eq!(proc.state(), ProcessState::Running);
	assert_eq!(proc.pid(), pid);
	assert!(proc.status().started_at.is_some());

	proc.stop().await.unwrap();
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(5)).await;
	assert_eq!(proc.pid(), 0);
	assert!(proc.status().started_at.is_none());

	proc.shutdown().await;
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
	let proc = spawn_real(shell_def("sleeper", "sleep 30"));
	let pid = proc.start().await.unwrap();
	let again = proc.start().await.unwrap();
	assert_eq!(pid, again);
	proc.shutdown().await;
}

#[tokio::test]
async fn stop_on_stopped_is_ok() {
	let proc = spawn_real(shell_def("idle", "sleep 30"));
	proc.stop().await.unwrap();
	assert_eq!(proc.state(), ProcessState::Stopped);
	proc.shutdown().await;
}

#[tokio::test]
async fn graceful_stop_reports_signal_exit() {
	let proc = spawn_real(shell_def("sleeper", "sleep 30"));
	proc.start().await.unwrap();

	proc.stop().await.unwrap();
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(5)).await;

	// sh dies from the default SIGQUIT.
	let status = proc.status().last_exit_status.unwrap();
	assert_eq!(status, 128 + libc_sigquit());
	proc.shutdown().await;
}

fn libc_sigquit() -> i32 {
	nix::sys::signal::Signal::SIGQUIT as i32
}

#[tokio::test]
async fn force_kill_after_timeout() {
	let mut def = shell_def("stubborn", "trap '' QUIT; sleep 30");
	def.kill_timeout_secs = 1;
	let proc = spawn_real(def);
	proc.start().await.unwrap();
	// Give the shell a moment to install the trap.
	tokio::time::sleep(Duration::from_millis(200)).await;

	proc.stop().await.unwrap();
	assert_eq!(proc.state(), ProcessState::Stopping);

	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(5)).await;
	let status = proc.status().last_exit_status.unwrap();
	assert_eq!(status, 128 + nix::sys::signal::Signal::SIGKILL as i32);
	proc.shutdown().await;
}

#[tokio::test]
async fn zero_kill_timeout_escalates_immediately() {
	let mut def = shell_def("stubborn", "trap '' QUIT; sleep 30");
	def.kill_timeout_secs = 0;
	let proc = spawn_real(def);
	proc.start().await.unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	proc.stop().await.unwrap();
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(2)).await;
	assert_eq!(
		proc.status().last_exit_status.unwrap(),
		128 + nix::sys::signal::Signal::SIGKILL as i32
	);
	proc.shutdown().await;
}

#[tokio::test]
async fn launch_failure_leaves_stopped() {
	let proc = spawn_real(ProcessDefinition::new("ghost", "definitely-not-a-real-program"));
	let err = proc.start().await.unwrap_err();
	assert!(matches!(err, SupervisorError::Launch(LaunchError::NotFound(_))));
	assert_eq!(proc.state(), ProcessState::Stopped);
	assert_eq!(proc.pid(), 0);
	proc.shutdown().await;
}

#[tokio::test]
async fn disabled_process_refuses_start() {
	let mut def = shell_def("off", "sleep 30");
	def.disabled = true;
	let proc = spawn_real(def);
	assert!(matches!(
		proc.start().await,
		Err(SupervisorError::Disabled)
	));
	proc.shutdown().await;
}

#[tokio::test]
async fn events_start_then_stop() {
	let proc = spawn_real(shell_def("echoer", "sleep 30"));
	let mut events = proc.subscribe_events();

	proc.start().await.unwrap();
	proc.stop().await.unwrap();
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(5)).await;

	assert_eq!(events.recv().await.unwrap(), Event::Start);
	assert_eq!(events.recv().await.unwrap(), Event::Stop);
	proc.shutdown().await;
}

#[tokio::test]
async fn wait_observes_stop() {
	let proc = spawn_real(shell_def("sleeper", "sleep 30"));
	proc.start().await.unwrap();

	let waiter = {
		let proc = Arc::clone(&proc);
		tokio::spawn(async move { proc.wait().await })
	};
	// Let the waiter register before stopping.
	tokio::time::sleep(Duration::from_millis(50)).await;

	proc.stop().await.unwrap();
	tokio::time::timeout(Duration::from_secs(5), waiter)
		.await
		.expect("wait did not observe stop")
		.unwrap();
	proc.shutdown().await;
}

#[tokio::test]
async fn restart_yields_new_pid() {
	let mut def = shell_def("sleeper", "sleep 30");
	def.throttle_interval_secs = 1;
	let proc = spawn_real(def);

	let first = proc.start().await.unwrap();
	let second = proc.restart().await.unwrap();
	assert_ne!(first, second);
	assert_eq!(proc.state(), ProcessState::Running);
	proc.shutdown().await;
}

#[tokio::test]
async fn pid_file_written_and_removed() {
	let dir = temp_dir("pidfile");
	let pid_path = dir.join("sleeper.pid");
	let mut def = shell_def("sleeper", "sleep 30");
	def.pid_file = Some(pid_path.clone());
	let proc = spawn_real(def);

	let pid = proc.start().await.unwrap();
	let content = std::fs::read_to_string(&pid_path).unwrap();
	assert_eq!(content.trim().parse::<i32>().unwrap(), pid);

	proc.stop().await.unwrap();
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(5)).await;
	assert!(!pid_path.exists());

	proc.shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Respawn policy with a scripted runner and virtual time ---

fn scripted_def(name: &str) -> ProcessDefinition {
	let mut def = ProcessDefinition::new(name, "/bin/imaginary");
	def.keep_alive = true;
	def.throttle_interval_secs = 1;
	def
}

#[tokio::test(start_paused = true)]
async fn keep_alive_respawns_after_throttle() {
	let runner = Arc::new(ScriptedRunner::new());
	let proc = SupervisedProcess::spawn(scripted_def("crashy"), Arc::clone(&runner) as Arc<dyn Runner>);

	proc.start().await.unwrap();
	assert_eq!(runner.exec_count(), 1);

	runner.exit_next(1);
	wait_for_execs(&runner, 2, Duration::from_secs(10)).await;
	assert_eq!(proc.state(), ProcessState::Running);
}

#[tokio::test(start_paused = true)]
async fn crash_loop_backoff_doubles_delay() {
	let runner = Arc::new(ScriptedRunner::new());
	let proc = SupervisedProcess::spawn(scripted_def("crashy"), Arc::clone(&runner) as Arc<dyn Runner>);

	let begin = tokio::time::Instant::now();
	proc.start().await.unwrap();

	// Three rapid exits at 1s spacing, then the delay doubles to 2s.
	runner.exit_next(1);
	wait_for_execs(&runner, 2, Duration::from_secs(10)).await;
	runner.exit_next(1);
	wait_for_execs(&runner, 3, Duration::from_secs(10)).await;
	runner.exit_next(1);
	wait_for_execs(&runner, 4, Duration::from_secs(10)).await;

	let elapsed = begin.elapsed();
	assert!(
		elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(6),
		"expected ~4s of throttle+backoff, got {:?}",
		elapsed
	);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_respawn() {
	let runner = Arc::new(ScriptedRunner::new());
	let proc = SupervisedProcess::spawn(scripted_def("crashy"), Arc::clone(&runner) as Arc<dyn Runner>);

	proc.start().await.unwrap();
	runner.exit_next(1);
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(10)).await;

	proc.stop().await.unwrap();
	tokio::time::sleep(Duration::from_secs(3)).await;
	assert_eq!(runner.exec_count(), 1);
	assert_eq!(proc.state(), ProcessState::Stopped);

	proc.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_suppresses_respawn() {
	let runner = Arc::new(ScriptedRunner::new());
	let proc = SupervisedProcess::spawn(scripted_def("crashy"), Arc::clone(&runner) as Arc<dyn Runner>);

	proc.start().await.unwrap();
	runner.exit_next(1);
	wait_for_state(&proc, ProcessState::Stopped, Duration::from_secs(10)).await;

	proc.shutdown().await;
	tokio::time::sleep(Duration::from_secs(3)).await;
	assert_eq!(runner.exec_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn healthy_uptime_resets_backoff() {
	let runner = Arc::new(ScriptedRunner::new());
	let proc = SupervisedProcess::spawn(scripted_def("flappy"), Arc::clone(&runner) as Arc<dyn Runner>);

	proc.start().await.unwrap();

	// Three rapid exits push the delay to 2s.
	for expected in 2..=4 {
		runner.exit_next(1);
		wait_for_execs(&runner, expected, Duration::from_secs(20)).await;
	}

	// A healthy run longer than the throttle resets the policy.
	tokio::time::sleep(Duration::from_secs(2)).await;
	runner.exit_next(0);
	let begin = tokio::time::Instant::now();
	wait_for_execs(&runner, 5, Duration::from_secs(20)).await;
	let elapsed = begin.elapsed();
	assert!(
		elapsed < Duration::from_secs(2),
		"expected reset throttle of ~1s, got {:?}",
		elapsed
	);
}
