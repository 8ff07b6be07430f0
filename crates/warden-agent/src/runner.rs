use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use warden_core::types::ProcessDefinition;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
	#[error("program not found: {0}")]
	NotFound(String),

	#[error("unknown user: {0}")]
	UnknownUser(String),

	#[error("unknown group: {0}")]
	UnknownGroup(String),

	#[error("spawn failed: {0}")]
	Io(#[from] std::io::Error),
}

/// Launches child processes on behalf of a supervisor.
///
/// `exec` returns the OS pid synchronously on a successful spawn. A
/// background task then forwards the merged stdout/stderr byte stream to
/// `output` and, once the child exits, sends exactly one status on `exit`:
/// the exit code, 128 plus the terminating signal, or 127 when the program
/// could not be executed.
pub trait Runner: Send + Sync {
	fn exec(
		&self,
		def: &ProcessDefinition,
		output: mpsc::Sender<Vec<u8>>,
		exit: oneshot::Sender<i32>,
	) -> Result<i32, LaunchError>;
}

/// The real thing. Swap in a scripted [`Runner`] to test supervisors without
/// touching the OS.
pub struct ExecRunner;

impl Runner for ExecRunner {
	fn exec(
		&self,
		def: &ProcessDefinition,
		output: mpsc::Sender<Vec<u8>>,
		exit: oneshot::Sender<i32>,
	) -> Result<i32, LaunchError> {
		let program = resolve_program(&def.program)
			.ok_or_else(|| LaunchError::NotFound(def.program.clone()))?;

		let mut cmd = Command::new(&program);
		cmd.args(&def.arguments)
			.envs(&def.environment)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		if let Some(dir) = &def.working_directory {
			cmd.current_dir(dir);
		}

		apply_credentials(&mut cmd, def)?;

		let mut child = cmd.spawn().map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				LaunchError::NotFound(def.program.clone())
			} else {
				LaunchError::Io(e)
			}
		})?;

		let pid = child.id().map(|id| id as i32).unwrap_or(0);

		let out_handle = child.stdout.take().map(|stdout| {
			let out = output.clone();
			tokio::spawn(async move { pipe_output(stdout, out).await })
		});
		let err_handle = child.stderr.take().map(|stderr| {
			let out = output;
			tokio::spawn(async move { pipe_output(stderr, out).await })
		});

		tokio::spawn(async move {
			let status = child.wait().await;
			for handle in [out_handle, err_handle].into_iter().flatten() {
				let _ = handle.await;
			}
			let code = match status {
				Ok(st) => exit_code(st),
				Err(_) => 127,
			};
			let _ = exit.send(code);
		});

		Ok(pid)
	}
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
	use std::os::unix::process::ExitStatusExt;
	match status.code() {
		Some(code) => code,
		None => status.signal().map(|sig| 128 + sig).unwrap_or(127),
	}
}

async fn pipe_output<R>(mut reader: R, output: mpsc::Sender<Vec<u8>>)
where
	R: tokio::io::AsyncRead + Unpin,
{
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				// A gone consumer does not kill the child; keep draining
				// so the pipe never fills up.
				let _ = output.send(buf[..n].to_vec()).await;
			}
			Err(_) => break,
		}
	}
}

/// Resolve a program name the way execvp would: names containing a slash are
/// taken as paths, everything else is searched on PATH.
fn resolve_program(program: &str) -> Option<PathBuf> {
	if program.contains('/') {
		let path = PathBuf::from(program);
		return is_executable(&path).then_some(path);
	}

	let path_var = std::env::var_os("PATH")?;
	for dir in std::env::split_paths(&path_var) {
		let candidate = dir.join(program);
		if is_executable(&candidate) {
			return Some(candidate);
		}
	}
	None
}

fn is_executable(path: &Path) -> bool {
	match std::fs::metadata(path) {
		Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

/// Apply user/group from the definition. Only effective when running as
/// root; otherwise the fields are ignored.
fn apply_credentials(cmd: &mut Command, def: &ProcessDefinition) -> Result<(), LaunchError> {
	if !nix::unistd::geteuid().is_root() {
		return Ok(());
	}

	if let Some(user_name) = &def.user_name {
		let user = nix::unistd::User::from_name(user_name)
			.ok()
			.flatten()
			.ok_or_else(|| LaunchError::UnknownUser(user_name.clone()))?;
		cmd.uid(user.uid.as_raw());
		cmd.gid(user.gid.as_raw());
	}

	if let Some(group_name) = &def.group_name {
		let group = nix::unistd::Group::from_name(group_name)
			.ok()
			.flatten()
			.ok_or_else(|| LaunchError::UnknownGroup(group_name.clone()))?;
		cmd.gid(group.gid.as_raw());
	}

	Ok(())
}

/// Parse a signal name like `SIGTERM` (or just `TERM`) into a [`Signal`].
pub fn parse_signal(name: &str) -> Option<nix::sys::signal::Signal> {
	let upper = name.to_ascii_uppercase();
	let full = if upper.starts_with("SIG") {
		upper
	} else {
		format!("SIG{}", upper)
	};
	nix::sys::signal::Signal::from_str(&full).ok()
}
