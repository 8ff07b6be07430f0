//! Control-plane IPC server.
//!
//! Clients open a TCP connection to the agent, pin a protocol version with a
//! `handshake`, then issue commands and wait for responses. `monitor`
//! additionally subscribes the session to the log buffer and pushes records
//! down the same connection, keyed by the monitor request's sequence number.
//!
//! Each session runs two tasks: a reader that decodes frames in order, and a
//! worker that dispatches commands and writes responses. The split keeps the
//! reader responsive while registry work runs, without reordering responses
//! on the connection. All writes go through one lock so a header and its
//! body stay contiguous.

use crate::agent::Agent;
use crate::codec::{self, CodecError};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use warden_core::logbuf::{LogBuffer, LogRecord, RecvError};
use warden_core::protocol::{
	self, HandshakeRequest, LogBody, MonitorRequest, NamesBody, PidsBody, RegisterRequest,
	RequestHeader, ResponseHeader, commands, errors,
};
use warden_core::types::LogLevel;

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Handle to a running IPC listener.
pub struct AgentIpc {
	shutdown_tx: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

impl AgentIpc {
	/// Start accepting clients on an already-bound listener.
	pub fn start(listener: TcpListener, agent: Arc<Agent>) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(accept_loop(listener, agent, shutdown_rx));
		Self {
			shutdown_tx,
			handle,
		}
	}

	/// Stop accepting and tear down every open session.
	pub async fn shutdown(self) {
		let _ = self.shutdown_tx.send(true);
		let _ = self.handle.await;
	}
}

async fn accept_loop(listener: TcpListener, agent: Arc<Agent>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut sessions: JoinSet<()> = JoinSet::new();

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, addr)) => {
						tracing::debug!(%addr, "accepted IPC client");
						sessions.spawn(handle_session(stream, Arc::clone(&agent)));
					}
					Err(e) => {
						tracing::error!(error = %e, "failed to accept IPC client");
					}
				}
			}
			_ = shutdown_rx.changed() => break,
			Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
		}
	}

	// Dropping the tasks closes their sockets.
	sessions.shutdown().await;
}

enum RequestBody {
	Handshake(HandshakeRequest),
	Register(RegisterRequest),
	Names(NamesBody),
	Monitor(MonitorRequest),
	Unknown,
}

struct SessionRequest {
	seq: u64,
	command: String,
	body: RequestBody,
}

async fn handle_session(stream: TcpStream, agent: Arc<Agent>) {
	let (mut reader, writer) = stream.into_split();
	let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));

	let (req_tx, req_rx) = mpsc::channel::<SessionRequest>(32);
	let worker = tokio::spawn(session_worker(req_rx, Arc::clone(&writer), agent));

	loop {
		let header: RequestHeader = match codec::read_message(&mut reader).await {
			Ok(Some(header)) => header,
			Ok(None) => break,
			Err(e) => {
				log_read_error(&e);
				break;
			}
		};

		let body = match read_body(&mut reader, &header.command).await {
			Ok(Some(body)) => body,
			Ok(None) => break,
			Err(e) => {
				log_read_error(&e);
				break;
			}
		};

		let unknown = matches!(body, RequestBody::Unknown);
		let request = SessionRequest {
			seq: header.seq,
			command: header.command,
			body,
		};
		if req_tx.send(request).await.is_err() {
			break;
		}
		if unknown {
			// The body length of an unknown command is unknowable, so the
			// session cannot continue past it.
			break;
		}
	}

	drop(req_tx);
	let _ = worker.await;
}

/// Decode the body frame belonging to `command`. Unknown commands carry no
/// decodable body; the caller ends the session after the error response.
async fn read_body<R>(reader: &mut R, command: &str) -> Result<Option<RequestBody>, CodecError>
where
	R: tokio::io::AsyncRead + Unpin,
{
	let body = match command {
		commands::HANDSHAKE => codec::read_message(reader).await?.map(RequestBody::Handshake),
		commands::REGISTER => codec::read_message(reader).await?.map(RequestBody::Register),
		commands::DEREGISTER | commands::START | commands::STOP | commands::RESTART => {
			codec::read_message(reader).await?.map(RequestBody::Names)
		}
		commands::MONITOR => codec::read_message(reader).await?.map(RequestBody::Monitor),
		_ => Some(RequestBody::Unknown),
	};
	Ok(body)
}

fn log_read_error(e: &CodecError) {
	match e {
		CodecError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionReset => {}
		_ => tracing::debug!(error = %e, "failed to decode request"),
	}
}

async fn session_worker(
	mut requests: mpsc::Receiver<SessionRequest>,
	writer: SharedWriter,
	agent: Arc<Agent>,
) {
	// 0 until a successful handshake pins the version.
	let mut version: i32 = 0;
	let mut monitor: Option<JoinHandle<()>> = None;

	while let Some(request) = requests.recv().await {
		let seq = request.seq;

		if version == 0 && request.command != commands::HANDSHAKE {
			let _ = respond_error(&writer, seq, errors::HANDSHAKE_REQUIRED).await;
			if matches!(request.body, RequestBody::Unknown) {
				break;
			}
			continue;
		}

		match request.body {
			RequestBody::Handshake(handshake) => {
				let error = if handshake.version < protocol::MIN_IPC_VERSION
					|| handshake.version > protocol::MAX_IPC_VERSION
				{
					errors::UNSUPPORTED_IPC_VERSION
				} else if version != 0 {
					errors::DUPLICATE_HANDSHAKE
				} else {
					version = handshake.version;
					""
				};
				if error.is_empty() {
					let _ = respond_ok(&writer, seq).await;
				} else {
					let _ = respond_error(&writer, seq, error).await;
				}
			}

			RequestBody::Register(register) => {
				if register.watch_paths {
					tracing::debug!("config file watching is not implemented, ignoring watch_paths");
				}
				let mut names = Vec::new();
				for path in &register.config_paths {
					match agent
						.register_path(std::path::Path::new(path), register.start_on_load)
						.await
					{
						Ok(mut registered) => names.append(&mut registered),
						Err(e) => {
							tracing::warn!(path, error = %e, "register failed");
						}
					}
				}
				let _ = respond_body(&writer, seq, &NamesBody { names }).await;
			}

			RequestBody::Names(body) => match request.command.as_str() {
				commands::START => {
					let mut pids = Vec::new();
					for name in &body.names {
						match agent.start_process(name).await {
							Ok(pid) => pids.push(pid),
							Err(e) => tracing::debug!(name, error = %e, "start failed"),
						}
					}
					let _ = respond_body(&writer, seq, &PidsBody { pids }).await;
				}
				commands::STOP => {
					let mut names = Vec::new();
					for name in &body.names {
						match agent.stop_process(name).await {
							Ok(()) => names.push(name.clone()),
							Err(e) => tracing::debug!(name, error = %e, "stop failed"),
						}
					}
					let _ = respond_body(&writer, seq, &NamesBody { names }).await;
				}
				commands::RESTART => {
					let mut pids = Vec::new();
					for name in &body.names {
						match agent.restart_process(name).await {
							Ok(pid) => pids.push(pid),
							Err(e) => tracing::debug!(name, error = %e, "restart failed"),
						}
					}
					let _ = respond_body(&writer, seq, &PidsBody { pids }).await;
				}
				commands::DEREGISTER => {
					let mut names = Vec::new();
					for name in &body.names {
						match agent.deregister_process(name).await {
							Ok(()) => names.push(name.clone()),
							Err(e) => tracing::debug!(name, error = %e, "deregister failed"),
						}
					}
					let _ = respond_body(&writer, seq, &NamesBody { names }).await;
				}
				other => {
					tracing::debug!(command = other, "name-list body for unexpected command");
					let _ = respond_error(&writer, seq, errors::UNSUPPORTED_COMMAND).await;
					break;
				}
			},

			RequestBody::Monitor(monitor_req) => {
				if monitor.is_some() {
					let _ = respond_error(&writer, seq, errors::MONITOR_EXISTS).await;
					continue;
				}
				let Ok(level) = monitor_req.log_level.parse::<LogLevel>() else {
					let _ = respond_error(&writer, seq, errors::INVALID_LOG_LEVEL).await;
					continue;
				};
				if respond_ok(&writer, seq).await.is_err() {
					continue;
				}
				monitor = Some(tokio::spawn(stream_logs(
					Arc::clone(&writer),
					seq,
					Arc::clone(agent.log_buffer()),
					level,
				)));
			}

			RequestBody::Unknown => {
				let _ = respond_error(&writer, seq, errors::UNSUPPORTED_COMMAND).await;
				break;
			}
		}
	}

	if let Some(stream) = monitor {
		stream.abort();
	}
}

/// Push buffered and then live log records down the session, all under the
/// monitor request's sequence number.
async fn stream_logs(writer: SharedWriter, seq: u64, logbuf: Arc<LogBuffer>, level: LogLevel) {
	let (snapshot, mut sub) = logbuf.subscribe_with_snapshot(level);

	for record in snapshot {
		if send_log(&writer, seq, &record).await.is_err() {
			return;
		}
	}

	loop {
		match sub.recv().await {
			Ok(record) => {
				if send_log(&writer, seq, &record).await.is_err() {
					return;
				}
			}
			Err(RecvError::Lagged) => {
				tracing::warn!("monitor subscriber lagged, closing stream");
				return;
			}
			Err(RecvError::Closed) => return,
		}
	}
}

async fn send_log(writer: &SharedWriter, seq: u64, record: &LogRecord) -> Result<(), CodecError> {
	let line = format!(
		"[{}] {}: {}",
		record.level.to_string().to_uppercase(),
		record.source,
		record.line
	);
	respond(writer, ResponseHeader::ok(seq), Some(&LogBody { log: line })).await
}

async fn respond_ok(writer: &SharedWriter, seq: u64) -> Result<(), CodecError> {
	respond::<()>(writer, ResponseHeader::ok(seq), None).await
}

async fn respond_error(writer: &SharedWriter, seq: u64, error: &str) -> Result<(), CodecError> {
	respond::<()>(writer, ResponseHeader::error(seq, error), None).await
}

async fn respond_body<T: serde::Serialize>(
	writer: &SharedWriter,
	seq: u64,
	body: &T,
) -> Result<(), CodecError> {
	respond(writer, ResponseHeader::ok(seq), Some(body)).await
}

async fn respond<T: serde::Serialize>(
	writer: &SharedWriter,
	header: ResponseHeader,
	body: Option<&T>,
) -> Result<(), CodecError> {
	let mut writer = writer.lock().await;
	codec::write_message(&mut *writer, &header).await?;
	if let Some(body) = body {
		codec::write_message(&mut *writer, body).await?;
	}
	Ok(())
}
