//! Control-plane RPC client.
//!
//! One TCP connection per client. Requests are multiplexed by sequence
//! number: a reader task decodes response headers, looks up the waiting
//! handler, and — when the command defines a body — consumes the body frame
//! on the reader's own context so the stream never desynchronizes. In-flight
//! requests complete with [`ClientError::Closed`] when the client closes.

use crate::codec::{self, CodecError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use warden_core::protocol::{
	self, HandshakeRequest, LogBody, MonitorRequest, NamesBody, PidsBody, RegisterRequest,
	RequestHeader, ResponseHeader, commands,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("client closed")]
	Closed,

	/// Error string reported by the agent.
	#[error("{0}")]
	Remote(String),

	#[error(transparent)]
	Codec(#[from] CodecError),

	#[error("connect failed: {0}")]
	Connect(std::io::Error),
}

enum Handler {
	Unary {
		expects_body: bool,
		tx: oneshot::Sender<Result<Vec<u8>, ClientError>>,
	},
	Stream {
		init: Option<oneshot::Sender<Result<(), ClientError>>>,
		tx: mpsc::Sender<String>,
	},
}

type Dispatch = Arc<Mutex<HashMap<u64, Handler>>>;

/// RPC client for one agent connection. Safe to share; concurrent requests
/// interleave on the wire and are matched back up by sequence number.
pub struct RpcClient {
	seq: AtomicU64,
	writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
	dispatch: Dispatch,
	closed: Arc<AtomicBool>,
	reader: JoinHandle<()>,
}

impl RpcClient {
	/// Dial the agent, start the reader, and perform the handshake. Fails if
	/// the handshake is rejected.
	pub async fn connect(addr: &str) -> Result<Self, ClientError> {
		let stream = TcpStream::connect(addr)
			.await
			.map_err(ClientError::Connect)?;
		let (read_half, write_half) = stream.into_split();

		let dispatch: Dispatch = Arc::new(Mutex::new(HashMap::new()));
		let closed = Arc::new(AtomicBool::new(false));
		let reader = tokio::spawn(reader_loop(
			read_half,
			Arc::clone(&dispatch),
			Arc::clone(&closed),
		));

		let client = Self {
			seq: AtomicU64::new(0),
			writer: Arc::new(tokio::sync::Mutex::new(write_half)),
			dispatch,
			closed,
			reader,
		};

		client.handshake().await?;
		Ok(client)
	}

	/// Register processes from config files on the agent host. Returns the
	/// names actually registered.
	pub async fn register(
		&self,
		config_paths: Vec<String>,
		watch_paths: bool,
		start_on_load: bool,
	) -> Result<Vec<String>, ClientError> {
		let body = RegisterRequest {
			config_paths,
			start_on_load,
			watch_paths,
		};
		let bytes = self.request(commands::REGISTER, &body, true).await?;
		let names: NamesBody = codec::decode(&bytes)?;
		Ok(names.names)
	}

	pub async fn deregister(&self, names: Vec<String>) -> Result<Vec<String>, ClientError> {
		let bytes = self
			.request(commands::DEREGISTER, &NamesBody { names }, true)
			.await?;
		let removed: NamesBody = codec::decode(&bytes)?;
		Ok(removed.names)
	}

	/// Start the named processes; returns the pid of each one that started.
	pub async fn start(&self, names: Vec<String>) -> Result<Vec<i32>, ClientError> {
		let bytes = self
			.request(commands::START, &NamesBody { names }, true)
			.await?;
		let pids: PidsBody = codec::decode(&bytes)?;
		Ok(pids.pids)
	}

	pub async fn stop(&self, names: Vec<String>) -> Result<Vec<String>, ClientError> {
		let bytes = self
			.request(commands::STOP, &NamesBody { names }, true)
			.await?;
		let stopped: NamesBody = codec::decode(&bytes)?;
		Ok(stopped.names)
	}

	pub async fn restart(&self, names: Vec<String>) -> Result<Vec<i32>, ClientError> {
		let bytes = self
			.request(commands::RESTART, &NamesBody { names }, true)
			.await?;
		let pids: PidsBody = codec::decode(&bytes)?;
		Ok(pids.pids)
	}

	/// Subscribe this connection to the agent's log stream. Log lines arrive
	/// on the returned channel until the client closes or the receiver is
	/// dropped.
	pub async fn monitor(&self, log_level: &str) -> Result<mpsc::Receiver<String>, ClientError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(ClientError::Closed);
		}

		let seq = self.next_seq();
		let (init_tx, init_rx) = oneshot::channel();
		let (tx, rx) = mpsc::channel(256);
		self.dispatch.lock().expect("dispatch poisoned").insert(
			seq,
			Handler::Stream {
				init: Some(init_tx),
				tx,
			},
		);

		if self.closed.load(Ordering::SeqCst) {
			self.dispatch.lock().expect("dispatch poisoned").remove(&seq);
			return Err(ClientError::Closed);
		}

		let body = MonitorRequest {
			log_level: log_level.to_string(),
		};
		if let Err(e) = self.send(seq, commands::MONITOR, &body).await {
			self.dispatch.lock().expect("dispatch poisoned").remove(&seq);
			return Err(e);
		}

		match init_rx.await {
			Ok(Ok(())) => Ok(rx),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(ClientError::Closed),
		}
	}

	/// Complete every in-flight request with `Closed` and drop the
	/// connection.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		fail_all(&self.dispatch);
		let mut writer = self.writer.lock().await;
		let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
	}

	async fn handshake(&self) -> Result<(), ClientError> {
		let body = HandshakeRequest {
			version: protocol::MAX_IPC_VERSION,
		};
		self.request(commands::HANDSHAKE, &body, false).await?;
		Ok(())
	}

	fn next_seq(&self) -> u64 {
		self.seq.fetch_add(1, Ordering::SeqCst) + 1
	}

	async fn request<T: serde::Serialize>(
		&self,
		command: &str,
		body: &T,
		expects_body: bool,
	) -> Result<Vec<u8>, ClientError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(ClientError::Closed);
		}

		let seq = self.next_seq();
		let (tx, rx) = oneshot::channel();
		self.dispatch
			.lock()
			.expect("dispatch poisoned")
			.insert(seq, Handler::Unary { expects_body, tx });

		// The reader may have torn down between the first check and the
		// insert; a handler registered after its sweep would never resolve.
		if self.closed.load(Ordering::SeqCst) {
			self.dispatch.lock().expect("dispatch poisoned").remove(&seq);
			return Err(ClientError::Closed);
		}

		if let Err(e) = self.send(seq, command, body).await {
			self.dispatch.lock().expect("dispatch poisoned").remove(&seq);
			return Err(e);
		}

		match rx.await {
			Ok(result) => result,
			Err(_) => Err(ClientError::Closed),
		}
	}

	async fn send<T: serde::Serialize>(
		&self,
		seq: u64,
		command: &str,
		body: &T,
	) -> Result<(), ClientError> {
		let header = RequestHeader {
			command: command.to_string(),
			seq,
		};
		let mut writer = self.writer.lock().await;
		codec::write_message(&mut *writer, &header).await?;
		codec::write_message(&mut *writer, body).await?;
		Ok(())
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		self.closed.store(true, Ordering::SeqCst);
		fail_all(&self.dispatch);
		self.reader.abort();
	}
}

fn fail_all(dispatch: &Dispatch) {
	let handlers: Vec<Handler> = {
		let mut map = dispatch.lock().expect("dispatch poisoned");
		map.drain().map(|(_, h)| h).collect()
	};
	for handler in handlers {
		match handler {
			Handler::Unary { tx, .. } => {
				let _ = tx.send(Err(ClientError::Closed));
			}
			Handler::Stream { init, .. } => {
				if let Some(init) = init {
					let _ = init.send(Err(ClientError::Closed));
				}
				// Dropping the stream sender ends the receiver.
			}
		}
	}
}

async fn reader_loop(mut reader: OwnedReadHalf, dispatch: Dispatch, closed: Arc<AtomicBool>) {
	loop {
		let header: ResponseHeader = match codec::read_message(&mut reader).await {
			Ok(Some(header)) => header,
			Ok(None) => break,
			Err(e) => {
				if !closed.load(Ordering::SeqCst) {
					tracing::debug!(error = %e, "failed to decode response header");
				}
				break;
			}
		};

		// Decide under the lock, read the body outside it.
		enum Next {
			Ignore,
			DeliverUnary(Result<Vec<u8>, ClientError>),
			ReadUnaryBody,
			StreamAck(Result<(), ClientError>),
			ReadStreamBody,
		}

		let next = {
			let mut map = dispatch.lock().expect("dispatch poisoned");
			match map.get_mut(&header.seq) {
				None => Next::Ignore,
				Some(Handler::Unary { expects_body, .. }) => {
					if !header.error.is_empty() {
						Next::DeliverUnary(Err(ClientError::Remote(header.error.clone())))
					} else if *expects_body {
						Next::ReadUnaryBody
					} else {
						Next::DeliverUnary(Ok(Vec::new()))
					}
				}
				Some(Handler::Stream { init, .. }) => {
					if let Some(init) = init.take() {
						let ack = if header.error.is_empty() {
							Ok(())
						} else {
							Err(ClientError::Remote(header.error.clone()))
						};
						let _ = init.send(ack);
						Next::StreamAck(if header.error.is_empty() {
							Ok(())
						} else {
							Err(ClientError::Closed)
						})
					} else if !header.error.is_empty() {
						Next::StreamAck(Err(ClientError::Remote(header.error.clone())))
					} else {
						Next::ReadStreamBody
					}
				}
			}
		};

		match next {
			Next::Ignore => {}
			Next::DeliverUnary(result) => {
				deliver_unary(&dispatch, header.seq, result);
			}
			Next::ReadUnaryBody => {
				let result = match codec::read_frame(&mut reader).await {
					Ok(Some(bytes)) => Ok(bytes),
					Ok(None) => break,
					Err(e) => {
						deliver_unary(&dispatch, header.seq, Err(e.into()));
						break;
					}
				};
				deliver_unary(&dispatch, header.seq, result);
			}
			Next::StreamAck(result) => {
				if result.is_err() {
					dispatch.lock().expect("dispatch poisoned").remove(&header.seq);
				}
			}
			Next::ReadStreamBody => {
				let record: LogBody = match codec::read_message(&mut reader).await {
					Ok(Some(record)) => record,
					Ok(None) => break,
					Err(e) => {
						tracing::debug!(error = %e, "failed to decode log record");
						break;
					}
				};
				let tx = {
					let map = dispatch.lock().expect("dispatch poisoned");
					match map.get(&header.seq) {
						Some(Handler::Stream { tx, .. }) => Some(tx.clone()),
						_ => None,
					}
				};
				if let Some(tx) = tx {
					if tx.send(record.log).await.is_err() {
						// Receiver gone; stop delivering this stream.
						dispatch.lock().expect("dispatch poisoned").remove(&header.seq);
					}
				}
			}
		}
	}

	closed.store(true, Ordering::SeqCst);
	fail_all(&dispatch);
}

fn deliver_unary(dispatch: &Dispatch, seq: u64, result: Result<Vec<u8>, ClientError>) {
	let handler = dispatch.lock().expect("dispatch poisoned").remove(&seq);
	if let Some(Handler::Unary { tx, .. }) = handler {
		let _ = tx.send(result);
	}
}
