use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use warden_agent::agent::{Agent, AgentConfig};
use warden_agent::client::{ClientError, RpcClient};
use warden_agent::codec;
use warden_agent::ipc::AgentIpc;
use warden_core::logbuf::LogRecord;
use warden_core::protocol::{
	HandshakeRequest, NamesBody, RegisterRequest, RequestHeader, ResponseHeader, errors,
};
use warden_core::types::{LogLevel, ProcessState};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("warden-ipc-{}-{}", n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

async fn start_agent() -> (Arc<Agent>, AgentIpc, String) {
	let agent = Agent::new(AgentConfig::default());
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap().to_string();
	let ipc = AgentIpc::start(listener, Arc::clone(&agent));
	(agent, ipc, addr)
}

fn sleeper_config(dir: &std::path::Path, name: &str) -> String {
	let path = dir.join(format!("{}.json", name));
	std::fs::write(
		&path,
		format!(
			r#"{{"name": "{}", "program": "sh", "arguments": ["-c", "sleep 30"], "run_at_load": false, "keep_alive": false, "kill_timeout": 2}}"#,
			name
		),
	)
	.unwrap();
	path.to_string_lossy().to_string()
}

// --- Raw-socket protocol behavior ---

async fn send_request<T: serde::Serialize>(
	stream: &mut TcpStream,
	seq: u64,
	command: &str,
	body: &T,
) {
	let header = RequestHeader {
		command: command.to_string(),
		seq,
	};
	codec::write_message(stream, &header).await.unwrap();
	codec::write_message(stream, body).await.unwrap();
}

async fn read_header(stream: &mut TcpStream) -> ResponseHeader {
	codec::read_message(stream)
		.await
		.unwrap()
		.expect("connection closed")
}

#[tokio::test]
async fn handshake_gates_commands_and_session_recovers() {
	let (_agent, _ipc, addr) = start_agent().await;
	let mut stream = TcpStream::connect(&addr).await.unwrap();

	// Any command before the handshake is rejected but the session survives.
	send_request(&mut stream, 1, "register", &RegisterRequest {
		config_paths: vec![],
		start_on_load: true,
		watch_paths: false,
	})
	.await;
	let resp = read_header(&mut stream).await;
	assert_eq!(resp.seq, 1);
	assert_eq!(resp.error, errors::HANDSHAKE_REQUIRED);

	send_request(&mut stream, 2, "handshake", &HandshakeRequest { version: 1 }).await;
	let resp = read_header(&mut stream).await;
	assert_eq!(resp.seq, 2);
	assert_eq!(resp.error, "");

	send_request(&mut stream, 3, "register", &RegisterRequest {
		config_paths: vec![],
		start_on_load: true,
		watch_paths: false,
	})
	.await;
	let resp = read_header(&mut stream).await;
	assert_eq!(resp.error, "");
	let names: NamesBody = codec::read_message(&mut stream).await.unwrap().unwrap();
	assert!(names.names.is_empty());
}

#[tokio::test]
async fn unsupported_version_leaves_session_usable() {
	let (_agent, _ipc, addr) = start_agent().await;
	let mut stream = TcpStream::connect(&addr).await.unwrap();

	for bad in [0, 2] {
		send_request(&mut stream, bad as u64 + 10, "handshake", &HandshakeRequest {
			version: bad,
		})
		.await;
		let resp = read_header(&mut stream).await;
		assert_eq!(resp.error, errors::UNSUPPORTED_IPC_VERSION);
	}

	send_request(&mut stream, 20, "handshake", &HandshakeRequest { version: 1 }).await;
	assert_eq!(read_header(&mut stream).await.error, "");
}

#[tokio::test]
async fn second_handshake_rejected() {
	let (_agent, _ipc, addr) = start_agent().await;
	let mut stream = TcpStream::connect(&addr).await.unwrap();

	send_request(&mut stream, 1, "handshake", &HandshakeRequest { version: 1 }).await;
	assert_eq!(read_header(&mut stream).await.error, "");

	send_request(&mut stream, 2, "handshake", &HandshakeRequest { version: 1 }).await;
	assert_eq!(
		read_header(&mut stream).await.error,
		errors::DUPLICATE_HANDSHAKE
	);
}

#[tokio::test]
async fn unknown_command_errors_and_closes() {
	let (_agent, _ipc, addr) = start_agent().await;
	let mut stream = TcpStream::connect(&addr).await.unwrap();

	send_request(&mut stream, 1, "handshake", &HandshakeRequest { version: 1 }).await;
	assert_eq!(read_header(&mut stream).await.error, "");

	let header = RequestHeader {
		command: "bogus".to_string(),
		seq: 2,
	};
	codec::write_message(&mut stream, &header).await.unwrap();

	let resp = read_header(&mut stream).await;
	assert_eq!(resp.seq, 2);
	assert_eq!(resp.error, errors::UNSUPPORTED_COMMAND);

	// The server cannot resync past an unknown body, so the session ends.
	let next: Option<ResponseHeader> = codec::read_message(&mut stream).await.unwrap();
	assert!(next.is_none());
}

// --- Client end-to-end ---

#[tokio::test]
async fn register_start_stop_deregister_flow() {
	let (agent, _ipc, addr) = start_agent().await;
	let dir = temp_dir("flow");
	let config = sleeper_config(&dir, "my_app");

	let client = RpcClient::connect(&addr).await.unwrap();

	let names = client.register(vec![config], false, true).await.unwrap();
	assert_eq!(names, vec!["my_app"]);
	let proc = agent.registry().find_by_name("my_app").unwrap();
	assert_eq!(proc.state(), ProcessState::Stopped);

	let pids = client.start(vec!["my_app".to_string()]).await.unwrap();
	assert_eq!(pids.len(), 1);
	assert!(pids[0] > 0);
	assert_eq!(proc.state(), ProcessState::Running);

	let stopped = client.stop(vec!["my_app".to_string()]).await.unwrap();
	assert_eq!(stopped, vec!["my_app"]);

	let removed = client.deregister(vec!["my_app".to_string()]).await.unwrap();
	assert_eq!(removed, vec!["my_app"]);
	assert!(agent.registry().find_by_name("my_app").is_none());

	client.close().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn register_with_start_on_load_starts_processes() {
	let (agent, _ipc, addr) = start_agent().await;
	let dir = temp_dir("autostart");
	let path = dir.join("auto.json");
	std::fs::write(
		&path,
		r#"{"name": "auto", "program": "sh", "arguments": ["-c", "sleep 30"], "keep_alive": false, "kill_timeout": 2}"#,
	)
	.unwrap();

	let client = RpcClient::connect(&addr).await.unwrap();
	let names = client
		.register(vec![path.to_string_lossy().to_string()], false, true)
		.await
		.unwrap();
	assert_eq!(names, vec!["auto"]);

	let proc = agent.registry().find_by_name("auto").unwrap();
	assert_eq!(proc.state(), ProcessState::Running);

	agent.registry().shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn batch_operations_skip_unknown_names() {
	let (agent, _ipc, addr) = start_agent().await;
	let dir = temp_dir("batch");
	let config = sleeper_config(&dir, "known");

	let client = RpcClient::connect(&addr).await.unwrap();
	client.register(vec![config], false, false).await.unwrap();

	let pids = client
		.start(vec!["ghost".to_string(), "known".to_string()])
		.await
		.unwrap();
	assert_eq!(pids.len(), 1);

	let stopped = client
		.stop(vec!["ghost".to_string(), "known".to_string()])
		.await
		.unwrap();
	assert_eq!(stopped, vec!["known"]);

	agent.registry().shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn restart_returns_fresh_pids() {
	let (agent, _ipc, addr) = start_agent().await;
	let dir = temp_dir("restart");
	let path = dir.join("app.json");
	std::fs::write(
		&path,
		r#"{"name": "app", "program": "sh", "arguments": ["-c", "sleep 30"], "keep_alive": false, "kill_timeout": 2, "throttle_interval": 1}"#,
	)
	.unwrap();

	let client = RpcClient::connect(&addr).await.unwrap();
	client
		.register(vec![path.to_string_lossy().to_string()], false, false)
		.await
		.unwrap();

	let first = client.start(vec!["app".to_string()]).await.unwrap()[0];
	let fresh = client.restart(vec!["app".to_string()]).await.unwrap();
	assert_eq!(fresh.len(), 1);
	assert_ne!(fresh[0], first);

	agent.registry().shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn monitor_streams_buffered_and_live_records() {
	let (agent, _ipc, addr) = start_agent().await;
	agent
		.log_buffer()
		.append(LogRecord::new(LogLevel::Info, "web", "from the backlog"));

	let client = RpcClient::connect(&addr).await.unwrap();
	let mut logs = client.monitor("info").await.unwrap();

	let first = tokio::time::timeout(Duration::from_secs(5), logs.recv())
		.await
		.expect("no backlog record")
		.unwrap();
	assert!(first.contains("from the backlog"), "got: {}", first);

	agent
		.log_buffer()
		.append(LogRecord::new(LogLevel::Warn, "web", "something live"));
	let live = tokio::time::timeout(Duration::from_secs(5), logs.recv())
		.await
		.expect("no live record")
		.unwrap();
	assert!(live.contains("something live"), "got: {}", live);
	assert!(live.contains("[WARN]"), "got: {}", live);

	client.close().await;
}

#[tokio::test]
async fn monitor_filters_below_min_level() {
	let (agent, _ipc, addr) = start_agent().await;

	let client = RpcClient::connect(&addr).await.unwrap();
	let mut logs = client.monitor("warn").await.unwrap();

	agent
		.log_buffer()
		.append(LogRecord::new(LogLevel::Debug, "web", "too quiet"));
	agent
		.log_buffer()
		.append(LogRecord::new(LogLevel::Error, "web", "loud enough"));

	let line = tokio::time::timeout(Duration::from_secs(5), logs.recv())
		.await
		.expect("no record")
		.unwrap();
	assert!(line.contains("loud enough"), "got: {}", line);

	client.close().await;
}

#[tokio::test]
async fn second_monitor_rejected() {
	let (_agent, _ipc, addr) = start_agent().await;
	let client = RpcClient::connect(&addr).await.unwrap();

	let _logs = client.monitor("info").await.unwrap();
	match client.monitor("info").await {
		Err(ClientError::Remote(message)) => assert_eq!(message, errors::MONITOR_EXISTS),
		other => panic!("expected monitor rejection, got {:?}", other.map(|_| ())),
	}

	client.close().await;
}

#[tokio::test]
async fn invalid_monitor_level_rejected() {
	let (_agent, _ipc, addr) = start_agent().await;
	let client = RpcClient::connect(&addr).await.unwrap();

	match client.monitor("loudest").await {
		Err(ClientError::Remote(message)) => assert_eq!(message, errors::INVALID_LOG_LEVEL),
		other => panic!("expected level rejection, got {:?}", other.map(|_| ())),
	}

	client.close().await;
}

#[tokio::test]
async fn concurrent_requests_multiplex_by_seq() {
	let (agent, _ipc, addr) = start_agent().await;
	let dir = temp_dir("multiplex");
	let config = sleeper_config(&dir, "muxed");

	let client = Arc::new(RpcClient::connect(&addr).await.unwrap());
	client.register(vec![config], false, false).await.unwrap();

	let (starts, stops, removals) = tokio::join!(
		client.start(vec!["muxed".to_string()]),
		client.stop(vec!["absent".to_string()]),
		client.deregister(vec!["also-absent".to_string()]),
	);
	assert_eq!(starts.unwrap().len(), 1);
	assert!(stops.unwrap().is_empty());
	assert!(removals.unwrap().is_empty());

	agent.registry().shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn close_completes_monitor_stream() {
	let (_agent, _ipc, addr) = start_agent().await;
	let client = RpcClient::connect(&addr).await.unwrap();

	let mut logs = client.monitor("info").await.unwrap();
	client.close().await;

	let next = tokio::time::timeout(Duration::from_secs(5), logs.recv())
		.await
		.expect("stream did not end");
	assert!(next.is_none());

	match client.start(vec!["x".to_string()]).await {
		Err(ClientError::Closed) => {}
		other => panic!("expected Closed, got {:?}", other.map(|_| ())),
	}
}

#[tokio::test]
async fn server_shutdown_closes_sessions() {
	let (_agent, ipc, addr) = start_agent().await;
	let client = RpcClient::connect(&addr).await.unwrap();

	ipc.shutdown().await;

	// The next request observes the closed connection rather than hanging.
	let result = tokio::time::timeout(
		Duration::from_secs(5),
		client.start(vec!["x".to_string()]),
	)
	.await
	.expect("request hung after server shutdown");
	assert!(result.is_err());
}
