use crate::types::LogLevel;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Default number of records the ring retains.
pub const DEFAULT_CAPACITY: usize = 512;

/// Records buffered per subscriber before it is dropped as lagged.
const SUBSCRIBER_BUFFER: usize = 256;

/// One line of log output, from a supervised child or from the agent itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
	pub timestamp: SystemTime,
	pub level: LogLevel,
	pub source: String,
	pub line: String,
}

impl LogRecord {
	pub fn new(level: LogLevel, source: impl Into<String>, line: impl Into<String>) -> Self {
		Self {
			timestamp: SystemTime::now(),
			level,
			source: source.into(),
			line: line.into(),
		}
	}
}

/// Bounded in-memory ring of recent log records with a subscribe contract.
///
/// `append` never blocks: the oldest record is discarded on overflow, and a
/// subscriber whose private buffer is full is dropped with [`RecvError::Lagged`]
/// rather than stalling producers.
pub struct LogBuffer {
	inner: Mutex<Inner>,
}

struct Inner {
	records: VecDeque<LogRecord>,
	capacity: usize,
	subscribers: Vec<Subscriber>,
	next_id: u64,
}

struct Subscriber {
	id: u64,
	min_level: LogLevel,
	tx: mpsc::Sender<LogRecord>,
	lagged: Arc<AtomicBool>,
}

/// Single-consumer stream of records at or above the subscribed level.
pub struct LogSubscription {
	id: u64,
	rx: mpsc::Receiver<LogRecord>,
	lagged: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
	/// The subscriber fell behind and was dropped by the buffer.
	#[error("subscription lagged behind")]
	Lagged,
	/// The subscription was removed or the buffer went away.
	#[error("subscription closed")]
	Closed,
}

impl LogBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				records: VecDeque::with_capacity(capacity),
				capacity,
				subscribers: Vec::new(),
				next_id: 0,
			}),
		}
	}

	pub fn append(&self, record: LogRecord) {
		let mut inner = self.inner.lock().expect("log buffer poisoned");
		if inner.records.len() >= inner.capacity {
			inner.records.pop_front();
		}
		inner.records.push_back(record.clone());

		inner.subscribers.retain(|sub| {
			if record.level < sub.min_level {
				return true;
			}
			match sub.tx.try_send(record.clone()) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					sub.lagged.store(true, Ordering::SeqCst);
					false
				}
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			}
		});
	}

	/// Copy of the current contents, oldest first.
	pub fn snapshot(&self) -> Vec<LogRecord> {
		let inner = self.inner.lock().expect("log buffer poisoned");
		inner.records.iter().cloned().collect()
	}

	pub fn subscribe(&self, min_level: LogLevel) -> LogSubscription {
		let mut inner = self.inner.lock().expect("log buffer poisoned");
		inner.register(min_level)
	}

	/// Subscribe and take a level-filtered snapshot in one step, so no record
	/// appended in between is missed or delivered twice.
	pub fn subscribe_with_snapshot(&self, min_level: LogLevel) -> (Vec<LogRecord>, LogSubscription) {
		let mut inner = self.inner.lock().expect("log buffer poisoned");
		let snapshot = inner
			.records
			.iter()
			.filter(|r| r.level >= min_level)
			.cloned()
			.collect();
		let sub = inner.register(min_level);
		(snapshot, sub)
	}

	pub fn unsubscribe(&self, sub: &LogSubscription) {
		let mut inner = self.inner.lock().expect("log buffer poisoned");
		inner.subscribers.retain(|s| s.id != sub.id);
	}
}

impl Inner {
	fn register(&mut self, min_level: LogLevel) -> LogSubscription {
		let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
		let lagged = Arc::new(AtomicBool::new(false));
		self.next_id += 1;
		let id = self.next_id;
		self.subscribers.push(Subscriber {
			id,
			min_level,
			tx,
			lagged: Arc::clone(&lagged),
		});
		LogSubscription { id, rx, lagged }
	}
}

impl LogSubscription {
	/// Next record at or above the subscribed level. After the buffer drops
	/// this subscription for lagging, buffered records are still delivered,
	/// then `Err(Lagged)`.
	pub async fn recv(&mut self) -> Result<LogRecord, RecvError> {
		match self.rx.recv().await {
			Some(record) => Ok(record),
			None => {
				if self.lagged.load(Ordering::SeqCst) {
					Err(RecvError::Lagged)
				} else {
					Err(RecvError::Closed)
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(level: LogLevel, line: &str) -> LogRecord {
		LogRecord::new(level, "test", line)
	}

	#[test]
	fn overflow_drops_oldest() {
		let buf = LogBuffer::new(3);
		for i in 0..5 {
			buf.append(record(LogLevel::Info, &format!("line {}", i)));
		}
		let snap = buf.snapshot();
		assert_eq!(snap.len(), 3);
		assert_eq!(snap[0].line, "line 2");
		assert_eq!(snap[2].line, "line 4");
	}

	#[tokio::test]
	async fn subscribe_filters_by_level() {
		let buf = LogBuffer::new(16);
		let mut sub = buf.subscribe(LogLevel::Warn);

		buf.append(record(LogLevel::Debug, "quiet"));
		buf.append(record(LogLevel::Error, "loud"));

		let got = sub.recv().await.unwrap();
		assert_eq!(got.line, "loud");
	}

	#[tokio::test]
	async fn snapshot_and_subscribe_are_contiguous() {
		let buf = LogBuffer::new(16);
		buf.append(record(LogLevel::Info, "before"));

		let (snap, mut sub) = buf.subscribe_with_snapshot(LogLevel::Info);
		buf.append(record(LogLevel::Info, "after"));

		assert_eq!(snap.len(), 1);
		assert_eq!(snap[0].line, "before");
		assert_eq!(sub.recv().await.unwrap().line, "after");
	}

	#[tokio::test]
	async fn slow_subscriber_is_dropped_as_lagged() {
		let buf = LogBuffer::new(1024);
		let mut sub = buf.subscribe(LogLevel::Trace);

		for i in 0..(SUBSCRIBER_BUFFER + 10) {
			buf.append(record(LogLevel::Info, &format!("line {}", i)));
		}

		// Buffered records drain first, then the lag is reported.
		let mut seen = 0;
		loop {
			match sub.recv().await {
				Ok(_) => seen += 1,
				Err(RecvError::Lagged) => break,
				Err(RecvError::Closed) => panic!("expected Lagged, got Closed"),
			}
		}
		assert_eq!(seen, SUBSCRIBER_BUFFER);
	}

	#[tokio::test]
	async fn unsubscribe_closes_subscription() {
		let buf = LogBuffer::new(16);
		let mut sub = buf.subscribe(LogLevel::Trace);
		buf.unsubscribe(&sub);
		buf.append(record(LogLevel::Info, "unseen"));
		assert_eq!(sub.recv().await, Err(RecvError::Closed));
	}
}
