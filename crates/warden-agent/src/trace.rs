//! Bridges the agent's own `tracing` events into the shared log buffer so
//! `monitor` sessions see daemon logs next to child output.

use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use warden_core::logbuf::{LogBuffer, LogRecord};
use warden_core::types::LogLevel;

pub struct BufferLayer {
	logbuf: Arc<LogBuffer>,
}

impl BufferLayer {
	pub fn new(logbuf: Arc<LogBuffer>) -> Self {
		Self { logbuf }
	}
}

impl<S: tracing::Subscriber> Layer<S> for BufferLayer {
	fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
		let mut visitor = MessageVisitor::default();
		event.record(&mut visitor);
		let level = map_level(*event.metadata().level());
		self.logbuf
			.append(LogRecord::new(level, "agent", visitor.finish()));
	}
}

#[derive(Default)]
struct MessageVisitor {
	message: String,
	fields: String,
}

impl Visit for MessageVisitor {
	fn record_str(&mut self, field: &Field, value: &str) {
		if field.name() == "message" {
			self.message = value.to_string();
		} else {
			self.push_field(field.name(), value);
		}
	}

	fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
		if field.name() == "message" {
			self.message = format!("{:?}", value);
		} else {
			self.push_field(field.name(), &format!("{:?}", value));
		}
	}
}

impl MessageVisitor {
	fn push_field(&mut self, name: &str, value: &str) {
		if !self.fields.is_empty() {
			self.fields.push(' ');
		}
		self.fields.push_str(name);
		self.fields.push('=');
		self.fields.push_str(value);
	}

	fn finish(self) -> String {
		match (self.message.is_empty(), self.fields.is_empty()) {
			(false, false) => format!("{} {}", self.message, self.fields),
			(false, true) => self.message,
			(true, false) => self.fields,
			(true, true) => String::new(),
		}
	}
}

fn map_level(level: tracing::Level) -> LogLevel {
	match level {
		tracing::Level::TRACE => LogLevel::Trace,
		tracing::Level::DEBUG => LogLevel::Debug,
		tracing::Level::INFO => LogLevel::Info,
		tracing::Level::WARN => LogLevel::Warn,
		tracing::Level::ERROR => LogLevel::Error,
	}
}

pub fn tracing_level(level: LogLevel) -> LevelFilter {
	match level {
		LogLevel::Trace => LevelFilter::TRACE,
		LogLevel::Debug => LevelFilter::DEBUG,
		LogLevel::Info => LevelFilter::INFO,
		LogLevel::Warn => LevelFilter::WARN,
		LogLevel::Error => LevelFilter::ERROR,
	}
}

/// Install the global subscriber: formatted stderr output plus the buffer
/// layer. A no-op when a subscriber is already set (tests).
pub fn init_logging(level: LogLevel, logbuf: Arc<LogBuffer>) {
	let _ = tracing_subscriber::registry()
		.with(tracing_level(level))
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.with(BufferLayer::new(logbuf))
		.try_init();
}
