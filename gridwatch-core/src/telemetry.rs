//! Tracing setup and log forwarding.
//!
//! Every binary logs through `tracing` to stderr, filtered by `RUST_LOG`
//! (default `info`). Monitors additionally install a [`ForwardLayer`] that
//! copies their own records into a bounded queue; the runtime loop drains it
//! onto the log channel once the C2 has confirmed the registration.

use crate::queue::BoundedQueue;
use crate::state::{new_state, Shared};
use std::fmt::{self, Write as _};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

pub const LOG_QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub severity: String,
    pub message: String,
    pub time: String,
}

pub type LogQueue = Shared<BoundedQueue<LogRecord>>;

pub fn new_log_queue() -> LogQueue {
    new_state(BoundedQueue::new(LOG_QUEUE_CAPACITY))
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Copies `gridwatch*` events into a [`LogQueue`].
pub struct ForwardLayer {
    queue: LogQueue,
}

impl ForwardLayer {
    pub fn new(queue: LogQueue) -> Self {
        Self { queue }
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
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn severity(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with("gridwatch") {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.queue.lock().push(LogRecord {
            severity: severity(meta.level()).to_string(),
            message: format!("{}{}", visitor.message, visitor.fields),
            time: now_rfc3339(),
        });
    }
}

/// Installs the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(forward: Option<LogQueue>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let forward = forward.map(|queue| ForwardLayer::new(queue).with_filter(LevelFilter::INFO));
    let _ = tracing_subscriber::registry()
        .with(fmt_layer::layer().with_filter(env_filter))
        .with(forward)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_only_gridwatch_targets() {
        let queue = new_log_queue();
        let subscriber = tracing_subscriber::registry().with(ForwardLayer::new(queue.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "gridwatch_monitor::local", cycle = 3, "poll failed");
            tracing::info!(target: "rumqttc::state", "noise");
        });
        let records = queue.lock().drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, "WARNING");
        assert_eq!(records[0].message, "poll failed cycle=3");
    }
}
