//! Agent-wide logging setup. Extends `util::setup_logger`'s single
//! `FmtSubscriber` writing to stderr with a second layer that mirrors every
//! record into a broadcast channel, which is how the RPC `monitor` command
//! (§4.G) gets its stream without every connection installing its own
//! global subscriber.
use cluster_util::formats::{LogRecord, LogSeverity};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn severity_rank(s: &LogSeverity) -> u8 {
    match s {
        LogSeverity::Trace => 0,
        LogSeverity::Debug => 1,
        LogSeverity::Info => 2,
        LogSeverity::Warn => 3,
        LogSeverity::Error => 4,
        LogSeverity::RustLog(_) => 2,
    }
}

/// Parses the `LogLevel` body field of a `monitor` request the same way
/// `LogSeverity::from(&str)` treats any unrecognized string as a raw
/// `RUST_LOG`-style directive (accepted but never matched against, since
/// this layer only compares coarse severities).
pub fn parse_level(s: &str) -> LogSeverity {
    LogSeverity::from(s)
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

fn level_to_severity(level: &Level) -> LogSeverity {
    LogSeverity::from(level)
}

/// A `tracing_subscriber::Layer` that turns every event at or above its
/// minimum level into a [`LogRecord`] and broadcasts it. Lagging
/// subscribers miss records rather than slow down the rest of the process,
/// the same tradeoff the event bus (§4.F) makes for backpressure.
pub struct MonitorLayer {
    tx: broadcast::Sender<LogRecord>,
}

impl MonitorLayer {
    pub fn new(capacity: usize) -> (Self, broadcast::Sender<LogRecord>) {
        let (tx, _rx) = broadcast::channel(capacity);
        (Self { tx: tx.clone() }, tx)
    }
}

impl<S: Subscriber> Layer<S> for MonitorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let mut visitor = MessageVisitor { message: String::new() };
        event.record(&mut visitor);
        let record = LogRecord {
            severity: level_to_severity(event.metadata().level()),
            message: visitor.message,
            target: event.metadata().target().to_string(),
            timestamp_micros: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0),
        };
        let _ = self.tx.send(record);
    }
}

/// A monitor subscription's filter: only forward records whose severity is
/// at or above the requested level.
pub fn admits(requested: &LogSeverity, actual: &LogSeverity) -> bool {
    severity_rank(actual) >= severity_rank(requested)
}

/// Installs the process-wide subscriber: a stderr formatter, same as
/// `util::setup_logger`, layered with [`MonitorLayer`]. Returns the
/// broadcast sender the RPC server hands out to `monitor` subscribers.
/// Safe to call at most once per process; subsequent calls are no-ops.
pub fn init(monitor_capacity: usize) -> broadcast::Sender<LogRecord> {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let (monitor_layer, tx) = MonitorLayer::new(monitor_capacity);
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::new(env))
        .with(fmt_layer)
        .with(monitor_layer);
    let _ = registry.try_init();
    log_panics::init();
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_admission_is_monotonic() {
        assert!(admits(&LogSeverity::Info, &LogSeverity::Warn));
        assert!(!admits(&LogSeverity::Warn, &LogSeverity::Info));
        assert!(admits(&LogSeverity::Trace, &LogSeverity::Trace));
    }
}
