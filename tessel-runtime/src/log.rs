//! Logging Infrastructure
//!
//! Effects log through the runtime's [`Logger`]. Every entry carries the
//! fiber that produced it together with fiber-scoped context:
//!
//! - **Minimum level**: [`CURRENT_LOG_LEVEL`], initialized from the runtime
//!   config and overridable per region with `with_minimum_log_level`
//! - **Annotations**: key/value pairs added with `annotate_logs`
//! - **Log spans**: labelled timers added with `with_log_span`
//! - **Trace span**: the innermost span opened with `with_span`
//!
//! Because all of these live in fiber refs, child fibers inherit them.
//!
//! The default logger forwards to `tracing`; install a subscriber such as
//! `tracing_subscriber::fmt` to see output.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessel_runtime::{log, Effect};
//!
//! let program: Effect<()> = log::log_info("request handled")
//!     .annotate_logs("path", "/users")
//!     .with_log_span("handler");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::effect::{Effect, Op};
use crate::fiber::FiberId;
use crate::fiber_ref::FiberRef;
use crate::observability::CURRENT_SPAN;
use crate::value::Data;

/// Log level enumeration, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
    /// Fatal level.
    Fatal,
    /// Off (no logging).
    Off,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level from a string, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Whether an entry at `self` passes a `minimum` filter.
    pub fn enabled_at(self, minimum: LogLevel) -> bool {
        self != LogLevel::Off && minimum != LogLevel::Off && self >= minimum
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A labelled timer attached to log entries.
#[derive(Debug, Clone)]
pub struct LogSpan {
    /// Span label.
    pub label: String,
    /// When the span was entered.
    pub start: Instant,
}

/// A log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Fiber that emitted the entry.
    pub fiber_id: FiberId,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Annotations in force.
    pub annotations: BTreeMap<String, String>,
    /// Log spans in force, outermost first.
    pub spans: Vec<LogSpan>,
    /// Trace and span id of the innermost trace span, if any.
    pub trace: Option<(u128, u64)>,
    /// Rendered failure cause, for entries describing a failure.
    pub cause: Option<String>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>, fiber_id: FiberId) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fiber_id,
            timestamp,
            annotations: BTreeMap::new(),
            spans: Vec::new(),
            trace: None,
            cause: None,
        }
    }

    /// Attach a rendered cause.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = String::new();

        // Timestamp
        let secs = self.timestamp / 1000;
        let millis = self.timestamp % 1000;
        output.push_str(&format!("[{}.{:03}] ", secs, millis));

        // Level and fiber
        output.push_str(&format!("{:<5} ({}) ", self.level.as_str(), self.fiber_id));

        // Message
        output.push_str(&self.message);

        let now = Instant::now();
        for span in &self.spans {
            let elapsed = now.saturating_duration_since(span.start);
            output.push_str(&format!(" {}={}ms", span.label, elapsed.as_millis()));
        }

        for (key, value) in &self.annotations {
            output.push_str(&format!(" {}={}", key, value));
        }

        if let Some(cause) = &self.cause {
            output.push_str(&format!(" cause={}", cause));
        }

        output
    }
}

/// Destination for effect log entries.
pub trait Logger: Send + Sync {
    /// Record one entry. Filtering by level has already happened.
    fn log(&self, entry: &LogEntry);
}

/// Logger that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, entry: &LogEntry) {
        let fiber = entry.fiber_id.to_string();
        let annotations = entry
            .annotations
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let spans = entry
            .spans
            .iter()
            .map(|s| s.label.as_str())
            .collect::<Vec<_>>()
            .join(">");
        let cause = entry.cause.as_deref().unwrap_or("");
        let message = &entry.message;
        match entry.level {
            LogLevel::Trace => {
                tracing::trace!(target: "tessel", fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "tessel", fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(target: "tessel", fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "tessel", fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(target: "tessel", fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Fatal => {
                tracing::error!(target: "tessel", fatal = true, fiber = %fiber, %annotations, %spans, %cause, "{}", message)
            }
            LogLevel::Off => {}
        }
    }
}

/// Logger that keeps entries in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Recorded messages, in order.
    pub fn messages(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Forget all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Logger for MemoryLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn log(&self, entry: &LogEntry) {
        (**self).log(entry)
    }
}

/// Minimum level for effect logs in the current fiber.
pub static CURRENT_LOG_LEVEL: LazyLock<FiberRef<LogLevel>> =
    LazyLock::new(|| FiberRef::new(LogLevel::Info));

/// Annotations attached to every log entry of the current fiber.
pub static CURRENT_LOG_ANNOTATIONS: LazyLock<FiberRef<BTreeMap<String, String>>> =
    LazyLock::new(|| FiberRef::new(BTreeMap::new()));

/// Log spans of the current fiber, outermost first.
pub static CURRENT_LOG_SPANS: LazyLock<FiberRef<Vec<LogSpan>>> =
    LazyLock::new(|| FiberRef::new(Vec::new()));

/// Log `message` at `level` from the current fiber.
pub fn log_at<E: Data>(level: LogLevel, message: impl Into<String>) -> Effect<(), E> {
    let message = message.into();
    Effect::from_op(Op::with_runtime(move |ctx| {
        let minimum = ctx.get_ref(&*CURRENT_LOG_LEVEL);
        if level.enabled_at(minimum) {
            let mut entry = LogEntry::new(level, message.clone(), ctx.id());
            entry.annotations = ctx.get_ref(&*CURRENT_LOG_ANNOTATIONS);
            entry.spans = ctx.get_ref(&*CURRENT_LOG_SPANS);
            entry.trace = ctx
                .get_ref(&*CURRENT_SPAN)
                .map(|span| (span.trace_id, span.span_id));
            ctx.logger().log(&entry);
        }
        Op::unit()
    }))
}

/// Log at info level.
pub fn log<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Info, message)
}

/// Log at trace level.
pub fn log_trace<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Trace, message)
}

/// Log at debug level.
pub fn log_debug<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Debug, message)
}

/// Log at info level.
pub fn log_info<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Info, message)
}

/// Log at warning level.
pub fn log_warning<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Warn, message)
}

/// Log at error level.
pub fn log_error<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Error, message)
}

/// Log at fatal level.
pub fn log_fatal<E: Data>(message: impl Into<String>) -> Effect<(), E> {
    log_at(LogLevel::Fatal, message)
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Attach `key=value` to every log entry emitted while this runs.
    pub fn annotate_logs(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        CURRENT_LOG_ANNOTATIONS.locally_with(
            move |mut annotations| {
                annotations.insert(key.clone(), value.clone());
                annotations
            },
            self,
        )
    }

    /// Time this effect under `label` in log entries it emits.
    pub fn with_log_span(self, label: impl Into<String>) -> Self {
        let label = label.into();
        CURRENT_LOG_SPANS.locally_with(
            move |mut spans| {
                spans.push(LogSpan {
                    label: label.clone(),
                    start: Instant::now(),
                });
                spans
            },
            self,
        )
    }

    /// Override the minimum log level while this runs.
    pub fn with_minimum_log_level(self, level: LogLevel) -> Self {
        CURRENT_LOG_LEVEL.locally(level, self)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    fn rt_with(logger: Arc<MemoryLogger>) -> Runtime {
        Runtime::builder()
            .num_workers(1)
            .logger(logger)
            .build()
            .unwrap()
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert!(LogLevel::Fatal < LogLevel::Off);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" Fatal "), Some(LogLevel::Fatal));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_enabled_at() {
        assert!(LogLevel::Warn.enabled_at(LogLevel::Info));
        assert!(!LogLevel::Debug.enabled_at(LogLevel::Info));
        assert!(!LogLevel::Fatal.enabled_at(LogLevel::Off));
        assert!(!LogLevel::Off.enabled_at(LogLevel::Trace));
    }

    #[test]
    fn test_format_plain() {
        let mut entry = LogEntry::new(LogLevel::Info, "hello", FiberId::runtime(7, 0));
        entry.annotations.insert("user".into(), "ada".into());
        let line = entry.format_plain();
        assert!(line.contains("INFO"));
        assert!(line.contains("(#7)"));
        assert!(line.ends_with("hello user=ada"));
    }

    #[test]
    fn test_effect_log_respects_minimum_level() {
        let logger = Arc::new(MemoryLogger::new());
        let rt = rt_with(logger.clone());
        let eff: Effect<()> = log_debug("hidden").zip_right(log_warning("shown"));
        rt.run_sync(eff).unwrap();
        assert_eq!(logger.messages(), vec!["shown".to_string()]);
    }

    #[test]
    fn test_with_minimum_log_level() {
        let logger = Arc::new(MemoryLogger::new());
        let rt = rt_with(logger.clone());
        let eff: Effect<()> = log_debug("visible").with_minimum_log_level(LogLevel::Debug);
        rt.run_sync(eff).unwrap();
        assert_eq!(logger.messages(), vec!["visible".to_string()]);
    }

    #[test]
    fn test_annotations_and_spans() {
        let logger = Arc::new(MemoryLogger::new());
        let rt = rt_with(logger.clone());
        let eff: Effect<()> = log("inside")
            .annotate_logs("request", "42")
            .with_log_span("handler")
            .zip_right(log("outside"));
        rt.run_sync(eff).unwrap();

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].annotations.get("request").map(String::as_str), Some("42"));
        assert_eq!(entries[0].spans[0].label, "handler");
        assert!(entries[1].annotations.is_empty());
        assert!(entries[1].spans.is_empty());
    }

    #[test]
    fn test_children_inherit_annotations() {
        let logger = Arc::new(MemoryLogger::new());
        let rt = rt_with(logger.clone());
        let child: Effect<()> = log("from child");
        let eff: Effect<()> = child
            .fork()
            .flat_map(|fiber| fiber.join())
            .annotate_logs("job", "sync");
        rt.run_sync(eff).unwrap();
        let entries = logger.entries();
        assert_eq!(entries[0].annotations.get("job").map(String::as_str), Some("sync"));
    }
}
