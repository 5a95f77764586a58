//! # Observability
//!
//! Tracing spans, fiber supervision hooks, and runtime statistics.
//!
//! ## Design
//!
//! - **Spans**: `with_span` opens a span around an effect, parents it to the
//!   innermost open span of the fiber, and reports its outcome to the
//!   runtime's [`Tracer`] when the effect exits, however it exits
//! - **Supervisors**: observe every fiber start and end
//! - **Stats**: counters the runtime maintains as fibers come and go
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::Effect;
//!
//! let program: Effect<i32> = Effect::succeed(1)
//!     .with_span("load-user")
//!     .with_span("request");
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Effect, Op};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::fiber_ref::FiberRef;
use crate::scheduler::SchedulerStats;
use crate::scope::acquire_use_release;
use crate::value::{Data, Value};

// ============================================================================
// TRACING
// ============================================================================

/// Outcome of a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    /// The effect succeeded.
    Ok,
    /// The effect failed or died; the rendered cause.
    Error(String),
    /// The effect was interrupted.
    Interrupted,
}

impl SpanStatus {
    fn from_exit(exit: &Exit<(), ()>) -> Self {
        match exit {
            Exit::Success(()) => SpanStatus::Ok,
            Exit::Failure(cause) if cause.is_interrupted_only() => SpanStatus::Interrupted,
            Exit::Failure(cause) => SpanStatus::Error(cause.pretty()),
        }
    }
}

/// An open span.
#[derive(Debug, Clone)]
pub struct SpanData {
    /// Trace the span belongs to.
    pub trace_id: u128,
    /// Span ID.
    pub span_id: u64,
    /// Enclosing span, if any.
    pub parent_span_id: Option<u64>,
    /// Span name.
    pub name: String,
    /// Span attributes.
    pub attributes: BTreeMap<String, String>,
    /// Start time.
    pub start: Instant,
    /// Fiber that opened the span.
    pub fiber_id: FiberId,
}

/// A span that has ended.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    /// The span as it was opened.
    pub data: SpanData,
    /// How the traced effect exited.
    pub status: SpanStatus,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Receiver of span lifecycle events.
pub trait Tracer: Send + Sync {
    /// A span was opened.
    fn on_start(&self, span: &SpanData);

    /// A span ended.
    fn on_end(&self, span: FinishedSpan);
}

/// Tracer that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn on_start(&self, span: &SpanData) {
        tracing::trace!(
            target: "tessel::span",
            trace_id = %format!("{:032x}", span.trace_id),
            span_id = span.span_id,
            fiber = %span.fiber_id,
            "span {} started",
            span.name
        );
    }

    fn on_end(&self, span: FinishedSpan) {
        tracing::debug!(
            target: "tessel::span",
            trace_id = %format!("{:032x}", span.data.trace_id),
            span_id = span.data.span_id,
            duration_us = span.duration.as_micros() as u64,
            status = ?span.status,
            "span {} ended",
            span.data.name
        );
    }
}

/// Tracer that keeps finished spans in memory. Useful in tests.
#[derive(Debug, Default)]
pub struct MemoryTracer {
    started: AtomicU64,
    finished: Mutex<Vec<FinishedSpan>>,
}

impl MemoryTracer {
    /// Create an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spans that have ended, in completion order.
    pub fn finished(&self) -> Vec<FinishedSpan> {
        self.finished.lock().clone()
    }

    /// Number of spans opened.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

impl Tracer for MemoryTracer {
    fn on_start(&self, _span: &SpanData) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_end(&self, span: FinishedSpan) {
        self.finished.lock().push(span);
    }
}

impl<T: Tracer + ?Sized> Tracer for Arc<T> {
    fn on_start(&self, span: &SpanData) {
        (**self).on_start(span)
    }

    fn on_end(&self, span: FinishedSpan) {
        (**self).on_end(span)
    }
}

/// Innermost open span of the current fiber.
pub static CURRENT_SPAN: LazyLock<FiberRef<Option<SpanData>>> =
    LazyLock::new(|| FiberRef::new(None));

static SPAN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn new_trace_id() -> u128 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SPAN_ID_COUNTER.load(Ordering::Relaxed) as u128;
    nanos ^ (seq << 64)
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Trace this effect as a span named `name`.
    pub fn with_span(self, name: impl Into<String>) -> Self {
        self.with_span_attrs(name, BTreeMap::new())
    }

    /// Trace this effect as a span with attributes.
    pub fn with_span_attrs(self, name: impl Into<String>, attributes: BTreeMap<String, String>) -> Self {
        let name = name.into();
        let open: Effect<SpanData, E> = Effect::from_op(Op::with_runtime(move |ctx| {
            let parent = ctx.get_ref(&*CURRENT_SPAN);
            let span = SpanData {
                trace_id: parent.as_ref().map_or_else(new_trace_id, |p| p.trace_id),
                span_id: SPAN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                parent_span_id: parent.as_ref().map(|p| p.span_id),
                name: name.clone(),
                attributes: attributes.clone(),
                start: Instant::now(),
                fiber_id: ctx.id(),
            };
            ctx.tracer().on_start(&span);
            Op::Succeed(Value::new(span))
        }));
        let body = self;
        acquire_use_release(
            open,
            move |span: SpanData| CURRENT_SPAN.locally(Some(span), body.clone()),
            |span: SpanData, exit: Exit<(), ()>| {
                Effect::from_op(Op::with_runtime(move |ctx| {
                    let finished = FinishedSpan {
                        duration: span.start.elapsed(),
                        status: SpanStatus::from_exit(&exit),
                        data: span.clone(),
                    };
                    ctx.tracer().on_end(finished);
                    Op::unit()
                }))
            },
        )
    }
}

// ============================================================================
// SUPERVISION
// ============================================================================

/// Observer of fiber lifecycles.
///
/// Callbacks run on the thread that starts or finishes the fiber and must
/// not block.
pub trait Supervisor: Send + Sync {
    /// A fiber was forked. `parent` is `FiberId::None` for roots.
    fn on_start(&self, fiber: &FiberId, parent: &FiberId) {
        let _ = (fiber, parent);
    }

    /// A fiber finished.
    fn on_end(&self, fiber: &FiberId, exit: &Exit<(), ()>) {
        let _ = (fiber, exit);
    }
}

/// Supervisor that records every event. Useful in tests.
#[derive(Debug, Default)]
pub struct RecordingSupervisor {
    started: Mutex<Vec<(FiberId, FiberId)>>,
    ended: Mutex<Vec<(FiberId, Exit<(), ()>)>>,
}

impl RecordingSupervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(fiber, parent)` for every start.
    pub fn started(&self) -> Vec<(FiberId, FiberId)> {
        self.started.lock().clone()
    }

    /// `(fiber, exit)` for every end.
    pub fn ended(&self) -> Vec<(FiberId, Exit<(), ()>)> {
        self.ended.lock().clone()
    }
}

impl Supervisor for RecordingSupervisor {
    fn on_start(&self, fiber: &FiberId, parent: &FiberId) {
        self.started.lock().push((fiber.clone(), parent.clone()));
    }

    fn on_end(&self, fiber: &FiberId, exit: &Exit<(), ()>) {
        self.ended.lock().push((fiber.clone(), exit.clone()));
    }
}

impl<S: Supervisor + ?Sized> Supervisor for Arc<S> {
    fn on_start(&self, fiber: &FiberId, parent: &FiberId) {
        (**self).on_start(fiber, parent)
    }

    fn on_end(&self, fiber: &FiberId, exit: &Exit<(), ()>) {
        (**self).on_end(fiber, exit)
    }
}

// ============================================================================
// INTROSPECTION
// ============================================================================

/// Runtime statistics.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    /// Fibers started since the runtime was created.
    pub fibers_started: u64,
    /// Fibers that succeeded.
    pub fibers_succeeded: u64,
    /// Fibers that failed with a typed error or a defect.
    pub fibers_failed: u64,
    /// Fibers that ended interrupted.
    pub fibers_interrupted: u64,
    /// Defects seen in fiber exits.
    pub defects: u64,
    /// Root and daemon fibers currently alive.
    pub live_roots: usize,
    /// Sleeps and other timer callbacks not yet fired.
    pub pending_timers: usize,
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Time since the runtime was created.
    pub uptime: Duration,
}

impl RuntimeStats {
    /// Fibers that have not finished yet.
    pub fn live_fibers(&self) -> u64 {
        self.fibers_started
            .saturating_sub(self.fibers_succeeded + self.fibers_failed + self.fibers_interrupted)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    defects: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_end(&self, exit: &Exit<Value, Value>) {
        match exit {
            Exit::Success(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Exit::Failure(cause) => {
                record_cause(self, cause);
            }
        }
    }

    pub(crate) fn snapshot(
        &self,
        live_roots: usize,
        pending_timers: usize,
        scheduler: SchedulerStats,
        uptime: Duration,
    ) -> RuntimeStats {
        RuntimeStats {
            fibers_started: self.started.load(Ordering::Relaxed),
            fibers_succeeded: self.succeeded.load(Ordering::Relaxed),
            fibers_failed: self.failed.load(Ordering::Relaxed),
            fibers_interrupted: self.interrupted.load(Ordering::Relaxed),
            defects: self.defects.load(Ordering::Relaxed),
            live_roots,
            pending_timers,
            scheduler,
            uptime,
        }
    }
}

fn record_cause(stats: &StatsCounters, cause: &Cause<Value>) {
    let defects = cause.defects().len() as u64;
    stats.defects.fetch_add(defects, Ordering::Relaxed);
    if cause.is_interrupted_only() {
        stats.interrupted.fetch_add(1, Ordering::Relaxed);
    } else {
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_span_status_from_exit() {
        assert_eq!(SpanStatus::from_exit(&Exit::Success(())), SpanStatus::Ok);
        assert_eq!(
            SpanStatus::from_exit(&Exit::interrupt(FiberId::None)),
            SpanStatus::Interrupted
        );
        assert!(matches!(
            SpanStatus::from_exit(&Exit::die("x")),
            SpanStatus::Error(_)
        ));
    }

    #[test]
    fn test_nested_spans_share_trace() {
        let tracer = Arc::new(MemoryTracer::new());
        let rt = Runtime::builder().num_workers(1).tracer(tracer.clone()).build().unwrap();
        let eff: Effect<i32> = Effect::succeed(1).with_span("inner").with_span("outer");
        assert_eq!(rt.run_sync(eff).unwrap(), 1);

        let spans = tracer.finished();
        assert_eq!(spans.len(), 2);
        let (inner, outer) = (&spans[0], &spans[1]);
        assert_eq!(inner.data.name, "inner");
        assert_eq!(outer.data.name, "outer");
        assert_eq!(inner.data.trace_id, outer.data.trace_id);
        assert_eq!(inner.data.parent_span_id, Some(outer.data.span_id));
        assert_eq!(outer.data.parent_span_id, None);
    }

    #[test]
    fn test_span_records_failure() {
        let tracer = Arc::new(MemoryTracer::new());
        let rt = Runtime::builder().num_workers(1).tracer(tracer.clone()).build().unwrap();
        let eff: Effect<(), String> = Effect::fail("nope".to_string()).with_span("op");
        assert!(rt.run_sync(eff).is_err());
        let spans = tracer.finished();
        assert!(matches!(spans[0].status, SpanStatus::Error(_)));
    }

    #[test]
    fn test_supervisor_sees_parent_links() {
        let supervisor = Arc::new(RecordingSupervisor::new());
        let rt = Runtime::builder()
            .num_workers(1)
            .supervisor(supervisor.clone())
            .build()
            .unwrap();
        let eff: Effect<()> = Effect::unit().fork().flat_map(|f| f.join());
        rt.run_sync(eff).unwrap();

        let started = supervisor.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1, FiberId::None);
        assert_eq!(started[1].1, started[0].0);
        assert_eq!(supervisor.ended().len(), 2);
    }

    #[test]
    fn test_live_fibers() {
        let stats = StatsCounters::default();
        stats.record_start();
        stats.record_start();
        stats.record_end(&Exit::Success(Value::unit()));
        let snap = stats.snapshot(0, 0, SchedulerStats::default(), Duration::ZERO);
        assert_eq!(snap.live_fibers(), 1);
    }
}
