//! # Tessel Runtime
//!
//! A fiber-based effect runtime. Programs are built as inert [`Effect`]
//! values and interpreted on lightweight, interruptible fibers:
//!
//! - **Fibers**: N:M scheduling over a work-stealing thread pool, with a
//!   fairness yield so no fiber monopolizes a worker
//! - **Structured Concurrency**: children are supervised by their parent and
//!   interrupted when it finishes
//! - **Resource Safety**: [`Scope`]s run finalizers in reverse order, exactly
//!   once, whatever the exit
//! - **Failure Model**: every failure is a [`Cause`] tree of typed errors,
//!   defects, and interruptions
//! - **Coordination**: [`Deferred`], [`Queue`], [`Hub`], and software
//!   transactional memory in [`stm`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TESSEL RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Runtime    │  │    Effect    │  │    Scope     │          │
//! │  │ (runtime.rs) │  │  (effect/)   │  │  (scope.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Interpreter  │  │  Scheduler   │  │    Timer     │          │
//! │  │(fiber_runtime│  │(scheduler.rs)│  │  (timer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Deferred   │  │ Queue / Hub  │  │     STM      │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessel_runtime::{Effect, Queue};
//!
//! let runtime = tessel_runtime::init()?;
//! let program: Effect<Vec<i32>> = Queue::bounded(8).flat_map(|q: Queue<i32>| {
//!     let producer = q.offer_all(vec![1, 2, 3]);
//!     producer.fork().zip_right(q.take_between(3, 3))
//! });
//! assert_eq!(runtime.run_sync(program)?, vec![1, 2, 3]);
//! runtime.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod deferred;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
mod fiber_runtime;
pub mod fiber_ref;
pub mod hub;
pub mod log;
pub mod observability;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod stm;
mod timer;
mod value;

// Re-exports
pub use cause::{Cause, Defect, Squashed};
pub use config::{ConfigError, LogConfig, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig, ShutdownConfig};
pub use deferred::Deferred;
pub use effect::{Callback, Effect, Restore};
pub use error::FiberFailure;
pub use exit::Exit;
pub use fiber::{Fiber, FiberId, FiberStatus};
pub use fiber_ref::FiberRef;
pub use fiber_runtime::FiberContext;
pub use hub::{Hub, Subscription};
pub use log::{LogEntry, LogLevel, Logger, MemoryLogger, TracingLogger};
pub use observability::{MemoryTracer, RuntimeStats, SpanStatus, Supervisor, Tracer, TracingTracer};
pub use queue::{Dequeue, Enqueue, Queue, Strategy};
pub use runtime::{Promise, PromiseExit, Runtime, RuntimeBuilder, RuntimeError};
pub use scope::Scope;
pub use stm::{Stm, TArray, THub, TMap, TQueue, TRef, TSubscription};
pub use value::Data;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a runtime with the default configuration.
pub fn init() -> Result<Runtime, RuntimeError> {
    init_with(RuntimeConfig::default())
}

/// Start a runtime with `config`, rejecting invalid settings.
///
/// # Example
///
/// ```rust,ignore
/// use tessel_runtime::{init_with, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(4)
///     .max_ops_before_yield(256)
///     .build()?;
///
/// let runtime = init_with(config)?;
/// ```
pub fn init_with(config: RuntimeConfig) -> Result<Runtime, RuntimeError> {
    Runtime::new(config)
}

/// Start a runtime configured from `TESSEL_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<Runtime, RuntimeError> {
    init_with(RuntimeConfig::from_env())
}

// ============================================================================
// Tests
// ============================================================================
