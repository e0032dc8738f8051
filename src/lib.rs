//! # taskmill: embedded task-queue worker engine
//!
//! taskmill runs named background tasks inside your own process: register a
//! handler per task, enqueue jobs against it, and the engine takes care of
//! durable state, bounded retries, per-task FIFO execution and crash
//! recovery. Several replicas can share one queue and store; per-job locks
//! keep an attempt on exactly one of them.
//!
//! ## What you get
//!
//! - **Durable jobs**: every job and every attempt is persisted; a restarted
//!   process resumes queued work from the store
//! - **Bounded retries**: handlers decide between retryable and permanent
//!   errors; the engine enforces the per-job attempt budget and records a
//!   history entry per attempt
//! - **Cooperative cancellation**: `stop_job` cancels a running handler
//!   through its context token and finalizes the job as `Stopped`
//! - **Pluggable backends**: in-memory queue/store/locker by default, Redis
//!   and SQL (Postgres or SQLite) behind feature flags
//! - **Live observability**: subscribe to filtered job lists, per-task
//!   counters and single-job detail pushed on every change
//! - **Retention**: terminal jobs older than a configured age are swept on a
//!   cron schedule, adjustable at runtime
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use taskmill::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> EngineResult<()> {
//!     let engine = Engine::builder()
//!         .config(EngineConfig::default().with_max_concurrency(4))
//!         .register_task(
//!             "send-email",
//!             WorkerHandler::new(|ctx: JobContext| async move {
//!                 let recipient: String = ctx
//!                     .parse_arguments()
//!                     .map_err(|err| JobError::Permanent(err.to_string()))?;
//!                 if ctx.is_cancelled() {
//!                     return Ok(());
//!                 }
//!                 println!("sending to {recipient}, attempt {}", ctx.retries());
//!                 Ok(())
//!             }),
//!         )?
//!         .build()?;
//!
//!     let worker = engine.start().await?;
//!     engine
//!         .add_job(
//!             AddJobRequest::new("send-email")
//!                 .with_args("ops@example.com")?
//!                 .with_max_retry(3)
//!                 .with_interval(Duration::from_millis(100)),
//!         )
//!         .await?;
//!
//!     // ... the process does its real work ...
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Handlers return [`JobError::Retry`] to requeue (optionally with a new
//! delay or replacement arguments) or [`JobError::Permanent`] to fail the
//! job outright. See [`handler::JobContext`] for progress reporting and
//! result recording.

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod store;
mod subscription;
pub mod types;

pub use config::{ConfigEntry, EngineConfig, RuntimeSettings};
pub use engine::{AddJobRequest, Engine, EngineBuilder, WorkerHandle};
pub use error::{EngineError, EngineResult, JobError};
pub use handler::{JobContext, Progress, WorkerHandler};
pub use lock::{Locker, MemoryLocker, NoopLocker};
pub use queue::{MemoryQueue, TaskQueue};
pub use registry::{TaskDefinition, TaskRegistry};
pub use store::{
    JobPatch, JobStore, MemoryStore, NullStore, SummaryPatch, SummaryStore, UpdateOutcome,
};
pub use types::{
    EngineEvent, EnginePush, Job, JobFilter, JobId, JobStatus, RetryHistory, SubscriberId,
    SummaryFilter, TaskSummary,
};

// Backend implementations behind feature flags
#[cfg(feature = "redis")]
pub use lock::RedisLocker;
#[cfg(feature = "redis")]
pub use queue::RedisQueue;
#[cfg(feature = "redis")]
pub use store::RedisStore;
#[cfg(feature = "sql")]
pub use store::{SqlDialect, SqlStore};

/// The imports most embedding code needs
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{AddJobRequest, Engine, EngineBuilder, WorkerHandle};
    pub use crate::error::{EngineError, EngineResult, JobError};
    pub use crate::handler::{JobContext, WorkerHandler};
    pub use crate::types::{Job, JobFilter, JobId, JobStatus, TaskSummary};
}
