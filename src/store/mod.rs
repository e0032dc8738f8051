//! Durable job persistence.
//!
//! The store owns job bodies, retry histories, per-task summary counters and
//! the persisted runtime settings. Counters are adjusted inside
//! [`JobStore::save_job`] and [`JobStore::update_job`] so they track job
//! transitions without hot-path scans; [`JobStore::aggregate_all_task_jobs`]
//! is the cold-path recount used to correct drift.

pub mod memory;
pub mod null;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sql")]
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ConfigEntry;
use crate::error::EngineResult;
use crate::types::{Job, JobFilter, JobId, JobStatus, RetryHistory, SummaryFilter, TaskSummary};

/// Field updates applied to every job matching a filter.
/// `None` leaves the field untouched; `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub retries: Option<u32>,
    pub max_retry: Option<u32>,
    pub arguments: Option<String>,
    pub interval: Option<String>,
    pub error: Option<String>,
    pub trace_id: Option<String>,
    pub result: Option<String>,
    pub current_progress: Option<u64>,
    pub max_progress: Option<u64>,
    /// Outer `Some` overwrites the field, inner `None` clears it
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    /// Apply in place; used by the in-memory and document backends
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(retries) = self.retries {
            job.retries = retries;
        }
        if let Some(max_retry) = self.max_retry {
            job.max_retry = max_retry;
        }
        if let Some(arguments) = &self.arguments {
            job.arguments = arguments.clone();
        }
        if let Some(interval) = &self.interval {
            job.interval = interval.clone();
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(trace_id) = &self.trace_id {
            job.trace_id = trace_id.clone();
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(current) = self.current_progress {
            job.current_progress = current;
        }
        if let Some(max) = self.max_progress {
            job.max_progress = max;
        }
        if let Some(finished_at) = self.finished_at {
            job.finished_at = finished_at;
        }
        job.updated_at = Utc::now();
    }
}

/// Absolute overwrites for summary fields; `None` leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct SummaryPatch {
    pub queueing: Option<i64>,
    pub retrying: Option<i64>,
    pub success: Option<i64>,
    pub failure: Option<i64>,
    pub stopped: Option<i64>,
    pub is_loading: Option<bool>,
}

impl SummaryPatch {
    /// Overwrite every counter from a freshly aggregated summary
    pub fn from_counts(summary: &TaskSummary) -> Self {
        Self {
            queueing: Some(summary.queueing),
            retrying: Some(summary.retrying),
            success: Some(summary.success),
            failure: Some(summary.failure),
            stopped: Some(summary.stopped),
            is_loading: None,
        }
    }

    pub fn loading(flag: bool) -> Self {
        Self {
            is_loading: Some(flag),
            ..Default::default()
        }
    }

    pub fn with_loading(mut self, flag: bool) -> Self {
        self.is_loading = Some(flag);
        self
    }

    pub fn apply_to(&self, summary: &mut TaskSummary) {
        if let Some(v) = self.queueing {
            summary.queueing = v;
        }
        if let Some(v) = self.retrying {
            summary.retrying = v;
        }
        if let Some(v) = self.success {
            summary.success = v;
        }
        if let Some(v) = self.failure {
            summary.failure = v;
        }
        if let Some(v) = self.stopped {
            summary.stopped = v;
        }
        if let Some(v) = self.is_loading {
            summary.is_loading = v;
        }
    }
}

/// Result of a bulk job update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Jobs matching the filter
    pub matched: u64,
    /// Jobs actually rewritten
    pub affected: u64,
}

/// Per-task counter maintenance, kept separate so backends can implement it
/// with their native atomic operations
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Summaries for every known task matching the filter, ordered by name
    async fn find_all_summary(&self, filter: &SummaryFilter) -> EngineResult<Vec<TaskSummary>>;

    async fn find_detail_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>>;

    /// Absolute overwrite of selected fields
    async fn update_summary(&self, task_name: &str, patch: &SummaryPatch) -> EngineResult<()>;

    /// Atomic signed adjustments, one per status bucket
    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[(JobStatus, i64)],
    ) -> EngineResult<()>;
}

/// Job body persistence contract.
///
/// `find_all_jobs` returns newest first (dashboard order); callers needing
/// FIFO order re-sort by `created_at` ascending.
#[async_trait]
pub trait JobStore: SummaryStore {
    /// Insert a new job and bump its status bucket
    async fn save_job(&self, job: &Job) -> EngineResult<()>;

    /// Patch every matching job, appending the given retry history entries.
    /// Status changes adjust summary counters: the previous bucket is
    /// decremented and the new one incremented, transactionally where the
    /// backend supports it.
    async fn update_job(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
        histories: &[RetryHistory],
    ) -> EngineResult<UpdateOutcome>;

    async fn find_job_by_id(&self, id: &JobId) -> EngineResult<Option<Job>>;

    async fn find_all_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>>;

    async fn count_all_jobs(&self, filter: &JobFilter) -> EngineResult<usize>;

    /// Recount jobs per (task, status) by scanning the collection. Cold path
    /// only; summaries are the hot-path counters.
    async fn aggregate_all_task_jobs(&self, filter: &JobFilter)
        -> EngineResult<Vec<TaskSummary>>;

    /// Bulk-delete matching jobs, decrementing their status buckets.
    /// Returns the number deleted.
    async fn clean_jobs(&self, filter: &JobFilter) -> EngineResult<usize>;

    /// Delete one job, returning it if it existed
    async fn delete_job(&self, id: &JobId) -> EngineResult<Option<Job>>;

    async fn find_configuration(&self, key: &str) -> EngineResult<Option<ConfigEntry>>;

    async fn set_configuration(&self, entry: &ConfigEntry) -> EngineResult<()>;

    async fn list_configurations(&self) -> EngineResult<Vec<ConfigEntry>>;
}

pub use memory::MemoryStore;
pub use null::NullStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
#[cfg(feature = "sql")]
pub use sql::{SqlDialect, SqlStore};
