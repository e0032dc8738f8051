//! Per-task FIFO queues of pending job ids.
//!
//! Only ids live here; job bodies live in the persistence store. FIFO order
//! holds per task, never across tasks.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::types::JobId;

/// Queue backend contract shared by every replica in a namespace
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a job id to the tail of the task's queue
    async fn push_job(&self, task_name: &str, job_id: &JobId) -> EngineResult<()>;

    /// Remove and return the head of the task's queue
    async fn pop_job(&self, task_name: &str) -> EngineResult<Option<JobId>>;

    /// Return the head without removing it
    async fn next_job(&self, task_name: &str) -> EngineResult<Option<JobId>>;

    /// Snapshot of all queued ids, head first (startup rehydration)
    async fn get_all_jobs(&self, task_name: &str) -> EngineResult<Vec<JobId>>;

    /// Drop the task's queue entirely
    async fn clear(&self, task_name: &str) -> EngineResult<()>;
}

pub use memory::MemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;
