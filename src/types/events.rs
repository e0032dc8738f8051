use serde::{Deserialize, Serialize};

use crate::types::ids::JobId;
use crate::types::job::Job;
use crate::types::summary::TaskSummary;

/// Engine lifecycle events published on the internal broadcast channel.
///
/// The subscription hub forwarder consumes these; embedding processes can
/// observe them directly through `Engine::event_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A job was accepted and pushed to its task queue
    JobEnqueued { job: Job },
    /// An attempt started; the job transitioned to `Retrying`
    JobStarted {
        job_id: JobId,
        task_name: String,
        retries: u32,
        trace_id: String,
    },
    /// A running handler reported progress
    JobProgress {
        job_id: JobId,
        task_name: String,
        current: u64,
        max: u64,
    },
    /// An attempt ended; the job carries its post-transition state
    /// (terminal, or `Queueing` again when requeued for retry)
    JobFinished { job: Job },
}

impl EngineEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            EngineEvent::JobEnqueued { .. } => "job_enqueued",
            EngineEvent::JobStarted { .. } => "job_started",
            EngineEvent::JobProgress { .. } => "job_progress",
            EngineEvent::JobFinished { .. } => "job_finished",
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            EngineEvent::JobEnqueued { job } | EngineEvent::JobFinished { job } => &job.id,
            EngineEvent::JobStarted { job_id, .. } | EngineEvent::JobProgress { job_id, .. } => {
                job_id
            }
        }
    }

    pub fn task_name(&self) -> &str {
        match self {
            EngineEvent::JobEnqueued { job } | EngineEvent::JobFinished { job } => &job.task_name,
            EngineEvent::JobStarted { task_name, .. }
            | EngineEvent::JobProgress { task_name, .. } => task_name,
        }
    }
}

/// Payloads delivered to dashboard subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnginePush {
    /// Refreshed counters for every visible task
    Summaries(Vec<TaskSummary>),
    /// One page of jobs matching the subscriber's filter
    JobList { jobs: Vec<Job>, total_count: usize },
    /// A single job the subscriber is watching
    JobDetail(Job),
}
