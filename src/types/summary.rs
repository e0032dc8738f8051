use serde::{Deserialize, Serialize};

use crate::types::job::JobStatus;

/// Denormalized per-task job counts, one bucket per status.
///
/// Summaries are maintained incrementally alongside every job transition so
/// dashboards never need to scan the job collection on the hot path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_name: String,
    pub queueing: i64,
    pub retrying: i64,
    pub success: i64,
    pub failure: i64,
    pub stopped: i64,
    /// Set while a bulk operation (clean, recount) is rewriting this task
    pub is_loading: bool,
}

impl TaskSummary {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Default::default()
        }
    }

    /// Counter for one status bucket
    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Queueing => self.queueing,
            JobStatus::Retrying => self.retrying,
            JobStatus::Success => self.success,
            JobStatus::Failure => self.failure,
            JobStatus::Stopped => self.stopped,
        }
    }

    pub fn set(&mut self, status: JobStatus, value: i64) {
        match status {
            JobStatus::Queueing => self.queueing = value,
            JobStatus::Retrying => self.retrying = value,
            JobStatus::Success => self.success = value,
            JobStatus::Failure => self.failure = value,
            JobStatus::Stopped => self.stopped = value,
        }
    }

    /// Apply a signed delta to one status bucket
    pub fn add(&mut self, status: JobStatus, delta: i64) {
        self.set(status, self.get(status) + delta);
    }

    /// Total jobs across all buckets
    pub fn total(&self) -> i64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_track_deltas() {
        let mut summary = TaskSummary::new("send-email");
        summary.add(JobStatus::Queueing, 2);
        summary.add(JobStatus::Queueing, -1);
        summary.add(JobStatus::Retrying, 1);
        summary.add(JobStatus::Success, 3);

        assert_eq!(summary.get(JobStatus::Queueing), 1);
        assert_eq!(summary.get(JobStatus::Retrying), 1);
        assert_eq!(summary.get(JobStatus::Success), 3);
        assert_eq!(summary.total(), 5);
    }

    #[test]
    fn set_overwrites() {
        let mut summary = TaskSummary::new("t");
        summary.add(JobStatus::Failure, 7);
        summary.set(JobStatus::Failure, 0);
        assert_eq!(summary.get(JobStatus::Failure), 0);
    }
}
