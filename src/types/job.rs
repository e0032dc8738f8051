use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::ids::JobId;
use crate::types::interval::{format_duration, parse_duration};

/// Lifecycle state of a job.
///
/// Active states are `Queueing` (waiting in a task queue) and `Retrying`
/// (an attempt is in flight). `Success`, `Failure` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queueing,
    Retrying,
    Success,
    Failure,
    Stopped,
}

impl JobStatus {
    /// All statuses, in dashboard display order
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queueing,
        JobStatus::Retrying,
        JobStatus::Success,
        JobStatus::Failure,
        JobStatus::Stopped,
    ];

    /// Canonical wire name for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queueing => "QUEUEING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Stopped => "STOPPED",
        }
    }

    /// Whether a job in this status will never run again without manual retry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Stopped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUEUEING" => Ok(JobStatus::Queueing),
            "RETRYING" => Ok(JobStatus::Retrying),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            "STOPPED" => Ok(JobStatus::Stopped),
            other => Err(EngineError::Serialization(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Outcome record of a single execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistory {
    /// Status the job transitioned to when the attempt ended
    pub status: JobStatus,
    pub error: String,
    /// Panic payloads and debug-formatted error chains
    pub error_stack: String,
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A unit of work: one enqueued invocation of a registered task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_name: String,
    /// Opaque argument payload, normally JSON
    pub arguments: String,
    /// Attempts consumed so far; never exceeds `max_retry`
    pub retries: u32,
    pub max_retry: u32,
    /// Delay before the next run, as a compact duration string
    pub interval: String,
    pub status: JobStatus,
    pub error: String,
    pub trace_id: String,
    pub result: String,
    pub current_progress: u64,
    pub max_progress: u64,
    pub retry_histories: Vec<RetryHistory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job in `Queueing` state with a generated id
    pub fn new(
        task_name: impl Into<String>,
        arguments: impl Into<String>,
        max_retry: u32,
        interval: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            task_name: task_name.into(),
            arguments: arguments.into(),
            retries: 0,
            max_retry,
            interval: format_duration(interval),
            status: JobStatus::Queueing,
            error: String::new(),
            trace_id: String::new(),
            result: String::new(),
            current_progress: 0,
            max_progress: 0,
            retry_histories: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Whether this job will never run again without manual retry
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Parse the interval field back into a [`Duration`]
    pub fn interval_duration(&self) -> EngineResult<Duration> {
        parse_duration(&self.interval)
    }

    /// Typed view over the argument payload
    pub fn parse_arguments<T: serde::de::DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queueing() {
        let job = Job::new("send-email", r#"{"to":"a@b.c"}"#, 3, Duration::from_secs(5));
        assert_eq!(job.status, JobStatus::Queueing);
        assert_eq!(job.retries, 0);
        assert_eq!(job.max_retry, 3);
        assert_eq!(job.interval, "5s");
        assert!(!job.is_terminal());
        assert!(job.retry_histories.is_empty());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn interval_round_trips() {
        let job = Job::new("t", "{}", 1, Duration::from_millis(1_500));
        assert_eq!(job.interval_duration().unwrap(), Duration::from_millis(1_500));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queueing.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn status_string_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("LIMBO".parse::<JobStatus>().is_err());
    }

    #[test]
    fn typed_arguments() {
        #[derive(serde::Deserialize)]
        struct Args {
            to: String,
        }
        let job = Job::new("send-email", r#"{"to":"a@b.c"}"#, 1, Duration::ZERO);
        let args: Args = job.parse_arguments().unwrap();
        assert_eq!(args.to, "a@b.c");
    }
}
