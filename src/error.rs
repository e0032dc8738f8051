use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Infrastructure errors for engine operations
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Task not registered: {0}")]
    TaskNotFound(String),

    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Max retry must be at least 1, got {0}")]
    InvalidMaxRetry(u32),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid cron schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown configuration key: {0}")]
    UnknownConfiguration(String),

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidConfiguration { key: String, reason: String },

    #[error("Subscriber limit reached (max {0})")]
    SubscriberLimitReached(usize),

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(feature = "sql")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Handler outcome - determines retry behavior
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Retryable error - the job is requeued while attempts remain.
    /// An explicit delay overrides the job interval for the next run,
    /// and replacement arguments (if any) are persisted before requeue.
    #[error("Retryable error: {reason}")]
    Retry {
        reason: String,
        delay: Option<Duration>,
        new_args: Option<String>,
    },

    /// Permanent error - fail immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error using the job's own interval as delay
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retry {
            reason: msg.into(),
            delay: None,
            new_args: None,
        }
    }

    /// Create a retryable error with an explicit backoff delay
    pub fn retry_after(msg: impl Into<String>, delay: Duration) -> Self {
        Self::Retry {
            reason: msg.into(),
            delay: Some(delay),
            new_args: None,
        }
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Replace the job arguments for the next attempt (retryable errors only)
    pub fn with_new_args(mut self, args: impl Into<String>) -> Self {
        if let Self::Retry { new_args, .. } = &mut self {
            *new_args = Some(args.into());
        }
        self
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Retry { reason, .. } => reason,
            Self::Permanent(msg) => msg,
        }
    }
}
