//! Engine configuration.
//!
//! Two layers: [`EngineConfig`] holds construction-time knobs, while runtime
//! settings (retention schedule, subscriber limits) are [`ConfigEntry`]
//! records persisted through the store, seeded on first run, and editable
//! while the engine is live.

use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::parse_duration;

/// Construction-time engine knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum concurrently running handlers across all tasks
    pub max_concurrency: usize,
    /// Delay before a job's first run when none is given at enqueue
    pub default_interval: Duration,
    /// How long shutdown waits for in-flight handlers to finish
    pub shutdown_grace: Duration,
    /// Prefix for queue, lock and document keys
    pub namespace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            namespace: "taskmill".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Persisted runtime setting record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    /// Human-readable label shown by dashboards
    pub name: String,
    pub value: String,
    pub is_active: bool,
}

impl ConfigEntry {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            value: value.into(),
            is_active: true,
        }
    }
}

/// Cron expression driving the retention sweep
pub const RETENTION_SCHEDULE_KEY: &str = "retention_schedule";
/// Terminal jobs older than this are deleted by the sweep
pub const RETENTION_AGE_KEY: &str = "retention_age";
/// Dashboard subscribers idle longer than this are evicted
pub const SUBSCRIBER_MAX_AGE_KEY: &str = "subscriber_max_age";
/// Dashboard subscriber capacity
pub const MAX_SUBSCRIBERS_KEY: &str = "max_subscribers";

const DEFAULT_RETENTION_SCHEDULE: &str = "0 0 2 * * *";
const DEFAULT_RETENTION_AGE: &str = "720h";
const DEFAULT_SUBSCRIBER_MAX_AGE: &str = "10m";
const DEFAULT_MAX_SUBSCRIBERS: &str = "5";

/// Settings seeded into the store on first run
pub fn default_entries() -> Vec<ConfigEntry> {
    vec![
        ConfigEntry::new(
            RETENTION_SCHEDULE_KEY,
            "Job retention schedule",
            DEFAULT_RETENTION_SCHEDULE,
        ),
        ConfigEntry::new(RETENTION_AGE_KEY, "Job retention age", DEFAULT_RETENTION_AGE),
        ConfigEntry::new(
            SUBSCRIBER_MAX_AGE_KEY,
            "Subscriber idle eviction age",
            DEFAULT_SUBSCRIBER_MAX_AGE,
        ),
        ConfigEntry::new(
            MAX_SUBSCRIBERS_KEY,
            "Max dashboard subscribers",
            DEFAULT_MAX_SUBSCRIBERS,
        ),
    ]
}

/// Parsed, validated view over the persisted settings
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub retention_schedule: Schedule,
    pub retention_age: Duration,
    pub subscriber_max_age: Duration,
    pub max_subscribers: usize,
}

static DEFAULT_SETTINGS: Lazy<RuntimeSettings> = Lazy::new(|| RuntimeSettings {
    // The defaults above are compile-time constants and always parse
    retention_schedule: Schedule::from_str(DEFAULT_RETENTION_SCHEDULE)
        .expect("default retention schedule is valid"),
    retention_age: Duration::from_secs(720 * 3_600),
    subscriber_max_age: Duration::from_secs(600),
    max_subscribers: 5,
});

impl Default for RuntimeSettings {
    fn default() -> Self {
        DEFAULT_SETTINGS.clone()
    }
}

impl RuntimeSettings {
    /// Validate and apply one persisted setting. Unknown keys and malformed
    /// values are rejected without mutating the current state.
    pub fn apply(&mut self, key: &str, value: &str) -> EngineResult<()> {
        match key {
            RETENTION_SCHEDULE_KEY => {
                self.retention_schedule = parse_schedule(value)?;
            }
            RETENTION_AGE_KEY => {
                self.retention_age = parse_duration(value)?;
            }
            SUBSCRIBER_MAX_AGE_KEY => {
                self.subscriber_max_age = parse_duration(value)?;
            }
            MAX_SUBSCRIBERS_KEY => {
                self.max_subscribers =
                    value
                        .trim()
                        .parse()
                        .map_err(|_| EngineError::InvalidConfiguration {
                            key: key.to_string(),
                            reason: format!("not a number: {value}"),
                        })?;
            }
            other => return Err(EngineError::UnknownConfiguration(other.to_string())),
        }
        Ok(())
    }
}

/// Parse a cron expression (seconds field included, e.g. `"0 0 2 * * *"`)
pub fn parse_schedule(value: &str) -> EngineResult<Schedule> {
    Schedule::from_str(value.trim())
        .map_err(|err| EngineError::InvalidSchedule(format!("{value}: {err}")))
}
