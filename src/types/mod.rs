//! Core data types shared across queue, store, and engine layers

pub mod events;
pub mod filter;
pub mod ids;
pub mod interval;
pub mod job;
pub mod summary;

pub use events::{EngineEvent, EnginePush};
pub use filter::{JobFilter, SummaryFilter};
pub use ids::{JobId, SubscriberId};
pub use interval::{format_duration, parse_duration};
pub use job::{Job, JobStatus, RetryHistory};
pub use summary::TaskSummary;
