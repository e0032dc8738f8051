//! Built-in retention task: deletes terminal jobs older than the configured
//! age on the configured cron schedule.
//!
//! The sweep is a real job. The dispatch loop enqueues one when the schedule
//! fires and it runs through the normal claim/execute/finalize path, so
//! replicas coordinate on it through the shared queue and lock like on any
//! other job.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::engine::EngineInner;
use crate::error::{EngineResult, JobError};
use crate::handler::WorkerHandler;
use crate::queue::TaskQueue;
use crate::store::JobStore;
use crate::types::{Job, JobFilter, JobStatus};

pub(crate) const RETENTION_TASK: &str = "job-retention";

/// Handler of the internal sweep task. Holds a weak engine reference since
/// the registry owning it lives inside the engine it sweeps.
pub(crate) fn sweep_handler(engine: Weak<EngineInner>) -> WorkerHandler {
    WorkerHandler::new(move |ctx| {
        let engine = engine.clone();
        async move {
            let Some(inner) = engine.upgrade() else {
                return Ok(());
            };
            let age = inner.settings.read().retention_age;
            let cutoff = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(30));
            let filter = JobFilter::new()
                .with_statuses(vec![
                    JobStatus::Success,
                    JobStatus::Failure,
                    JobStatus::Stopped,
                ])
                .with_before_created_at(cutoff);
            let removed =
                inner
                    .clean_jobs_filtered(&filter)
                    .await
                    .map_err(|err| JobError::Retry {
                        reason: err.to_string(),
                        delay: None,
                        new_args: None,
                    })?;
            info!(removed, "retention sweep finished");
            ctx.set_result(format!("{{\"removed\":{removed}}}"));
            Ok(())
        }
    })
}

/// Enqueue a sweep job unless one is already waiting
pub(crate) async fn ensure_sweep_job(inner: &Arc<EngineInner>) -> EngineResult<()> {
    if inner.queue.next_job(RETENTION_TASK).await?.is_some() {
        return Ok(());
    }
    let job = Job::new(RETENTION_TASK, "{}", 1, Duration::ZERO);
    inner.store.save_job(&job).await?;
    inner.queue.push_job(RETENTION_TASK, &job.id).await?;
    Ok(())
}
