//! One execution pass for a task slot: claim the queue head under the
//! distributed lock, run the handler, record the outcome.
//!
//! The pass holds a concurrency permit for the whole attempt. Guarded store
//! updates (status filters on the claim and the finalization) make the state
//! machine safe against concurrent `stop_job` calls and replica races.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::EngineInner;
use crate::error::{EngineResult, JobError};
use crate::handler::{JobContext, Progress};
use crate::lock::Locker;
use crate::queue::TaskQueue;
use crate::registry::TaskDefinition;
use crate::store::{JobPatch, JobStore};
use crate::types::{
    format_duration, EngineEvent, Job, JobFilter, JobId, JobStatus, RetryHistory,
};

pub(crate) async fn run_slot(inner: Arc<EngineInner>, slot: usize) {
    let Some(def) = inner.registry.by_slot(slot).map(Arc::clone) else {
        return;
    };
    let _permit = tokio::select! {
        permit = inner.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_closed) => return,
        },
        _ = inner.root_token.cancelled() => return,
    };

    let mut reseeded = false;
    loop {
        let peeked = match inner.queue.next_job(&def.name).await {
            Ok(peeked) => peeked,
            Err(err) => {
                warn!(task = %def.name, error = %err, "queue peek failed");
                return;
            }
        };
        let Some(job_id) = peeked else {
            // the queue can trail the store after a crash; reseed once
            if reseeded {
                return;
            }
            match reseed(&inner, &def.name).await {
                Ok(true) => {
                    reseeded = true;
                    continue;
                }
                Ok(false) => return,
                Err(err) => {
                    warn!(task = %def.name, error = %err, "queue reseed failed");
                    return;
                }
            }
        };

        let lock_key = inner.lock_key(&job_id);
        match inner.locker.is_locked(&lock_key).await {
            Ok(false) => {}
            Ok(true) => {
                // another replica runs it; check back in case its lock expires
                debug!(job_id = %job_id, "job held by another worker");
                inner.arm(def.slot, inner.config.default_interval);
                return;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "lock check failed");
                return;
            }
        }

        // we own the lock from here; every exit below must release it
        let found = match inner.store.find_job_by_id(&job_id).await {
            Ok(found) => found,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "job lookup failed");
                unlock(&inner, &lock_key).await;
                return;
            }
        };
        let Some(job) = found else {
            // queue entry without a document; drop it
            let _ = inner.queue.pop_job(&def.name).await;
            unlock(&inner, &lock_key).await;
            continue;
        };
        if job.status != JobStatus::Queueing {
            debug!(job_id = %job_id, status = %job.status, "skipping stale queue entry");
            let _ = inner.queue.pop_job(&def.name).await;
            unlock(&inner, &lock_key).await;
            continue;
        }

        match inner.queue.pop_job(&def.name).await {
            Ok(Some(popped)) if popped == job_id => {}
            Ok(other) => {
                if let Some(taken) = other {
                    if let Err(err) = inner.queue.push_job(&def.name, &taken).await {
                        warn!(job_id = %taken, error = %err, "requeue after race failed");
                    }
                }
                warn!(job_id = %job_id, "queue head changed, yielding");
                unlock(&inner, &lock_key).await;
                return;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "queue pop failed");
                unlock(&inner, &lock_key).await;
                return;
            }
        }

        execute_attempt(&inner, &def, job, &lock_key).await;
        return;
    }
}

/// Push store-known `Queueing` jobs missing from the queue, oldest first.
/// Returns whether anything was restored.
async fn reseed(inner: &Arc<EngineInner>, task_name: &str) -> EngineResult<bool> {
    let filter = JobFilter::new()
        .with_task_name(task_name)
        .with_statuses(vec![JobStatus::Queueing]);
    let mut pending = inner.store.find_all_jobs(&filter).await?;
    if pending.is_empty() {
        return Ok(false);
    }
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let queued: HashSet<JobId> = inner
        .queue
        .get_all_jobs(task_name)
        .await?
        .into_iter()
        .collect();
    let mut restored = 0;
    for job in &pending {
        if !queued.contains(&job.id) {
            inner.queue.push_job(task_name, &job.id).await?;
            restored += 1;
        }
    }
    if restored > 0 {
        info!(task = %task_name, restored, "restored persisted jobs to queue");
    }
    Ok(restored > 0)
}

/// Release the attempt's distributed lock; failures are logged, not fatal
async fn unlock(inner: &EngineInner, lock_key: &str) {
    if let Err(err) = inner.locker.unlock(lock_key).await {
        warn!(lock_key, error = %err, "lock release failed");
    }
}

async fn execute_attempt(
    inner: &Arc<EngineInner>,
    def: &Arc<TaskDefinition>,
    mut job: Job,
    lock_key: &str,
) {
    let trace_id = Uuid::new_v4().simple().to_string();
    let started_at = Utc::now();
    job.retries += 1;
    job.status = JobStatus::Retrying;
    job.trace_id = trace_id.clone();

    let claim = JobPatch {
        status: Some(JobStatus::Retrying),
        retries: Some(job.retries),
        trace_id: Some(trace_id.clone()),
        ..Default::default()
    };
    let guard = JobFilter::new()
        .with_job_id(job.id.clone())
        .with_statuses(vec![JobStatus::Queueing]);
    match inner.store.update_job(&guard, &claim, &[]).await {
        Ok(outcome) if outcome.affected == 1 => {}
        Ok(_) => {
            // stopped or claimed elsewhere between our read and the update
            debug!(job_id = %job.id, "job no longer claimable");
            unlock(inner, lock_key).await;
            arm_next(inner, def).await;
            return;
        }
        Err(err) => {
            warn!(job_id = %job.id, error = %err, "claim failed, requeueing");
            if let Err(err) = inner.queue.push_job(&def.name, &job.id).await {
                warn!(job_id = %job.id, error = %err, "requeue failed");
            }
            unlock(inner, lock_key).await;
            arm_next(inner, def).await;
            return;
        }
    }

    let _ = inner.events.send(EngineEvent::JobStarted {
        job_id: job.id.clone(),
        task_name: job.task_name.clone(),
        retries: job.retries,
        trace_id: trace_id.clone(),
    });
    arm_next(inner, def).await;

    let token = inner.root_token.child_token();
    inner.active.write().insert(job.id.clone(), token.clone());

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let mut progress_forwarder = tokio::spawn(forward_progress(
        Arc::clone(inner),
        job.id.clone(),
        job.task_name.clone(),
        progress_rx,
    ));

    let ctx = JobContext::new(&job, trace_id.clone(), token.clone(), Some(progress_tx));
    let span = info_span!(
        "job",
        task = %job.task_name,
        job_id = %job.id,
        attempt = job.retries,
        trace = %trace_id
    );
    let outcome = AssertUnwindSafe(def.handler.run(ctx.clone()))
        .catch_unwind()
        .instrument(span)
        .await;

    inner.active.write().remove(&job.id);
    let result_payload = ctx.take_result();
    drop(ctx);
    // handlers can leak context clones into detached tasks; don't wait on them
    if timeout(Duration::from_secs(1), &mut progress_forwarder)
        .await
        .is_err()
    {
        progress_forwarder.abort();
    }

    let attempt = classify(
        token.is_cancelled(),
        inner.root_token.is_cancelled(),
        job.retries,
        job.max_retry,
        outcome,
    );
    let ended_at = Utc::now();
    let history = RetryHistory {
        status: attempt.status,
        error: attempt.error.clone(),
        error_stack: attempt.error_stack.clone(),
        trace_id: trace_id.clone(),
        started_at,
        ended_at,
    };

    let requeue = attempt.status == JobStatus::Queueing;
    let mut patch = JobPatch {
        status: Some(attempt.status),
        error: Some(attempt.error.clone()),
        finished_at: if requeue {
            Some(None)
        } else {
            Some(Some(ended_at))
        },
        ..Default::default()
    };
    if let Some(result) = result_payload {
        patch.result = Some(result);
    }
    if requeue {
        if let Some(args) = attempt.new_args.clone() {
            patch.arguments = Some(args);
        }
        if let Some(delay) = attempt.requeue_delay {
            patch.interval = Some(format_duration(delay));
        }
    }

    let finalize = JobFilter::new()
        .with_job_id(job.id.clone())
        .with_statuses(vec![JobStatus::Retrying]);
    match inner
        .store
        .update_job(&finalize, &patch, std::slice::from_ref(&history))
        .await
    {
        Ok(outcome) if outcome.affected == 1 => {}
        Ok(_) => warn!(job_id = %job.id, "job state changed before finalization"),
        Err(err) => error!(job_id = %job.id, error = %err, "attempt finalization failed"),
    }
    unlock(inner, lock_key).await;

    patch.apply_to(&mut job);
    job.retry_histories.push(history);

    match attempt.status {
        JobStatus::Success => {
            info!(job_id = %job.id, task = %job.task_name, attempt = job.retries, "job succeeded");
        }
        JobStatus::Stopped => info!(job_id = %job.id, task = %job.task_name, "job stopped"),
        JobStatus::Failure => {
            error!(
                job_id = %job.id,
                task = %job.task_name,
                retries = job.retries,
                error = %job.error,
                "job failed"
            );
        }
        _ => {
            info!(
                job_id = %job.id,
                task = %job.task_name,
                attempt = job.retries,
                error = %job.error,
                "job requeued for retry"
            );
        }
    }

    if requeue {
        if let Err(err) = inner.queue.push_job(&job.task_name, &job.id).await {
            warn!(job_id = %job.id, error = %err, "retry requeue failed");
        }
        let delay = attempt
            .requeue_delay
            .or_else(|| job.interval_duration().ok())
            .unwrap_or(inner.config.default_interval);
        inner.arm(def.slot, delay);
    }
    if def.internal {
        inner.arm(def.slot, inner.next_retention_delay());
    }
    let _ = inner.events.send(EngineEvent::JobFinished { job });
}

/// Keep the slot flowing while this attempt runs: schedule the next queued
/// job using its own configured delay
async fn arm_next(inner: &Arc<EngineInner>, def: &Arc<TaskDefinition>) {
    if def.internal {
        return;
    }
    match inner.queue.next_job(&def.name).await {
        Ok(Some(next_id)) => {
            let delay = match inner.store.find_job_by_id(&next_id).await {
                Ok(Some(next)) => next
                    .interval_duration()
                    .unwrap_or(inner.config.default_interval),
                _ => inner.config.default_interval,
            };
            inner.arm(def.slot, delay);
        }
        Ok(None) => {}
        Err(err) => warn!(task = %def.name, error = %err, "next job peek failed"),
    }
}

/// Persist progress updates and publish them as events until the handler's
/// context goes away
async fn forward_progress(
    inner: Arc<EngineInner>,
    job_id: JobId,
    task_name: String,
    mut progress: mpsc::UnboundedReceiver<Progress>,
) {
    while let Some(update) = progress.recv().await {
        let patch = JobPatch {
            current_progress: Some(update.current),
            max_progress: Some(update.max),
            ..Default::default()
        };
        let filter = JobFilter::new().with_job_id(job_id.clone());
        if let Err(err) = inner.store.update_job(&filter, &patch, &[]).await {
            debug!(job_id = %job_id, error = %err, "progress write failed");
        }
        let _ = inner.events.send(EngineEvent::JobProgress {
            job_id: job_id.clone(),
            task_name: task_name.clone(),
            current: update.current,
            max: update.max,
        });
    }
}

struct AttemptOutcome {
    status: JobStatus,
    error: String,
    error_stack: String,
    requeue_delay: Option<Duration>,
    new_args: Option<String>,
}

impl AttemptOutcome {
    fn terminal(status: JobStatus, error: String, error_stack: String) -> Self {
        Self {
            status,
            error,
            error_stack,
            requeue_delay: None,
            new_args: None,
        }
    }
}

/// Map a handler outcome to the job's next status. Cancellation wins over
/// whatever the handler returned; a panic is terminal.
fn classify(
    cancelled: bool,
    shutdown: bool,
    retries: u32,
    max_retry: u32,
    outcome: Result<Result<(), JobError>, Box<dyn Any + Send>>,
) -> AttemptOutcome {
    if cancelled {
        let error = if shutdown {
            "stopped by shutdown"
        } else {
            "stopped by request"
        };
        return AttemptOutcome::terminal(JobStatus::Stopped, error.to_string(), String::new());
    }
    match outcome {
        Ok(Ok(())) => AttemptOutcome::terminal(JobStatus::Success, String::new(), String::new()),
        Ok(Err(JobError::Permanent(reason))) => {
            AttemptOutcome::terminal(JobStatus::Failure, reason, String::new())
        }
        Ok(Err(JobError::Retry {
            reason,
            delay,
            new_args,
        })) => {
            if retries < max_retry {
                AttemptOutcome {
                    status: JobStatus::Queueing,
                    error: reason,
                    error_stack: String::new(),
                    requeue_delay: delay,
                    new_args,
                }
            } else {
                AttemptOutcome::terminal(
                    JobStatus::Failure,
                    reason,
                    "retries exhausted".to_string(),
                )
            }
        }
        Err(panic) => {
            let message = panic_message(panic);
            let stack = format!("panic: {message}");
            AttemptOutcome::terminal(JobStatus::Failure, message, stack)
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "handler panicked".to_string(),
        },
    }
}
