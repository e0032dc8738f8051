//! Central dispatch loop.
//!
//! One task owns every per-slot timer. Enqueue paths send [`DispatchCommand`]s
//! to arm a slot; when a timer fires the loop spawns one execution pass for
//! that slot into a [`JoinSet`]. Rearming a slot that already has a pending
//! timer replaces it, so bursts of enqueues collapse into a single wakeup.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, Sleep};
use tracing::{debug, info, warn};

use crate::engine::{execute, retention, EngineInner};
use crate::lock::Locker;
use crate::queue::TaskQueue;
use crate::store::{JobPatch, JobStore};
use crate::types::{JobFilter, JobId, JobStatus};

#[derive(Debug)]
pub(crate) enum DispatchCommand {
    /// Run slot `slot` after `delay`, replacing any pending timer for it
    Arm { slot: usize, delay: Duration },
}

pub(crate) async fn run(
    inner: Arc<EngineInner>,
    mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
) {
    let mut timers: Vec<Option<Pin<Box<Sleep>>>> = Vec::new();
    timers.resize_with(inner.registry.len(), || None);
    let mut executions: JoinSet<()> = JoinSet::new();
    debug!(slots = timers.len(), "dispatch loop running");

    loop {
        tokio::select! {
            _ = inner.root_token.cancelled() => break,
            command = commands.recv() => match command {
                Some(DispatchCommand::Arm { slot, delay }) => {
                    arm_slot(&mut timers, slot, delay);
                }
                None => break,
            },
            slot = next_fired(&mut timers) => {
                timers[slot] = None;
                launch(&inner, &mut executions, slot).await;
            }
            Some(result) = executions.join_next() => {
                if let Err(err) = result {
                    if err.is_panic() {
                        warn!(error = %err, "execution pass panicked");
                    }
                }
            }
        }
    }

    drain(&inner, &mut executions).await;
    debug!("dispatch loop stopped");
}

fn arm_slot(timers: &mut [Option<Pin<Box<Sleep>>>], slot: usize, delay: Duration) {
    match timers.get_mut(slot) {
        Some(entry) => *entry = Some(Box::pin(tokio::time::sleep(delay))),
        None => warn!(slot, "arm request for unknown slot"),
    }
}

/// Resolves with the index of the first expired timer. Pending while no
/// armed timer has fired.
async fn next_fired(timers: &mut [Option<Pin<Box<Sleep>>>]) -> usize {
    poll_fn(|cx| {
        for (slot, entry) in timers.iter_mut().enumerate() {
            if let Some(sleep) = entry.as_mut() {
                if sleep.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(slot);
                }
            }
        }
        Poll::Pending
    })
    .await
}

async fn launch(inner: &Arc<EngineInner>, executions: &mut JoinSet<()>, slot: usize) {
    let Some(def) = inner.registry.by_slot(slot) else {
        warn!(slot, "timer fired for unknown slot");
        return;
    };
    if def.internal {
        // the sweep enqueues itself through the normal job path
        if let Err(err) = retention::ensure_sweep_job(inner).await {
            warn!(error = %err, "could not enqueue retention sweep");
            inner.arm(slot, inner.next_retention_delay());
            return;
        }
    }
    executions.spawn(execute::run_slot(Arc::clone(inner), slot));
}

/// Wait out in-flight executions under the shutdown grace period. Past the
/// deadline, still-running jobs go back to `Queueing` so the next process
/// resumes them, and their tasks are aborted.
async fn drain(inner: &Arc<EngineInner>, executions: &mut JoinSet<()>) {
    if executions.is_empty() {
        return;
    }
    let grace = inner.config.shutdown_grace;
    info!(
        in_flight = executions.len(),
        grace_secs = grace.as_secs(),
        "waiting for in-flight jobs"
    );
    let capacity = inner.config.max_concurrency.max(1) as u32;
    let idle = inner.semaphore.clone().acquire_many_owned(capacity);
    match timeout(grace, idle).await {
        Ok(Ok(_all_permits)) => info!("all in-flight jobs finished"),
        Ok(Err(_closed)) => warn!("execution semaphore closed during drain"),
        Err(_elapsed) => {
            warn!("shutdown grace expired, aborting remaining jobs");
            revert_incomplete(inner).await;
            executions.abort_all();
        }
    }
    while executions.join_next().await.is_some() {}
}

/// Put every locally running job back in `Queueing` and release its lock
async fn revert_incomplete(inner: &Arc<EngineInner>) {
    let ids: Vec<JobId> = inner.active.read().keys().cloned().collect();
    for id in ids {
        let patch = JobPatch {
            status: Some(JobStatus::Queueing),
            ..Default::default()
        };
        let guard = JobFilter::new()
            .with_job_id(id.clone())
            .with_statuses(vec![JobStatus::Retrying]);
        match inner.store.update_job(&guard, &patch, &[]).await {
            Ok(outcome) if outcome.affected > 0 => {
                warn!(job_id = %id, "incomplete job requeued for recovery");
                match inner.store.find_job_by_id(&id).await {
                    Ok(Some(job)) => {
                        if let Err(err) = inner.queue.push_job(&job.task_name, &id).await {
                            warn!(job_id = %id, error = %err, "requeue push failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(job_id = %id, error = %err, "requeue lookup failed"),
                }
                if let Err(err) = inner.locker.unlock(&inner.lock_key(&id)).await {
                    warn!(job_id = %id, error = %err, "lock release failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(job_id = %id, error = %err, "revert failed"),
        }
    }
}
