//! Engine assembly and public operations.
//!
//! The [`Engine`] is a cheap clone over shared state. [`EngineBuilder`] wires
//! the queue, store and locker backends together with the registered task
//! handlers; [`Engine::start`] runs the startup sequence (lock reset, settings
//! seed, queue rehydration) and spawns the dispatch loop plus the subscriber
//! forwarder, returning a [`WorkerHandle`] that owns graceful shutdown.

pub(crate) mod dispatch;
mod execute;
pub(crate) mod retention;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    default_entries, ConfigEntry, EngineConfig, RuntimeSettings, RETENTION_SCHEDULE_KEY,
};
use crate::engine::dispatch::DispatchCommand;
use crate::error::{EngineError, EngineResult};
use crate::handler::WorkerHandler;
use crate::lock::{Locker, NoopLocker};
use crate::queue::{MemoryQueue, TaskQueue};
use crate::registry::TaskRegistry;
use crate::store::{JobPatch, JobStore, MemoryStore, SummaryPatch, SummaryStore};
use crate::subscription::SubscriberHub;
use crate::types::{
    EngineEvent, EnginePush, Job, JobFilter, JobId, JobStatus, SubscriberId, SummaryFilter,
    TaskSummary,
};

/// Events buffered on the internal broadcast channel before old ones drop
const EVENT_BUFFER: usize = 256;
/// How often the forwarder sweeps for idle subscribers
const SUBSCRIBER_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// One enqueue request: which task, with what payload, retried how often
#[derive(Debug, Clone)]
pub struct AddJobRequest {
    pub task_name: String,
    pub max_retry: u32,
    /// JSON argument payload handed to the handler
    pub args: String,
    /// Delay before the first run; engine default when absent
    pub interval: Option<Duration>,
}

impl AddJobRequest {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            max_retry: 1,
            args: "{}".to_string(),
            interval: None,
        }
    }

    pub fn with_args<T: Serialize + ?Sized>(mut self, args: &T) -> EngineResult<Self> {
        self.args = serde_json::to_string(args)?;
        Ok(self)
    }

    /// Pass a payload that is already JSON
    pub fn with_raw_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

pub(crate) struct EngineInner {
    pub(crate) queue: Arc<dyn TaskQueue>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) locker: Arc<dyn Locker>,
    pub(crate) config: EngineConfig,
    pub(crate) registry: TaskRegistry,
    pub(crate) settings: RwLock<RuntimeSettings>,
    pub(crate) hub: SubscriberHub,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    pub(crate) root_token: CancellationToken,
    pub(crate) semaphore: Arc<Semaphore>,
    /// Cancellation tokens of attempts running in this process
    pub(crate) active: RwLock<HashMap<JobId, CancellationToken>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchCommand>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatchCommand>>>,
    started: AtomicBool,
}

impl EngineInner {
    pub(crate) fn lock_key(&self, id: &JobId) -> String {
        format!("{}:lock:{}", self.config.namespace, id)
    }

    /// Ask the dispatch loop to (re)arm a slot. Send failure means the loop
    /// is gone, which only happens during shutdown.
    pub(crate) fn arm(&self, slot: usize, delay: Duration) {
        let _ = self.dispatch_tx.send(DispatchCommand::Arm { slot, delay });
    }

    /// Time until the next retention sweep per the configured cron schedule
    pub(crate) fn next_retention_delay(&self) -> Duration {
        let schedule = self.settings.read().retention_schedule.clone();
        match schedule.upcoming(Utc).next() {
            Some(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            // a schedule without future occurrences; check again tomorrow
            None => Duration::from_secs(24 * 3_600),
        }
    }

    /// Summaries in registry order with internal tasks hidden; tasks known
    /// only to the store (historical) follow alphabetically
    pub(crate) async fn task_summaries_inner(&self) -> EngineResult<Vec<TaskSummary>> {
        let filter =
            SummaryFilter::new().with_exclude_task_names(self.registry.internal_task_names());
        let stored = self.store.find_all_summary(&filter).await?;
        let mut by_name: HashMap<String, TaskSummary> = stored
            .into_iter()
            .map(|summary| (summary.task_name.clone(), summary))
            .collect();

        let mut ordered = Vec::with_capacity(by_name.len());
        for name in self.registry.visible_task_names() {
            ordered.push(
                by_name
                    .remove(&name)
                    .unwrap_or_else(|| TaskSummary::new(&name)),
            );
        }
        let mut leftovers: Vec<TaskSummary> = by_name.into_values().collect();
        leftovers.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        ordered.extend(leftovers);
        Ok(ordered)
    }

    /// Bulk delete with the loading-flag protocol: mark affected summaries
    /// loading, delete, recount from the aggregate query, clear the flag
    pub(crate) async fn clean_jobs_filtered(&self, filter: &JobFilter) -> EngineResult<usize> {
        let scope = self.scope_tasks(filter).await?;
        for task_name in &scope {
            self.store
                .update_summary(task_name, &SummaryPatch::loading(true))
                .await?;
        }
        self.push_summaries().await;

        let removed = self.store.clean_jobs(filter).await?;

        let recount_filter = JobFilter::new().with_task_names(scope.clone());
        let aggregated = self.store.aggregate_all_task_jobs(&recount_filter).await?;
        let counted: HashMap<&str, &TaskSummary> = aggregated
            .iter()
            .map(|summary| (summary.task_name.as_str(), summary))
            .collect();
        for task_name in &scope {
            let counts = counted
                .get(task_name.as_str())
                .map(|summary| (*summary).clone())
                .unwrap_or_else(|| TaskSummary::new(task_name));
            self.store
                .update_summary(
                    task_name,
                    &SummaryPatch::from_counts(&counts).with_loading(false),
                )
                .await?;
        }
        info!(removed, "cleaned jobs");

        self.push_summaries().await;
        self.push_job_lists().await;
        Ok(removed)
    }

    /// Task names a clean operation touches
    async fn scope_tasks(&self, filter: &JobFilter) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = if let Some(name) = &filter.task_name {
            vec![name.clone()]
        } else if let Some(names) = &filter.task_names {
            names.clone()
        } else {
            let mut known: Vec<String> = self
                .store
                .find_all_summary(&SummaryFilter::default())
                .await?
                .into_iter()
                .map(|summary| summary.task_name)
                .collect();
            for def in self.registry.iter() {
                if !known.contains(&def.name) {
                    known.push(def.name.clone());
                }
            }
            known
        };
        if let Some(excluded) = &filter.exclude_task_names {
            names.retain(|name| !excluded.contains(name));
        }
        Ok(names)
    }

    pub(crate) async fn push_summaries(&self) {
        if self.hub.is_empty() {
            return;
        }
        match self.task_summaries_inner().await {
            Ok(summaries) => {
                for (id, _) in self.hub.snapshot() {
                    self.hub.send(&id, EnginePush::Summaries(summaries.clone()));
                }
            }
            Err(err) => warn!(error = %err, "summary push failed"),
        }
    }

    pub(crate) async fn push_job_lists(&self) {
        for (id, filter) in self.hub.snapshot() {
            let page = tokio::try_join!(
                self.store.find_all_jobs(&filter),
                self.store.count_all_jobs(&filter)
            );
            match page {
                Ok((jobs, total_count)) => {
                    self.hub.send(&id, EnginePush::JobList { jobs, total_count });
                }
                Err(err) => warn!(subscriber = %id, error = %err, "job list push failed"),
            }
        }
    }
}

impl fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInner")
            .field("config", &self.config)
            .field("tasks", &self.registry.len())
            .finish()
    }
}

/// Builds an [`Engine`] from backends and task registrations
pub struct EngineBuilder {
    queue: Option<Arc<dyn TaskQueue>>,
    store: Option<Arc<dyn JobStore>>,
    locker: Option<Arc<dyn Locker>>,
    config: EngineConfig,
    registry: TaskRegistry,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            queue: None,
            store: None,
            locker: None,
            config: EngineConfig::default(),
            registry: TaskRegistry::new(),
        }
    }

    pub fn queue(mut self, queue: impl TaskQueue + 'static) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    pub fn store(mut self, store: impl JobStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn locker(mut self, locker: impl Locker + 'static) -> Self {
        self.locker = Some(Arc::new(locker));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a task handler. Slot order follows registration order.
    pub fn register_task(
        mut self,
        name: impl Into<String>,
        handler: WorkerHandler,
    ) -> EngineResult<Self> {
        self.registry.register(name, handler, false)?;
        Ok(self)
    }

    /// Assemble the engine. In-memory queue/store and the no-op locker fill
    /// any backend not provided; the retention task takes the last slot.
    pub fn build(self) -> EngineResult<Engine> {
        if self.registry.contains(retention::RETENTION_TASK) {
            return Err(EngineError::DuplicateTask(
                retention::RETENTION_TASK.to_string(),
            ));
        }
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryQueue::new()) as Arc<dyn TaskQueue>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn JobStore>);
        let locker = self
            .locker
            .unwrap_or_else(|| Arc::new(NoopLocker::new()) as Arc<dyn Locker>);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let settings = RuntimeSettings::default();
        let hub = SubscriberHub::new(&settings);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut registry = self.registry;
        let config = self.config;

        let inner = Arc::new_cyclic(|weak| {
            // cannot collide: checked above
            let _ = registry.register(
                retention::RETENTION_TASK,
                retention::sweep_handler(weak.clone()),
                true,
            );
            EngineInner {
                queue,
                store,
                locker,
                config,
                registry,
                settings: RwLock::new(settings),
                hub,
                events,
                root_token: CancellationToken::new(),
                semaphore,
                active: RwLock::new(HashMap::new()),
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
                started: AtomicBool::new(false),
            }
        });
        Ok(Engine { inner })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("tasks", &self.registry.len())
            .finish()
    }
}

/// Handle returned by [`Engine::start`]; owns the background loops
#[derive(Debug)]
pub struct WorkerHandle {
    inner: Arc<EngineInner>,
    dispatch: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop accepting work, cancel handler contexts, and wait for in-flight
    /// executions under the configured grace period. Jobs still running when
    /// it expires are reverted to `Queueing` for the next process to resume.
    pub async fn shutdown(self) {
        info!("engine shutdown requested");
        self.inner.root_token.cancel();
        if let Err(err) = self.dispatch.await {
            warn!(error = %err, "dispatch loop ended abnormally");
        }
        if let Err(err) = self.forwarder.await {
            warn!(error = %err, "subscriber forwarder ended abnormally");
        }
        info!("engine stopped");
    }
}

/// The task-queue worker engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Run the startup sequence and spawn the background loops.
    ///
    /// Order matters: stale locks from a dead process are cleared first,
    /// persisted settings are seeded and loaded, then every task's queue is
    /// rehydrated from the store's `Queueing` scan (enqueue order) before the
    /// dispatch loop starts consuming.
    pub async fn start(&self) -> EngineResult<WorkerHandle> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        let Some(dispatch_rx) = inner.dispatch_rx.lock().take() else {
            return Err(EngineError::AlreadyStarted);
        };
        info!(
            tasks = inner.registry.len(),
            max_concurrency = inner.config.max_concurrency,
            "engine starting"
        );

        let lock_pattern = format!("{}:lock:*", inner.config.namespace);
        inner.locker.reset(&lock_pattern).await?;

        for entry in default_entries() {
            if inner.store.find_configuration(&entry.key).await?.is_none() {
                inner.store.set_configuration(&entry).await?;
            }
        }
        let stored = inner.store.list_configurations().await?;
        {
            let mut settings = inner.settings.write();
            for entry in stored.iter().filter(|entry| entry.is_active) {
                if let Err(err) = settings.apply(&entry.key, &entry.value) {
                    warn!(key = %entry.key, error = %err, "ignoring bad persisted setting");
                }
            }
        }
        inner.hub.apply_settings(&inner.settings.read());

        for def in inner.registry.iter() {
            if def.internal {
                continue;
            }
            let filter = JobFilter::new()
                .with_task_name(&def.name)
                .with_statuses(vec![JobStatus::Queueing]);
            let mut pending = inner.store.find_all_jobs(&filter).await?;
            if pending.is_empty() {
                continue;
            }
            pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            let queued: HashSet<JobId> = inner
                .queue
                .get_all_jobs(&def.name)
                .await?
                .into_iter()
                .collect();
            let mut restored = 0;
            for job in &pending {
                if !queued.contains(&job.id) {
                    inner.queue.push_job(&def.name, &job.id).await?;
                    restored += 1;
                }
            }
            if restored > 0 {
                info!(task = %def.name, restored, "requeued persisted jobs");
            }
            let delay = pending
                .first()
                .and_then(|job| job.interval_duration().ok())
                .unwrap_or(inner.config.default_interval);
            inner.arm(def.slot, delay);
        }

        if let Some(def) = inner.registry.get(retention::RETENTION_TASK) {
            inner.arm(def.slot, inner.next_retention_delay());
        }

        let dispatch = tokio::spawn(dispatch::run(Arc::clone(inner), dispatch_rx));
        let forwarder = tokio::spawn(run_forwarder(Arc::clone(inner), inner.events.subscribe()));
        Ok(WorkerHandle {
            inner: Arc::clone(inner),
            dispatch,
            forwarder,
        })
    }

    /// Enqueue a job for a registered task
    pub async fn add_job(&self, request: AddJobRequest) -> EngineResult<Job> {
        let inner = &self.inner;
        let slot = match inner.registry.get(&request.task_name) {
            Some(def) if !def.internal => def.slot,
            _ => return Err(EngineError::TaskNotFound(request.task_name.clone())),
        };
        if request.max_retry == 0 {
            return Err(EngineError::InvalidMaxRetry(0));
        }
        let interval = request.interval.unwrap_or(inner.config.default_interval);
        let job = Job::new(&request.task_name, request.args, request.max_retry, interval);

        inner.store.save_job(&job).await?;
        inner.queue.push_job(&job.task_name, &job.id).await?;
        inner.arm(slot, interval);

        debug!(job_id = %job.id, task = %job.task_name, "job enqueued");
        let _ = inner.events.send(EngineEvent::JobEnqueued { job: job.clone() });
        Ok(job)
    }

    /// Re-activate a terminal or stuck job: back to `Queueing` with at least
    /// one attempt remaining, pushed and armed to run promptly
    pub async fn retry_job(&self, id: &JobId) -> EngineResult<Job> {
        let inner = &self.inner;
        let job = inner
            .store
            .find_job_by_id(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        if job.status == JobStatus::Queueing {
            return Ok(job);
        }
        let slot = inner
            .registry
            .get(&job.task_name)
            .map(|def| def.slot)
            .ok_or_else(|| EngineError::TaskNotFound(job.task_name.clone()))?;

        let mut patch = JobPatch {
            status: Some(JobStatus::Queueing),
            error: Some(String::new()),
            finished_at: Some(None),
            ..Default::default()
        };
        if job.retries >= job.max_retry {
            patch.max_retry = Some(job.retries + 1);
        }
        let guard = JobFilter::new()
            .with_job_id(id.clone())
            .with_statuses(vec![job.status]);
        let outcome = inner.store.update_job(&guard, &patch, &[]).await?;
        if outcome.affected == 0 {
            return Err(EngineError::Internal(format!(
                "job {id} changed state during retry"
            )));
        }

        inner.queue.push_job(&job.task_name, id).await?;
        inner.arm(slot, Duration::ZERO);

        let updated = inner
            .store
            .find_job_by_id(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        info!(job_id = %id, task = %updated.task_name, "job requeued by operator");
        let _ = inner
            .events
            .send(EngineEvent::JobEnqueued { job: updated.clone() });
        Ok(updated)
    }

    /// Stop a job: a running one is cancelled cooperatively (it finalizes as
    /// `Stopped`), a queued one is marked `Stopped` directly, a terminal one
    /// is left untouched
    pub async fn stop_job(&self, id: &JobId) -> EngineResult<Job> {
        let inner = &self.inner;

        let token = inner.active.read().get(id).cloned();
        if let Some(token) = token {
            token.cancel();
            info!(job_id = %id, "cancellation requested for running job");
            return inner
                .store
                .find_job_by_id(id)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(id.to_string()));
        }

        let job = inner
            .store
            .find_job_by_id(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        match job.status {
            JobStatus::Queueing => {
                let patch = JobPatch {
                    status: Some(JobStatus::Stopped),
                    error: Some("stopped before execution".to_string()),
                    finished_at: Some(Some(Utc::now())),
                    ..Default::default()
                };
                let guard = JobFilter::new()
                    .with_job_id(id.clone())
                    .with_statuses(vec![JobStatus::Queueing]);
                let outcome = inner.store.update_job(&guard, &patch, &[]).await?;
                if outcome.affected == 0 {
                    // raced into execution between our read and the update
                    let token = inner.active.read().get(id).cloned();
                    if let Some(token) = token {
                        token.cancel();
                    }
                }
                let updated = inner
                    .store
                    .find_job_by_id(id)
                    .await?
                    .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
                if outcome.affected > 0 {
                    info!(job_id = %id, "queued job stopped");
                    let _ = inner
                        .events
                        .send(EngineEvent::JobFinished { job: updated.clone() });
                }
                Ok(updated)
            }
            JobStatus::Retrying => Err(EngineError::Internal(format!(
                "job {id} is running on another worker or stuck; retry_job requeues a stuck job"
            ))),
            _ => Ok(job),
        }
    }

    /// Delete the task's terminal jobs, then rebuild its summary from a
    /// recount. Returns the number of jobs removed.
    pub async fn clean_jobs(&self, task_name: &str) -> EngineResult<usize> {
        let filter = JobFilter::new().with_task_name(task_name).with_statuses(vec![
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::Stopped,
        ]);
        self.inner.clean_jobs_filtered(&filter).await
    }

    pub async fn get_job(&self, id: &JobId) -> EngineResult<Job> {
        self.inner
            .store
            .find_job_by_id(id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        self.inner.store.find_all_jobs(filter).await
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        self.inner.store.count_all_jobs(filter).await
    }

    /// Counters per visible task, in registration order
    pub async fn task_summaries(&self) -> EngineResult<Vec<TaskSummary>> {
        self.inner.task_summaries_inner().await
    }

    /// Register a dashboard subscriber and deliver its initial snapshot
    pub async fn subscribe(
        &self,
        filter: JobFilter,
    ) -> EngineResult<(SubscriberId, mpsc::Receiver<EnginePush>)> {
        let inner = &self.inner;
        let (id, rx) = inner.hub.register(filter.clone())?;

        match inner.task_summaries_inner().await {
            Ok(summaries) => {
                inner.hub.send(&id, EnginePush::Summaries(summaries));
            }
            Err(err) => warn!(error = %err, "initial summary snapshot failed"),
        }
        let page = tokio::try_join!(
            inner.store.find_all_jobs(&filter),
            inner.store.count_all_jobs(&filter)
        );
        match page {
            Ok((jobs, total_count)) => {
                inner.hub.send(&id, EnginePush::JobList { jobs, total_count });
            }
            Err(err) => warn!(error = %err, "initial job list snapshot failed"),
        }
        info!(subscriber = %id, "dashboard subscriber registered");
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.inner.hub.unregister(id)
    }

    /// Change the page a subscriber is watching; pushes a fresh list.
    /// Returns false when the subscriber is no longer registered.
    pub async fn update_subscription(&self, id: &SubscriberId, filter: JobFilter) -> bool {
        let inner = &self.inner;
        if !inner.hub.set_filter(id, filter.clone()) {
            return false;
        }
        let page = tokio::try_join!(
            inner.store.find_all_jobs(&filter),
            inner.store.count_all_jobs(&filter)
        );
        match page {
            Ok((jobs, total_count)) => {
                inner.hub.send(id, EnginePush::JobList { jobs, total_count })
            }
            Err(err) => {
                warn!(subscriber = %id, error = %err, "job list refresh failed");
                true
            }
        }
    }

    /// Validate, persist and apply one runtime setting
    pub async fn set_configuration(&self, key: &str, value: &str) -> EngineResult<ConfigEntry> {
        let inner = &self.inner;
        let mut candidate = inner.settings.read().clone();
        candidate.apply(key, value)?;

        // apply() already rejected unknown keys
        let name = default_entries()
            .into_iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.name)
            .unwrap_or_else(|| key.to_string());
        let entry = ConfigEntry::new(key, name, value);
        inner.store.set_configuration(&entry).await?;

        *inner.settings.write() = candidate;
        inner.hub.apply_settings(&inner.settings.read());
        if key == RETENTION_SCHEDULE_KEY {
            if let Some(def) = inner.registry.get(retention::RETENTION_TASK) {
                inner.arm(def.slot, inner.next_retention_delay());
            }
        }
        info!(key, value, "configuration updated");
        Ok(entry)
    }

    pub async fn configurations(&self) -> EngineResult<Vec<ConfigEntry>> {
        self.inner.store.list_configurations().await
    }

    /// Subscribe to raw engine lifecycle events.
    ///
    /// A slow consumer loses the oldest buffered events; gaps are dropped
    /// from the stream silently. Dashboards that need consistent totals
    /// should use [`Engine::subscribe`] instead.
    pub fn event_stream(&self) -> BoxStream<'static, EngineEvent> {
        let receiver = self.inner.events.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| result.ok()))
    }

    /// Registered task names visible to callers
    pub fn task_names(&self) -> Vec<String> {
        self.inner.registry.visible_task_names()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").field("inner", &self.inner).finish()
    }
}

/// Fan engine events out to dashboard subscribers, re-querying the store per
/// subscriber filter, and sweep idle subscribers
async fn run_forwarder(
    inner: Arc<EngineInner>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    let mut sweep = tokio::time::interval(SUBSCRIBER_SWEEP_PERIOD);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("subscriber forwarder running");
    loop {
        tokio::select! {
            _ = inner.root_token.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = inner.hub.evict_idle();
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "evicted idle subscribers");
                }
            }
            event = events.recv() => match event {
                Ok(event) => forward_event(&inner, event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber forwarder lagged, refreshing");
                    inner.push_summaries().await;
                    inner.push_job_lists().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("subscriber forwarder stopped");
}

async fn forward_event(inner: &Arc<EngineInner>, event: EngineEvent) {
    if inner.hub.is_empty() {
        return;
    }
    match &event {
        // progress only refreshes detail views; list churn would be noise
        EngineEvent::JobProgress { job_id, .. } => push_job_detail(inner, job_id).await,
        _ => {
            inner.push_summaries().await;
            inner.push_job_lists().await;
            push_job_detail(inner, event.job_id()).await;
        }
    }
}

async fn push_job_detail(inner: &Arc<EngineInner>, job_id: &JobId) {
    let watchers: Vec<SubscriberId> = inner
        .hub
        .snapshot()
        .into_iter()
        .filter(|(_, filter)| filter.job_id.as_ref() == Some(job_id))
        .map(|(id, _)| id)
        .collect();
    if watchers.is_empty() {
        return;
    }
    match inner.store.find_job_by_id(job_id).await {
        Ok(Some(job)) => {
            for id in &watchers {
                inner.hub.send(id, EnginePush::JobDetail(job.clone()));
            }
        }
        Ok(None) => {}
        Err(err) => warn!(job_id = %job_id, error = %err, "job detail push failed"),
    }
}
