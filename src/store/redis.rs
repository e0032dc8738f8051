use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::warn;

use crate::config::ConfigEntry;
use crate::error::EngineResult;
use crate::store::{JobPatch, JobStore, SummaryPatch, SummaryStore, UpdateOutcome};
use crate::types::{Job, JobFilter, JobId, JobStatus, RetryHistory, SummaryFilter, TaskSummary};

/// Document-style store over Redis.
///
/// One JSON document per job under `{ns}:job:{id}`, with membership indexes
/// kept alongside: a per-task sorted set scored by `created_at` for ordered
/// scans, and per-(task, status) sets for counting. Summary counters live in
/// per-task hashes maintained with HINCRBY; job writes and summary writes are
/// two separate best-effort operations, not a transaction. Free-text search
/// is evaluated over candidate documents after fetch.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: &str) -> EngineResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::with_manager(manager, namespace))
    }

    /// Reuse an existing connection manager (shared with a queue or locker)
    pub fn with_manager(manager: ConnectionManager, namespace: &str) -> Self {
        Self {
            manager,
            namespace: namespace.to_string(),
        }
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.namespace)
    }

    fn created_key(&self, task_name: &str) -> String {
        format!("{}:idx:created:{}", self.namespace, task_name)
    }

    fn status_key(&self, task_name: &str, status: JobStatus) -> String {
        format!("{}:idx:status:{}:{}", self.namespace, task_name, status.as_str())
    }

    fn summary_key(&self, task_name: &str) -> String {
        format!("{}:summary:{}", self.namespace, task_name)
    }

    fn configs_key(&self) -> String {
        format!("{}:configs", self.namespace)
    }

    /// Task names relevant to a job filter, consulting the known-task set
    /// when the filter does not pin them down
    async fn relevant_tasks(&self, filter: &JobFilter) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = if let Some(name) = &filter.task_name {
            vec![name.clone()]
        } else if let Some(names) = &filter.task_names {
            names.clone()
        } else {
            let mut con = self.manager.clone();
            con.smembers(self.tasks_key()).await?
        };
        if let Some(excluded) = &filter.exclude_task_names {
            names.retain(|name| !excluded.iter().any(|e| e == name));
        }
        names.sort();
        Ok(names)
    }

    /// Fetch and parse documents for the given ids, skipping corrupt entries
    async fn fetch_jobs(&self, ids: &[JobId]) -> EngineResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
        let mut con = self.manager.clone();
        let raw: Vec<Option<String>> = con.mget(keys).await?;
        let mut jobs = Vec::with_capacity(raw.len());
        for (id, doc) in ids.iter().zip(raw) {
            let Some(doc) = doc else { continue };
            match serde_json::from_str::<Job>(&doc) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!(job_id = %id, error = %err, "skipping unreadable job document"),
            }
        }
        Ok(jobs)
    }

    /// All matching jobs, newest first, pagination not yet applied
    async fn scan_matching(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        if let Some(id) = &filter.job_id {
            let jobs = self.fetch_jobs(std::slice::from_ref(id)).await?;
            return Ok(jobs.into_iter().filter(|job| filter.matches(job)).collect());
        }

        let mut jobs: Vec<Job> = Vec::new();
        for task_name in self.relevant_tasks(filter).await? {
            let mut con = self.manager.clone();
            let ids: Vec<String> = con.zrevrange(self.created_key(&task_name), 0, -1).await?;
            let ids: Vec<JobId> = ids.into_iter().map(JobId::from).collect();
            let fetched = self.fetch_jobs(&ids).await?;
            jobs.extend(fetched.into_iter().filter(|job| filter.matches(job)));
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Whether the filter can be answered from the membership indexes alone
    fn countable_from_indexes(filter: &JobFilter) -> bool {
        filter.job_id.is_none() && filter.search.is_none() && filter.before_created_at.is_none()
    }

    async fn write_job_doc(&self, job: &Job) -> EngineResult<()> {
        let doc = serde_json::to_string(job)?;
        let mut con = self.manager.clone();
        con.set::<_, _, ()>(self.job_key(&job.id), doc).await?;
        Ok(())
    }

    async fn remove_job_indexes(&self, job: &Job) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.zrem::<_, _, ()>(self.created_key(&job.task_name), job.id.as_str())
            .await?;
        con.srem::<_, _, ()>(
            self.status_key(&job.task_name, job.status),
            job.id.as_str(),
        )
        .await?;
        Ok(())
    }

    async fn read_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>> {
        let mut con = self.manager.clone();
        let fields: HashMap<String, String> = con.hgetall(self.summary_key(task_name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut summary = TaskSummary::new(task_name);
        for status in JobStatus::ALL {
            if let Some(value) = fields.get(status.as_str()) {
                summary.set(status, value.parse().unwrap_or(0));
            }
        }
        summary.is_loading = fields.get("loading").map(|v| v == "1").unwrap_or(false);
        Ok(Some(summary))
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl SummaryStore for RedisStore {
    async fn find_all_summary(&self, filter: &SummaryFilter) -> EngineResult<Vec<TaskSummary>> {
        let mut con = self.manager.clone();
        let mut names: Vec<String> = con.smembers(self.tasks_key()).await?;
        names.sort();

        let mut summaries = Vec::new();
        for name in names {
            if !filter.matches(&name) {
                continue;
            }
            if let Some(summary) = self.read_summary(&name).await? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    async fn find_detail_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>> {
        self.read_summary(task_name).await
    }

    async fn update_summary(&self, task_name: &str, patch: &SummaryPatch) -> EngineResult<()> {
        let mut pairs: Vec<(&str, String)> = Vec::new();
        if let Some(v) = patch.queueing {
            pairs.push((JobStatus::Queueing.as_str(), v.to_string()));
        }
        if let Some(v) = patch.retrying {
            pairs.push((JobStatus::Retrying.as_str(), v.to_string()));
        }
        if let Some(v) = patch.success {
            pairs.push((JobStatus::Success.as_str(), v.to_string()));
        }
        if let Some(v) = patch.failure {
            pairs.push((JobStatus::Failure.as_str(), v.to_string()));
        }
        if let Some(v) = patch.stopped {
            pairs.push((JobStatus::Stopped.as_str(), v.to_string()));
        }
        if let Some(v) = patch.is_loading {
            pairs.push(("loading", if v { "1" } else { "0" }.to_string()));
        }
        if pairs.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        con.sadd::<_, _, ()>(self.tasks_key(), task_name).await?;
        con.hset_multiple::<_, _, _, ()>(self.summary_key(task_name), &pairs)
            .await?;
        Ok(())
    }

    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[(JobStatus, i64)],
    ) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.sadd::<_, _, ()>(self.tasks_key(), task_name).await?;
        for (status, delta) in deltas {
            let _: i64 = con
                .hincr(self.summary_key(task_name), status.as_str(), *delta)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn save_job(&self, job: &Job) -> EngineResult<()> {
        self.write_job_doc(job).await?;

        let mut con = self.manager.clone();
        con.sadd::<_, _, ()>(self.tasks_key(), &job.task_name).await?;
        con.zadd::<_, _, _, ()>(
            self.created_key(&job.task_name),
            job.id.as_str(),
            job.created_at.timestamp_millis(),
        )
        .await?;
        con.sadd::<_, _, ()>(
            self.status_key(&job.task_name, job.status),
            job.id.as_str(),
        )
        .await?;

        self.increment_summary(&job.task_name, &[(job.status, 1)]).await
    }

    async fn update_job(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
        histories: &[RetryHistory],
    ) -> EngineResult<UpdateOutcome> {
        let matching = self.scan_matching(filter).await?;
        let matched = matching.len() as u64;
        let mut affected = 0u64;

        for mut job in matching {
            let old_status = job.status;
            patch.apply_to(&mut job);
            job.retry_histories.extend_from_slice(histories);
            self.write_job_doc(&job).await?;

            if job.status != old_status {
                let mut con = self.manager.clone();
                con.srem::<_, _, ()>(
                    self.status_key(&job.task_name, old_status),
                    job.id.as_str(),
                )
                .await?;
                con.sadd::<_, _, ()>(
                    self.status_key(&job.task_name, job.status),
                    job.id.as_str(),
                )
                .await?;
                self.increment_summary(
                    &job.task_name,
                    &[(old_status, -1), (job.status, 1)],
                )
                .await?;
            }
            affected += 1;
        }
        Ok(UpdateOutcome { matched, affected })
    }

    async fn find_job_by_id(&self, id: &JobId) -> EngineResult<Option<Job>> {
        Ok(self.fetch_jobs(std::slice::from_ref(id)).await?.pop())
    }

    async fn find_all_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let jobs = self.scan_matching(filter).await?;
        Ok(filter.paginate(jobs))
    }

    async fn count_all_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        if Self::countable_from_indexes(filter) {
            let mut total = 0usize;
            for task_name in self.relevant_tasks(filter).await? {
                let mut con = self.manager.clone();
                if filter.statuses.is_empty() {
                    let n: usize = con.zcard(self.created_key(&task_name)).await?;
                    total += n;
                } else {
                    for status in &filter.statuses {
                        let n: usize = con.scard(self.status_key(&task_name, *status)).await?;
                        total += n;
                    }
                }
            }
            return Ok(total);
        }
        Ok(self.scan_matching(filter).await?.len())
    }

    async fn aggregate_all_task_jobs(
        &self,
        filter: &JobFilter,
    ) -> EngineResult<Vec<TaskSummary>> {
        let mut summaries = Vec::new();
        for task_name in self.relevant_tasks(filter).await? {
            let mut con = self.manager.clone();
            let mut summary = TaskSummary::new(&task_name);
            for status in JobStatus::ALL {
                let n: i64 = con.scard(self.status_key(&task_name, status)).await?;
                summary.set(status, n);
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }

    async fn clean_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        let matching = self.scan_matching(filter).await?;
        let mut cleaned = 0usize;
        for job in matching {
            let mut con = self.manager.clone();
            con.del::<_, ()>(self.job_key(&job.id)).await?;
            self.remove_job_indexes(&job).await?;
            self.increment_summary(&job.task_name, &[(job.status, -1)]).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }

    async fn delete_job(&self, id: &JobId) -> EngineResult<Option<Job>> {
        let Some(job) = self.find_job_by_id(id).await? else {
            return Ok(None);
        };
        let mut con = self.manager.clone();
        con.del::<_, ()>(self.job_key(id)).await?;
        self.remove_job_indexes(&job).await?;
        self.increment_summary(&job.task_name, &[(job.status, -1)]).await?;
        Ok(Some(job))
    }

    async fn find_configuration(&self, key: &str) -> EngineResult<Option<ConfigEntry>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con.hget(self.configs_key(), key).await?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    async fn set_configuration(&self, entry: &ConfigEntry) -> EngineResult<()> {
        let raw = serde_json::to_string(entry)?;
        let mut con = self.manager.clone();
        con.hset::<_, _, _, ()>(self.configs_key(), &entry.key, raw)
            .await?;
        Ok(())
    }

    async fn list_configurations(&self) -> EngineResult<Vec<ConfigEntry>> {
        let mut con = self.manager.clone();
        let raw: HashMap<String, String> = con.hgetall(self.configs_key()).await?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_str::<ConfigEntry>(&value) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(%key, error = %err, "skipping unreadable configuration entry"),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
