use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::ConfigEntry;
use crate::error::EngineResult;
use crate::store::{JobPatch, JobStore, SummaryPatch, SummaryStore, UpdateOutcome};
use crate::types::{Job, JobFilter, JobId, JobStatus, RetryHistory, SummaryFilter, TaskSummary};

/// Full-contract in-memory store.
///
/// Volatile: everything is lost on restart. This is the default backend for
/// development and tests, and the reference semantics the durable backends
/// are held to. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: RwLock<HashMap<JobId, Job>>,
    summaries: RwLock<BTreeMap<String, TaskSummary>>,
    configs: RwLock<BTreeMap<String, ConfigEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, task_name: &str, status: JobStatus, delta: i64) {
        let mut summaries = self.state.summaries.write();
        summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name))
            .add(status, delta);
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn find_all_summary(&self, filter: &SummaryFilter) -> EngineResult<Vec<TaskSummary>> {
        Ok(self
            .state
            .summaries
            .read()
            .values()
            .filter(|summary| filter.matches(&summary.task_name))
            .cloned()
            .collect())
    }

    async fn find_detail_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>> {
        Ok(self.state.summaries.read().get(task_name).cloned())
    }

    async fn update_summary(&self, task_name: &str, patch: &SummaryPatch) -> EngineResult<()> {
        let mut summaries = self.state.summaries.write();
        let summary = summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name));
        patch.apply_to(summary);
        Ok(())
    }

    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[(JobStatus, i64)],
    ) -> EngineResult<()> {
        let mut summaries = self.state.summaries.write();
        let summary = summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name));
        for (status, delta) in deltas {
            summary.add(*status, *delta);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> EngineResult<()> {
        self.state.jobs.write().insert(job.id.clone(), job.clone());
        self.bump(&job.task_name, job.status, 1);
        Ok(())
    }

    async fn update_job(
        &self,
        filter: &JobFilter,
        patch: &JobPatch,
        histories: &[RetryHistory],
    ) -> EngineResult<UpdateOutcome> {
        let mut deltas: Vec<(String, JobStatus, i64)> = Vec::new();
        let outcome = {
            let mut jobs = self.state.jobs.write();
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|job| filter.matches(job))
                .map(|job| job.id.clone())
                .collect();
            let matched = ids.len() as u64;
            let mut affected = 0u64;
            for id in ids {
                if let Some(job) = jobs.get_mut(&id) {
                    let old_status = job.status;
                    patch.apply_to(job);
                    job.retry_histories.extend_from_slice(histories);
                    if job.status != old_status {
                        deltas.push((job.task_name.clone(), old_status, -1));
                        deltas.push((job.task_name.clone(), job.status, 1));
                    }
                    affected += 1;
                }
            }
            UpdateOutcome { matched, affected }
        };
        for (task_name, status, delta) in deltas {
            self.bump(&task_name, status, delta);
        }
        Ok(outcome)
    }

    async fn find_job_by_id(&self, id: &JobId) -> EngineResult<Option<Job>> {
        Ok(self.state.jobs.read().get(id).cloned())
    }

    async fn find_all_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .jobs
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(filter.paginate(jobs))
    }

    async fn count_all_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        Ok(self
            .state
            .jobs
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .count())
    }

    async fn aggregate_all_task_jobs(
        &self,
        filter: &JobFilter,
    ) -> EngineResult<Vec<TaskSummary>> {
        let mut grouped: BTreeMap<String, TaskSummary> = BTreeMap::new();
        for job in self.state.jobs.read().values().filter(|job| filter.matches(job)) {
            grouped
                .entry(job.task_name.clone())
                .or_insert_with(|| TaskSummary::new(&job.task_name))
                .add(job.status, 1);
        }
        Ok(grouped.into_values().collect())
    }

    async fn clean_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        let mut deltas: Vec<(String, JobStatus, i64)> = Vec::new();
        let removed = {
            let mut jobs = self.state.jobs.write();
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|job| filter.matches(job))
                .map(|job| job.id.clone())
                .collect();
            for id in &ids {
                if let Some(job) = jobs.remove(id) {
                    deltas.push((job.task_name, job.status, -1));
                }
            }
            ids.len()
        };
        for (task_name, status, delta) in deltas {
            self.bump(&task_name, status, delta);
        }
        Ok(removed)
    }

    async fn delete_job(&self, id: &JobId) -> EngineResult<Option<Job>> {
        let removed = self.state.jobs.write().remove(id);
        if let Some(job) = &removed {
            self.bump(&job.task_name, job.status, -1);
        }
        Ok(removed)
    }

    async fn find_configuration(&self, key: &str) -> EngineResult<Option<ConfigEntry>> {
        Ok(self.state.configs.read().get(key).cloned())
    }

    async fn set_configuration(&self, entry: &ConfigEntry) -> EngineResult<()> {
        self.state.configs
            .write()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn list_configurations(&self) -> EngineResult<Vec<ConfigEntry>> {
        Ok(self.state.configs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn make_job(task: &str, status: JobStatus, age_mins: i64) -> Job {
        let mut job = Job::new(task, r#"{"n":1}"#, 3, Duration::from_secs(1));
        job.status = status;
        job.created_at = Utc::now() - ChronoDuration::minutes(age_mins);
        job
    }

    fn history(status: JobStatus) -> RetryHistory {
        RetryHistory {
            status,
            error: "timeout".into(),
            error_stack: String::new(),
            trace_id: "trace".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let store = MemoryStore::new();
        let job = make_job("emails", JobStatus::Queueing, 0);
        store.save_job(&job).await.unwrap();

        let found = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found, job);

        let summary = store.find_detail_summary("emails").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 1);
        assert_eq!(summary.total(), 1);
    }

    #[tokio::test]
    async fn update_moves_summary_buckets_and_appends_history() {
        let store = MemoryStore::new();
        let job = make_job("emails", JobStatus::Queueing, 0);
        store.save_job(&job).await.unwrap();

        let outcome = store
            .update_job(
                &JobFilter::new().with_job_id(job.id.clone()),
                &JobPatch {
                    status: Some(JobStatus::Retrying),
                    retries: Some(1),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 1, affected: 1 });

        let outcome = store
            .update_job(
                &JobFilter::new().with_job_id(job.id.clone()),
                &JobPatch {
                    status: Some(JobStatus::Failure),
                    error: Some("timeout".into()),
                    finished_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
                &[history(JobStatus::Failure)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.affected, 1);

        let found = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Failure);
        assert_eq!(found.retries, 1);
        assert_eq!(found.retry_histories.len(), 1);
        assert!(found.finished_at.is_some());

        let summary = store.find_detail_summary("emails").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 0);
        assert_eq!(summary.retrying, 0);
        assert_eq!(summary.failure, 1);
    }

    #[tokio::test]
    async fn status_guard_misses_stale_jobs() {
        let store = MemoryStore::new();
        let mut job = make_job("emails", JobStatus::Stopped, 0);
        job.finished_at = Some(Utc::now());
        store.save_job(&job).await.unwrap();

        // Guarded update: only fire for jobs still waiting in the queue
        let outcome = store
            .update_job(
                &JobFilter::new()
                    .with_job_id(job.id.clone())
                    .with_statuses(vec![JobStatus::Queueing]),
                &JobPatch {
                    status: Some(JobStatus::Retrying),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::default());
        let found = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn listing_is_newest_first_with_pages() {
        let store = MemoryStore::new();
        for age in [30, 20, 10] {
            store
                .save_job(&make_job("emails", JobStatus::Queueing, age))
                .await
                .unwrap();
        }

        let all = store.find_all_jobs(&JobFilter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at > all[1].created_at);
        assert!(all[1].created_at > all[2].created_at);

        let page = store
            .find_all_jobs(&JobFilter::new().with_page(2, 2))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);

        assert_eq!(store.count_all_jobs(&JobFilter::new()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn aggregate_recount_matches_incremental_counters() {
        let store = MemoryStore::new();
        store.save_job(&make_job("a", JobStatus::Queueing, 3)).await.unwrap();
        store.save_job(&make_job("a", JobStatus::Success, 2)).await.unwrap();
        store.save_job(&make_job("b", JobStatus::Failure, 1)).await.unwrap();

        let aggregated = store
            .aggregate_all_task_jobs(&JobFilter::new())
            .await
            .unwrap();
        let summaries = store
            .find_all_summary(&SummaryFilter::new())
            .await
            .unwrap();
        assert_eq!(aggregated, summaries);
    }

    #[tokio::test]
    async fn clean_deletes_and_decrements() {
        let store = MemoryStore::new();
        store.save_job(&make_job("a", JobStatus::Success, 3)).await.unwrap();
        store.save_job(&make_job("a", JobStatus::Failure, 2)).await.unwrap();
        store.save_job(&make_job("a", JobStatus::Queueing, 1)).await.unwrap();

        let cleaned = store
            .clean_jobs(&JobFilter::new().with_task_name("a").with_statuses(vec![
                JobStatus::Success,
                JobStatus::Failure,
                JobStatus::Stopped,
            ]))
            .await
            .unwrap();
        assert_eq!(cleaned, 2);

        let summary = store.find_detail_summary("a").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 1);
        assert_eq!(summary.success, 0);
        assert_eq!(summary.failure, 0);
        assert_eq!(store.count_all_jobs(&JobFilter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_one_job() {
        let store = MemoryStore::new();
        let job = make_job("a", JobStatus::Success, 0);
        store.save_job(&job).await.unwrap();

        let removed = store.delete_job(&job.id).await.unwrap().unwrap();
        assert_eq!(removed.id, job.id);
        assert!(store.find_job_by_id(&job.id).await.unwrap().is_none());
        assert!(store.delete_job(&job.id).await.unwrap().is_none());

        let summary = store.find_detail_summary("a").await.unwrap().unwrap();
        assert_eq!(summary.success, 0);
    }

    #[tokio::test]
    async fn configurations_round_trip() {
        let store = MemoryStore::new();
        assert!(store.find_configuration("retention_schedule").await.unwrap().is_none());

        let entry = ConfigEntry::new("retention_schedule", "Job retention schedule", "0 0 2 * * *");
        store.set_configuration(&entry).await.unwrap();

        let found = store
            .find_configuration("retention_schedule")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, entry);
        assert_eq!(store.list_configurations().await.unwrap().len(), 1);
    }
}
