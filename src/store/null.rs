use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::ConfigEntry;
use crate::error::EngineResult;
use crate::store::{JobPatch, JobStore, SummaryPatch, SummaryStore, UpdateOutcome};
use crate::types::{Job, JobFilter, JobId, JobStatus, RetryHistory, SummaryFilter, TaskSummary};

/// Degraded store for deployments without a database.
///
/// Active jobs (Queueing/Retrying) are held in memory so the execution
/// machine can run; a job's body is discarded the moment it goes terminal.
/// What survives is the per-task counters and the runtime settings, so
/// dashboards keep working at summary granularity. Nothing is durable and no
/// history is kept; crash recovery has nothing to replay.
#[derive(Debug, Default)]
pub struct NullStore {
    active: RwLock<HashMap<JobId, Job>>,
    summaries: RwLock<BTreeMap<String, TaskSummary>>,
    configs: RwLock<BTreeMap<String, ConfigEntry>>,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, task_name: &str, status: JobStatus, delta: i64) {
        let mut summaries = self.summaries.write();
        summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name))
            .add(status, delta);
    }
}

#[async_trait]
impl SummaryStore for NullStore {
    async fn find_all_summary(&self, filter: &SummaryFilter) -> EngineResult<Vec<TaskSummary>> {
        Ok(self
            .summaries
            .read()
            .values()
            .filter(|summary| filter.matches(&summary.task_name))
            .cloned()
            .collect())
    }

    async fn find_detail_summary(&self, task_name: &str) -> EngineResult<Option<TaskSummary>> {
        Ok(self.summaries.read().get(task_name).cloned())
    }

    async fn update_summary(&self, task_name: &str, patch: &SummaryPatch) -> EngineResult<()> {
        let mut summaries = self.summaries.write();
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
        let mut summaries = self.summaries.write();
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
impl JobStore for NullStore {
    async fn save_job(&self, job: &Job) -> EngineResult<()> {
        self.active.write().insert(job.id.clone(), job.clone());
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
            let mut active = self.active.write();
            let ids: Vec<JobId> = active
                .values()
                .filter(|job| filter.matches(job))
                .map(|job| job.id.clone())
                .collect();
            let matched = ids.len() as u64;
            let mut affected = 0u64;
            for id in ids {
                if let Some(job) = active.get_mut(&id) {
                    let old_status = job.status;
                    patch.apply_to(job);
                    job.retry_histories.extend_from_slice(histories);
                    if job.status != old_status {
                        deltas.push((job.task_name.clone(), old_status, -1));
                        deltas.push((job.task_name.clone(), job.status, 1));
                    }
                    // Terminal bodies are not retained
                    if job.status.is_terminal() {
                        active.remove(&id);
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
        Ok(self.active.read().get(id).cloned())
    }

    async fn find_all_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .active
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
            .active
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .count())
    }

    async fn aggregate_all_task_jobs(
        &self,
        filter: &JobFilter,
    ) -> EngineResult<Vec<TaskSummary>> {
        // Terminal bodies are gone, so the counters are the best recount
        // available here
        let summaries = self.summaries.read();
        Ok(summaries
            .values()
            .filter(|summary| {
                if let Some(name) = &filter.task_name {
                    if &summary.task_name != name {
                        return false;
                    }
                }
                if let Some(names) = &filter.task_names {
                    if !names.iter().any(|n| n == &summary.task_name) {
                        return false;
                    }
                }
                if let Some(excluded) = &filter.exclude_task_names {
                    if excluded.iter().any(|n| n == &summary.task_name) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect())
    }

    async fn clean_jobs(&self, filter: &JobFilter) -> EngineResult<usize> {
        // Nothing terminal is stored; cleaning zeroes the targeted buckets
        let statuses: Vec<JobStatus> = if filter.statuses.is_empty() {
            vec![JobStatus::Success, JobStatus::Failure, JobStatus::Stopped]
        } else {
            filter.statuses.clone()
        };
        let mut summaries = self.summaries.write();
        let mut cleaned = 0i64;
        for summary in summaries.values_mut() {
            let task_matches = filter
                .task_name
                .as_ref()
                .map(|name| name == &summary.task_name)
                .unwrap_or(true);
            if !task_matches {
                continue;
            }
            for status in &statuses {
                if status.is_terminal() {
                    cleaned += summary.get(*status);
                    summary.set(*status, 0);
                }
            }
        }
        Ok(cleaned.max(0) as usize)
    }

    async fn delete_job(&self, id: &JobId) -> EngineResult<Option<Job>> {
        let removed = self.active.write().remove(id);
        if let Some(job) = &removed {
            self.bump(&job.task_name, job.status, -1);
        }
        Ok(removed)
    }

    async fn find_configuration(&self, key: &str) -> EngineResult<Option<ConfigEntry>> {
        Ok(self.configs.read().get(key).cloned())
    }

    async fn set_configuration(&self, entry: &ConfigEntry) -> EngineResult<()> {
        self.configs
            .write()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn list_configurations(&self) -> EngineResult<Vec<ConfigEntry>> {
        Ok(self.configs.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_job(task: &str) -> Job {
        Job::new(task, "{}", 3, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn active_jobs_are_queryable() {
        let store = NullStore::new();
        let job = make_job("emails");
        store.save_job(&job).await.unwrap();

        assert!(store.find_job_by_id(&job.id).await.unwrap().is_some());
        assert_eq!(store.count_all_jobs(&JobFilter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_transition_drops_the_body_but_keeps_the_count() {
        let store = NullStore::new();
        let job = make_job("emails");
        store.save_job(&job).await.unwrap();

        let outcome = store
            .update_job(
                &JobFilter::new().with_job_id(job.id.clone()),
                &JobPatch {
                    status: Some(JobStatus::Success),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap();
        assert_eq!(outcome.affected, 1);

        assert!(store.find_job_by_id(&job.id).await.unwrap().is_none());
        let summary = store.find_detail_summary("emails").await.unwrap().unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(summary.queueing, 0);
    }

    #[tokio::test]
    async fn requeue_keeps_the_body() {
        let store = NullStore::new();
        let job = make_job("emails");
        store.save_job(&job).await.unwrap();

        store
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

        let found = store.find_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Retrying);
        assert_eq!(found.retries, 1);
    }

    #[tokio::test]
    async fn clean_zeroes_terminal_buckets() {
        let store = NullStore::new();
        store
            .update_summary(
                "emails",
                &SummaryPatch {
                    success: Some(4),
                    failure: Some(2),
                    queueing: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cleaned = store
            .clean_jobs(&JobFilter::new().with_task_name("emails").with_statuses(vec![
                JobStatus::Success,
                JobStatus::Failure,
                JobStatus::Stopped,
            ]))
            .await
            .unwrap();
        assert_eq!(cleaned, 6);

        let summary = store.find_detail_summary("emails").await.unwrap().unwrap();
        assert_eq!(summary.success, 0);
        assert_eq!(summary.failure, 0);
        assert_eq!(summary.queueing, 1);
    }
}
