use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ids::JobId;
use crate::types::job::{Job, JobStatus};

/// Selection criteria for job queries, updates and dashboard feeds.
///
/// Empty fields match everything; `page`/`limit` apply only to listing
/// queries, never to updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    /// 1-based page number
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub task_name: Option<String>,
    pub task_names: Option<Vec<String>>,
    pub exclude_task_names: Option<Vec<String>>,
    pub job_id: Option<JobId>,
    pub statuses: Vec<JobStatus>,
    /// Case-insensitive substring match over arguments and error
    pub search: Option<String>,
    /// Only jobs created strictly before this instant (retention sweeps)
    pub before_created_at: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn with_task_names(mut self, task_names: Vec<String>) -> Self {
        self.task_names = Some(task_names);
        self
    }

    pub fn with_exclude_task_names(mut self, task_names: Vec<String>) -> Self {
        self.exclude_task_names = Some(task_names);
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_page(mut self, page: usize, limit: usize) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }

    pub fn with_before_created_at(mut self, before: DateTime<Utc>) -> Self {
        self.before_created_at = Some(before);
        self
    }

    /// Whether a job satisfies every criterion (pagination excluded)
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = &self.job_id {
            if &job.id != id {
                return false;
            }
        }
        if let Some(name) = &self.task_name {
            if &job.task_name != name {
                return false;
            }
        }
        if let Some(names) = &self.task_names {
            if !names.iter().any(|n| n == &job.task_name) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_task_names {
            if excluded.iter().any(|n| n == &job.task_name) {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            let in_args = job.arguments.to_lowercase().contains(&needle);
            let in_error = job.error.to_lowercase().contains(&needle);
            if !in_args && !in_error {
                return false;
            }
        }
        if let Some(before) = &self.before_created_at {
            if job.created_at >= *before {
                return false;
            }
        }
        true
    }

    /// Apply the page window to an already-filtered, ordered list
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        match self.limit {
            None => items,
            Some(limit) => {
                let page = self.page.unwrap_or(1).max(1);
                items
                    .into_iter()
                    .skip((page - 1) * limit)
                    .take(limit)
                    .collect()
            }
        }
    }
}

/// Selection criteria for task summary queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryFilter {
    pub task_names: Option<Vec<String>>,
    pub exclude_task_names: Option<Vec<String>>,
}

impl SummaryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_names(mut self, task_names: Vec<String>) -> Self {
        self.task_names = Some(task_names);
        self
    }

    pub fn with_exclude_task_names(mut self, task_names: Vec<String>) -> Self {
        self.exclude_task_names = Some(task_names);
        self
    }

    pub fn matches(&self, task_name: &str) -> bool {
        if let Some(names) = &self.task_names {
            if !names.iter().any(|n| n == task_name) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_task_names {
            if excluded.iter().any(|n| n == task_name) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(task: &str, status: JobStatus) -> Job {
        let mut job = Job::new(task, r#"{"user":"alice"}"#, 3, Duration::from_secs(1));
        job.status = status;
        job
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = JobFilter::new();
        assert!(filter.matches(&job("a", JobStatus::Queueing)));
        assert!(filter.matches(&job("b", JobStatus::Failure)));
    }

    #[test]
    fn status_and_task_filters() {
        let filter = JobFilter::new()
            .with_task_name("a")
            .with_statuses(vec![JobStatus::Failure, JobStatus::Stopped]);
        assert!(filter.matches(&job("a", JobStatus::Failure)));
        assert!(!filter.matches(&job("a", JobStatus::Queueing)));
        assert!(!filter.matches(&job("b", JobStatus::Failure)));
    }

    #[test]
    fn exclusion_list_wins() {
        let filter = JobFilter::new().with_exclude_task_names(vec!["hidden".into()]);
        assert!(!filter.matches(&job("hidden", JobStatus::Queueing)));
        assert!(filter.matches(&job("visible", JobStatus::Queueing)));
    }

    #[test]
    fn search_scans_arguments_and_error() {
        let filter = JobFilter::new().with_search("ALICE");
        assert!(filter.matches(&job("a", JobStatus::Queueing)));

        let mut failed = job("a", JobStatus::Failure);
        failed.arguments = "{}".into();
        failed.error = "connection refused by alice-db".into();
        assert!(filter.matches(&failed));

        failed.error = "timeout".into();
        assert!(!filter.matches(&failed));
    }

    #[test]
    fn pagination_windows() {
        let filter = JobFilter::new().with_page(2, 3);
        let items: Vec<i32> = (0..10).collect();
        assert_eq!(filter.paginate(items), vec![3, 4, 5]);

        let unpaged = JobFilter::new();
        assert_eq!(unpaged.paginate(vec![1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn age_threshold() {
        let fresh = job("a", JobStatus::Success);
        let filter = JobFilter::new()
            .with_before_created_at(Utc::now() - chrono::Duration::hours(1));
        assert!(!filter.matches(&fresh));

        let mut old = job("a", JobStatus::Success);
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        assert!(filter.matches(&old));
    }

    #[test]
    fn summary_filter_names() {
        let filter = SummaryFilter::new()
            .with_task_names(vec!["a".into(), "b".into()])
            .with_exclude_task_names(vec!["b".into()]);
        assert!(filter.matches("a"));
        assert!(!filter.matches("b"));
        assert!(!filter.matches("c"));
    }

    mod pagination_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: page windows never exceed the limit, preserve order,
            /// and consecutive pages tile the list without gaps or overlap.
            #[test]
            fn pages_tile_the_list(
                len in 0usize..50,
                page in 1usize..8,
                limit in 1usize..10,
            ) {
                let items: Vec<usize> = (0..len).collect();
                let window = JobFilter::new().with_page(page, limit).paginate(items.clone());

                prop_assert!(window.len() <= limit);
                let start = (page - 1) * limit;
                prop_assert_eq!(&window[..], items.get(start..(start + limit).min(len)).unwrap_or(&[]));

                let mut rebuilt = Vec::new();
                for p in 1.. {
                    let chunk = JobFilter::new().with_page(p, limit).paginate(items.clone());
                    if chunk.is_empty() {
                        break;
                    }
                    rebuilt.extend(chunk);
                }
                prop_assert_eq!(rebuilt, items);
            }
        }
    }
}
