use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::EngineResult;
use crate::queue::TaskQueue;
use crate::types::JobId;

/// In-process queue backend. Contents are lost on restart; the engine
/// rehydrates them from the persistence store's Queueing scan at startup.
/// Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<RwLock<HashMap<String, VecDeque<JobId>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push_job(&self, task_name: &str, job_id: &JobId) -> EngineResult<()> {
        self.queues
            .write()
            .entry(task_name.to_string())
            .or_default()
            .push_back(job_id.clone());
        Ok(())
    }

    async fn pop_job(&self, task_name: &str) -> EngineResult<Option<JobId>> {
        Ok(self
            .queues
            .write()
            .get_mut(task_name)
            .and_then(|queue| queue.pop_front()))
    }

    async fn next_job(&self, task_name: &str) -> EngineResult<Option<JobId>> {
        Ok(self
            .queues
            .read()
            .get(task_name)
            .and_then(|queue| queue.front().cloned()))
    }

    async fn get_all_jobs(&self, task_name: &str) -> EngineResult<Vec<JobId>> {
        Ok(self
            .queues
            .read()
            .get(task_name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, task_name: &str) -> EngineResult<()> {
        self.queues.write().remove(task_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_per_task() {
        let queue = MemoryQueue::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());

        queue.push_job("emails", &a).await.unwrap();
        queue.push_job("emails", &b).await.unwrap();
        queue.push_job("reports", &c).await.unwrap();

        assert_eq!(queue.pop_job("emails").await.unwrap(), Some(a));
        assert_eq!(queue.pop_job("emails").await.unwrap(), Some(b));
        assert_eq!(queue.pop_job("emails").await.unwrap(), None);
        // Other task queues are untouched
        assert_eq!(queue.pop_job("reports").await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let queue = MemoryQueue::new();
        let id = JobId::new();
        queue.push_job("emails", &id).await.unwrap();

        assert_eq!(queue.next_job("emails").await.unwrap(), Some(id.clone()));
        assert_eq!(queue.next_job("emails").await.unwrap(), Some(id.clone()));
        assert_eq!(queue.pop_job("emails").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn snapshot_is_head_first() {
        let queue = MemoryQueue::new();
        let (a, b) = (JobId::new(), JobId::new());
        queue.push_job("emails", &a).await.unwrap();
        queue.push_job("emails", &b).await.unwrap();

        assert_eq!(queue.get_all_jobs("emails").await.unwrap(), vec![a, b]);
        assert!(queue.get_all_jobs("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_drops_the_queue() {
        let queue = MemoryQueue::new();
        queue.push_job("emails", &JobId::new()).await.unwrap();
        queue.clear("emails").await.unwrap();
        assert_eq!(queue.next_job("emails").await.unwrap(), None);
    }
}
