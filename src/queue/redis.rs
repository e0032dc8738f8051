use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::error::EngineResult;
use crate::queue::TaskQueue;
use crate::types::JobId;

/// Redis list queue, shared by every engine replica in the same namespace.
///
/// One list per task under `{namespace}:queue:{task}`; RPUSH appends, LPOP
/// consumes, so list order is head first.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    namespace: String,
}

impl RedisQueue {
    /// Connect under the given key namespace
    pub async fn connect(url: &str, namespace: &str) -> EngineResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::with_manager(manager, namespace))
    }

    /// Reuse an existing connection manager (shared with a locker or store)
    pub fn with_manager(manager: ConnectionManager, namespace: &str) -> Self {
        Self {
            manager,
            namespace: namespace.to_string(),
        }
    }

    fn key(&self, task_name: &str) -> String {
        format!("{}:queue:{}", self.namespace, task_name)
    }
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push_job(&self, task_name: &str, job_id: &JobId) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.rpush::<_, _, ()>(self.key(task_name), job_id.as_str())
            .await?;
        Ok(())
    }

    async fn pop_job(&self, task_name: &str) -> EngineResult<Option<JobId>> {
        let mut con = self.manager.clone();
        let id: Option<String> = con.lpop(self.key(task_name), None).await?;
        Ok(id.map(JobId::from))
    }

    async fn next_job(&self, task_name: &str) -> EngineResult<Option<JobId>> {
        let mut con = self.manager.clone();
        let id: Option<String> = con.lindex(self.key(task_name), 0).await?;
        Ok(id.map(JobId::from))
    }

    async fn get_all_jobs(&self, task_name: &str) -> EngineResult<Vec<JobId>> {
        let mut con = self.manager.clone();
        let ids: Vec<String> = con.lrange(self.key(task_name), 0, -1).await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn clear(&self, task_name: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(self.key(task_name)).await?;
        Ok(())
    }
}
