use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::error::EngineResult;
use crate::lock::Locker;

const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Shared-cache locker: INCR with a TTL set on first acquisition.
///
/// The TTL guards against locks orphaned by a crashed replica between its
/// startup resets.
#[derive(Clone)]
pub struct RedisLocker {
    manager: ConnectionManager,
    ttl: Duration,
}

impl RedisLocker {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::with_manager(manager))
    }

    /// Reuse an existing connection manager (shared with a queue or store)
    pub fn with_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

impl fmt::Debug for RedisLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLocker").field("ttl", &self.ttl).finish()
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn is_locked(&self, key: &str) -> EngineResult<bool> {
        let mut con = self.manager.clone();
        let count: i64 = con.incr(key, 1i64).await?;
        if count == 1 {
            con.pexpire::<_, ()>(key, self.ttl.as_millis() as i64).await?;
        }
        Ok(count > 1)
    }

    async fn unlock(&self, key: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn reset(&self, pattern: &str) -> EngineResult<()> {
        let mut scan_con = self.manager.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = scan_con.scan_match(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        if !keys.is_empty() {
            let mut con = self.manager.clone();
            con.del::<_, ()>(keys).await?;
        }
        Ok(())
    }
}
