//! Per-job execution locks shared across engine replicas.
//!
//! The lock test is an atomic increment-with-TTL: the first caller observes a
//! post-increment value of 1 and owns the job; later callers observe a larger
//! value and skip the attempt. The TTL bounds how long a crashed owner can
//! shadow a job; at-least-once execution is the accepted trade-off.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::error::EngineResult;

/// Distributed lock contract keyed by opaque strings
#[async_trait]
pub trait Locker: Send + Sync {
    /// Atomically increment the key's counter, setting the TTL on creation.
    /// Returns `true` when another holder already owns the key.
    async fn is_locked(&self, key: &str) -> EngineResult<bool>;

    /// Release the key
    async fn unlock(&self, key: &str) -> EngineResult<()>;

    /// Bulk-release every key matching a glob pattern (startup cleanup of
    /// locks orphaned by a crash)
    async fn reset(&self, pattern: &str) -> EngineResult<()>;
}

/// Locker for single-instance deployments without a shared cache.
/// Never reports contention; the dispatch loop is the only writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLocker;

impl NoopLocker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Locker for NoopLocker {
    async fn is_locked(&self, _key: &str) -> EngineResult<bool> {
        Ok(false)
    }

    async fn unlock(&self, _key: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn reset(&self, _pattern: &str) -> EngineResult<()> {
        Ok(())
    }
}

pub use memory::MemoryLocker;
#[cfg(feature = "redis")]
pub use self::redis::RedisLocker;
