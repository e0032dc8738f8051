use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::EngineResult;
use crate::lock::Locker;

const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct LockEntry {
    count: u64,
    expires_at: Instant,
}

/// Process-local locker with the same counter-and-TTL semantics as the
/// shared-cache implementation. Useful for single-process deployments and
/// for exercising the engine's exclusion behavior in tests. Clones share
/// the same lock table.
#[derive(Clone)]
pub struct MemoryLocker {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of currently held keys (expired entries excluded)
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocker")
            .field("ttl", &self.ttl)
            .field("held", &self.held())
            .finish()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn is_locked(&self, key: &str) -> EngineResult<bool> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let expired = entries
            .get(key)
            .map(|entry| entry.expires_at <= now)
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert(LockEntry {
            count: 0,
            expires_at: now + self.ttl,
        });
        entry.count += 1;
        Ok(entry.count > 1)
    }

    async fn unlock(&self, key: &str) -> EngineResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn reset(&self, pattern: &str) -> EngineResult<()> {
        let mut entries = self.entries.lock();
        match pattern.strip_suffix('*') {
            Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
            None => {
                entries.remove(pattern);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_caller_owns_the_key() {
        let locker = MemoryLocker::new();
        assert!(!locker.is_locked("lock:job-1").await.unwrap());
        assert!(locker.is_locked("lock:job-1").await.unwrap());
        assert!(locker.is_locked("lock:job-1").await.unwrap());
    }

    #[tokio::test]
    async fn unlock_releases() {
        let locker = MemoryLocker::new();
        assert!(!locker.is_locked("lock:job-1").await.unwrap());
        locker.unlock("lock:job-1").await.unwrap();
        assert!(!locker.is_locked("lock:job-1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_reclaimed() {
        let locker = MemoryLocker::with_ttl(Duration::from_millis(10));
        assert!(!locker.is_locked("lock:job-1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!locker.is_locked("lock:job-1").await.unwrap());
    }

    #[tokio::test]
    async fn reset_matches_prefix_globs() {
        let locker = MemoryLocker::new();
        locker.is_locked("ns:lock:a").await.unwrap();
        locker.is_locked("ns:lock:b").await.unwrap();
        locker.is_locked("other:lock:c").await.unwrap();
        assert_eq!(locker.held(), 3);

        locker.reset("ns:lock:*").await.unwrap();
        assert_eq!(locker.held(), 1);
        assert!(!locker.is_locked("ns:lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_callers_exactly_one_wins() {
        use std::sync::Arc;
        let locker = Arc::new(MemoryLocker::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let locker = Arc::clone(&locker);
            handles.push(tokio::spawn(async move {
                locker.is_locked("lock:contended").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
