//! Dashboard subscriber registry.
//!
//! A subscriber is a bounded channel plus the job filter its view is showing.
//! The engine fans state changes out through [`SubscriberHub::snapshot`] and
//! [`SubscriberHub::send`]; delivery is best effort and never blocks the
//! execution path. Capacity and idle eviction limits come from the persisted
//! runtime settings and can change while the engine is live.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::RuntimeSettings;
use crate::error::{EngineError, EngineResult};
use crate::types::{EnginePush, JobFilter, SubscriberId};

/// Per-subscriber pending push capacity. A full channel drops the push;
/// the next state change delivers a fresh snapshot anyway.
const PUSH_BUFFER: usize = 64;

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<EnginePush>,
    filter: JobFilter,
    last_seen_at: Instant,
}

#[derive(Debug)]
struct Limits {
    max_subscribers: usize,
    max_age: Duration,
}

#[derive(Debug)]
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    limits: RwLock<Limits>,
}

impl SubscriberHub {
    pub fn new(settings: &RuntimeSettings) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            limits: RwLock::new(Limits {
                max_subscribers: settings.max_subscribers,
                max_age: settings.subscriber_max_age,
            }),
        }
    }

    /// Pick up changed capacity or idle limits
    pub fn apply_settings(&self, settings: &RuntimeSettings) {
        let mut limits = self.limits.write();
        limits.max_subscribers = settings.max_subscribers;
        limits.max_age = settings.subscriber_max_age;
    }

    /// Register a new subscriber with its initial view filter
    pub fn register(
        &self,
        filter: JobFilter,
    ) -> EngineResult<(SubscriberId, mpsc::Receiver<EnginePush>)> {
        let max = self.limits.read().max_subscribers;
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= max {
            return Err(EngineError::SubscriberLimitReached(max));
        }
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        subscribers.insert(
            id.clone(),
            Subscriber {
                tx,
                filter,
                last_seen_at: Instant::now(),
            },
        );
        Ok((id, rx))
    }

    pub fn unregister(&self, id: &SubscriberId) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    /// Record subscriber activity and update the filter its view is showing
    pub fn set_filter(&self, id: &SubscriberId, filter: JobFilter) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.get_mut(id) {
            Some(subscriber) => {
                subscriber.filter = filter;
                subscriber.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record subscriber activity without changing its filter
    pub fn touch(&self, id: &SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.get_mut(id) {
            Some(subscriber) => {
                subscriber.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Ids and filters of every live subscriber
    pub fn snapshot(&self) -> Vec<(SubscriberId, JobFilter)> {
        self.subscribers
            .read()
            .iter()
            .map(|(id, subscriber)| (id.clone(), subscriber.filter.clone()))
            .collect()
    }

    /// Best-effort delivery. A full channel drops the push; a closed one
    /// removes the subscriber.
    pub fn send(&self, id: &SubscriberId, push: EnginePush) -> bool {
        let result = {
            let subscribers = self.subscribers.read();
            match subscribers.get(id) {
                Some(subscriber) => subscriber.tx.try_send(push),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber_id = %id, "subscriber channel full, dropping push");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.subscribers.write().remove(id);
                false
            }
        }
    }

    /// Remove subscribers idle longer than the configured age
    pub fn evict_idle(&self) -> Vec<SubscriberId> {
        let max_age = self.limits.read().max_age;
        let now = Instant::now();
        let mut subscribers = self.subscribers.write();
        let expired: Vec<SubscriberId> = subscribers
            .iter()
            .filter(|(_, subscriber)| {
                now.duration_since(subscriber.last_seen_at) > max_age
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            subscribers.remove(id);
            debug!(subscriber_id = %id, "evicted idle subscriber");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
