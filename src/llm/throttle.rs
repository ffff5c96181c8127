// Per-upstream concurrency gate. One semaphore per upstream id, created
// lazily at the configured limit; tokio's semaphore queues waiters in FIFO
// order, which bounds starvation. The throttler never retries; it only
// gates, and it surfaces nothing about the request itself.

use crate::llm::error::GatewayError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_UPSTREAM_LIMIT: usize = 4;

/// Per-upstream-id concurrency limiter with in-flight accounting.
pub struct Throttler {
    default_limit: usize,
    configured: HashMap<String, usize>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Throttler {
    pub fn new(default_limit: usize) -> Self {
        Throttler {
            default_limit: default_limit.max(1),
            configured: HashMap::new(),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Override the permit count for one upstream id. Takes effect on the
    /// first acquire for that id.
    pub fn with_limit(mut self, upstream_id: impl Into<String>, limit: usize) -> Self {
        self.configured.insert(upstream_id.into(), limit.max(1));
        self
    }

    pub fn limit_for(&self, upstream_id: &str) -> usize {
        self.configured
            .get(upstream_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Wait for a permit on the upstream's semaphore. The returned permit
    /// must be held for the life of the HTTP call (streams included): the
    /// caller moves it into whatever owns the request so that dropping on
    /// completion or cancellation releases the slot.
    pub async fn acquire(&self, upstream_id: &str) -> Result<OwnedSemaphorePermit, GatewayError> {
        let semaphore = self.semaphore_for(upstream_id);
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Configuration(format!("throttler closed for {upstream_id}")))
    }

    /// Number of permits currently held for the upstream.
    pub fn in_flight(&self, upstream_id: &str) -> usize {
        let limit = self.limit_for(upstream_id);
        let semaphore = self.semaphore_for(upstream_id);
        limit.saturating_sub(semaphore.available_permits())
    }

    fn semaphore_for(&self, upstream_id: &str) -> Arc<Semaphore> {
        let mut map = self
            .semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(upstream_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit_for(upstream_id))))
            .clone()
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Throttler::new(DEFAULT_UPSTREAM_LIMIT)
    }
}
