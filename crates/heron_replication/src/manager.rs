//! Replication context lifecycle.
//!
//! Contexts are addressed by batch id. A context being driven is flagged
//! busy so two callers can never share one iterator state; expired contexts
//! are reaped by the TTL pass. Guards release the busy flag on drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use heron_common::config::ReplicationConfig;
use heron_common::error::{HeronError, HeronResult};
use heron_storage::StorageServices;

use crate::context::{deadline, ReplicationContext};

struct Entry {
    context: Arc<ReplicationContext>,
    busy: bool,
    expires: Instant,
}

pub struct ReplicationManager {
    services: Arc<StorageServices>,
    default_ttl: Duration,
    contexts: Mutex<HashMap<u64, Entry>>,
}

/// Holds a context exclusively. Dropping the guard releases the busy flag.
pub struct ContextGuard {
    manager: Arc<ReplicationManager>,
    context: Arc<ReplicationContext>,
}

impl ContextGuard {
    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.context
    }
}

impl std::ops::Deref for ContextGuard {
    type Target = ReplicationContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.manager.release(self.context.id());
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("batch", &self.context.id())
            .finish()
    }
}

impl ReplicationManager {
    pub fn new(services: Arc<StorageServices>, config: &ReplicationConfig) -> Arc<Self> {
        Arc::new(Self {
            services,
            default_ttl: Duration::from_secs_f64(config.batch_ttl_secs.max(1.0)),
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Create a context with the given (or default) TTL.
    pub fn create_context(&self, ttl: Option<Duration>) -> Arc<ReplicationContext> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let id = self.services.ticks.next_tick();
        let context = Arc::new(ReplicationContext::new(id, ttl));
        self.contexts.lock().insert(
            id,
            Entry {
                context: Arc::clone(&context),
                busy: false,
                expires: deadline(ttl),
            },
        );
        tracing::debug!(batch = id, ?ttl, "replication context created");
        context
    }

    /// Acquire a context exclusively. A context already in use answers
    /// busy; an unknown id answers not-found. Acquiring refreshes the TTL.
    pub fn find(self: &Arc<Self>, id: u64) -> HeronResult<ContextGuard> {
        let mut contexts = self.contexts.lock();
        let entry = contexts.get_mut(&id).ok_or(HeronError::CursorNotFound)?;
        if entry.busy {
            return Err(HeronError::CursorBusy);
        }
        entry.busy = true;
        entry.expires = deadline(entry.context.ttl());
        Ok(ContextGuard {
            manager: Arc::clone(self),
            context: Arc::clone(&entry.context),
        })
    }

    fn release(&self, id: u64) {
        if let Some(entry) = self.contexts.lock().get_mut(&id) {
            entry.busy = false;
        }
    }

    /// Extend a context's lifetime (PUT on the batch).
    pub fn extend(self: &Arc<Self>, id: u64, ttl: Duration) -> HeronResult<()> {
        let mut contexts = self.contexts.lock();
        let entry = contexts.get_mut(&id).ok_or(HeronError::CursorNotFound)?;
        if entry.busy {
            return Err(HeronError::CursorBusy);
        }
        entry.expires = deadline(ttl);
        Ok(())
    }

    /// Drop a context (DELETE on the batch).
    pub fn remove(&self, id: u64) -> HeronResult<()> {
        let mut contexts = self.contexts.lock();
        match contexts.get(&id) {
            None => Err(HeronError::CursorNotFound),
            Some(entry) if entry.busy => Err(HeronError::CursorBusy),
            Some(_) => {
                contexts.remove(&id);
                tracing::debug!(batch = id, "replication context removed");
                Ok(())
            }
        }
    }

    /// Reap expired contexts; `force` drops everything not busy. Returns
    /// the number reaped.
    pub fn garbage_collect(&self, force: bool) -> usize {
        let now = Instant::now();
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, entry| entry.busy || (!force && entry.expires > now));
        let reaped = before - contexts.len();
        if reaped > 0 {
            tracing::debug!(reaped, "replication contexts reaped");
        }
        reaped
    }

    pub fn count(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn services(&self) -> &Arc<StorageServices> {
        &self.services
    }
}
