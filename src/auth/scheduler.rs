// Deferred silent-renewal tasks, at most one per identity

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

use crate::clock::Clock;

/// A pending deferred renewal
#[derive(Debug)]
pub struct ScheduledTask {
    fire_at: DateTime<Utc>,
    generation: u64,
    handle: AbortHandle,
}

impl ScheduledTask {
    pub fn fire_at(&self) -> DateTime<Utc> {
        self.fire_at
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Owns the deferred renewal task of each signed-in identity.
///
/// The scheduler never re-arms on its own: whoever handles `on_fire` decides
/// what happens next.
pub struct RefreshScheduler {
    clock: Arc<dyn Clock>,
    tasks: Arc<DashMap<String, ScheduledTask>>,
    generation: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Cancel any task for `identity` and arm a new one at `fire_at`.
    ///
    /// Returns `false` without arming when `fire_at` is not in the future; the
    /// caller is expected to renew immediately instead.
    pub fn arm<F, Fut>(&self, identity: &str, fire_at: DateTime<Utc>, on_fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = fire_at - self.clock.now();
        let entry = self.tasks.entry(identity.to_string());

        if let Entry::Occupied(previous) = &entry {
            tracing::debug!(
                "Cancelling refresh for {} scheduled at {}",
                identity,
                previous.get().fire_at.to_rfc3339()
            );
            previous.get().cancel();
        }

        let delay = match delay.to_std() {
            Ok(delay) if !delay.is_zero() => delay,
            _ => {
                if let Entry::Occupied(previous) = entry {
                    previous.remove();
                }
                tracing::debug!("Refresh for {} is already due, not arming", identity);
                return false;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let key = identity.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach before running so a re-arm from inside `on_fire` cannot abort it
            tasks.remove_if(&key, |_, task| task.generation == generation);
            tracing::debug!("Scheduled refresh firing for {}", key);
            on_fire().await;
        });

        entry.insert(ScheduledTask {
            fire_at,
            generation,
            handle: handle.abort_handle(),
        });

        tracing::info!(
            "Silent refresh for {} scheduled at {} (in {}s)",
            identity,
            fire_at.to_rfc3339(),
            delay.as_secs()
        );

        true
    }

    /// Cancel the pending task for `identity`, if any
    pub fn cancel(&self, identity: &str) {
        if let Some((_, task)) = self.tasks.remove(identity) {
            task.cancel();
            tracing::debug!("Cancelled scheduled refresh for {}", identity);
        }
    }

    /// Fire time of the pending task for `identity`
    pub fn scheduled_at(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.tasks.get(identity).map(|task| task.fire_at())
    }

    pub fn is_armed(&self, identity: &str) -> bool {
        self.tasks.contains_key(identity)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.value().cancel();
        }
    }
}
