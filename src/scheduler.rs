use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first attempt
    pub initial_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based). Attempt 1 waits `initial_delay`;
    /// later attempts wait `base_delay * 2^(attempt - 2)`, capped at
    /// `max_delay`. `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        if attempt == 1 {
            return Some(self.initial_delay);
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Background tasks keyed by id; at most one live task per key
#[derive(Default)]
pub struct TaskScope {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `task` under `key` unless a task for that key is still running.
    /// Returns whether it was spawned.
    pub fn spawn_keyed<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(key) {
            return false;
        }
        tasks.insert(key.to_string(), tokio::spawn(task));
        true
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|h| !h.is_finished())
    }

    pub fn active_len(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts everything. Returns how many tasks were still running.
    pub fn cancel_all(&self) -> usize {
        let mut running = 0;
        for (_, handle) in self.lock().drain() {
            if !handle.is_finished() {
                running += 1;
            }
            handle.abort();
        }
        running
    }

    /// Waits for every task spawned so far to finish
    pub async fn join_all(&self) {
        let handles: Vec<_> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "background task panicked");
                }
            }
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
