//! Liveness tasks for client registers.
//!
//! Each client register has at most one task that polls the peer and clears
//! the shadow value when no answer arrives. Tasks are keyed by register name
//! and tagged with a generation so a replaced task can never act.

use rand::Rng;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Time allowed for a peer to answer a poll before its value is cleared.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Range of the randomized wait before a proactive poll, in milliseconds.
pub const POLL_JITTER_MS: RangeInclusive<u64> = 8_000..=12_000;

/// Randomized wait before the next proactive poll.
pub(crate) fn poll_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(POLL_JITTER_MS))
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Task registry keyed by client register name.
#[derive(Debug, Default)]
pub(crate) struct LivenessTasks {
    tasks: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl LivenessTasks {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the task for `name`, then start its replacement.
    ///
    /// `start` receives the generation the new task must present to
    /// [`LivenessTasks::if_current`].
    pub(crate) fn replace(&self, name: &str, start: impl FnOnce(u64) -> JoinHandle<()>) {
        let mut tasks = self.lock();
        if let Some(previous) = tasks.remove(name) {
            previous.handle.abort();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = start(generation);
        tasks.insert(name.to_string(), Entry { generation, handle });
    }

    /// Run `action` only if `generation` is still the current task for `name`.
    pub(crate) fn if_current<T>(
        &self,
        name: &str,
        generation: u64,
        action: impl FnOnce() -> T,
    ) -> Option<T> {
        let tasks = self.lock();
        match tasks.get(name) {
            Some(entry) if entry.generation == generation => Some(action()),
            _ => None,
        }
    }

    /// Whether a live task exists for `name`.
    pub(crate) fn is_active(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    /// Number of live tasks.
    pub(crate) fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    /// Cancel every task.
    pub(crate) fn cancel_all(&self) {
        for (_, entry) in self.lock().drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let delay = poll_jitter();
            assert!(delay >= Duration::from_millis(8_000));
            assert!(delay <= Duration::from_millis(12_000));
        }
    }

    #[tokio::test]
    async fn replace_cancels_previous_task() {
        let tasks = LivenessTasks::default();
        let mut generations = Vec::new();

        tasks.replace("lamp", |generation| {
            generations.push(generation);
            tokio::spawn(std::future::pending())
        });
        tasks.replace("lamp", |generation| {
            generations.push(generation);
            tokio::spawn(std::future::pending())
        });

        assert_eq!(tasks.active_count(), 1);
        assert!(tasks.is_active("lamp"));
        assert_eq!(tasks.if_current("lamp", generations[0], || ()), None);
        assert_eq!(tasks.if_current("lamp", generations[1], || 7), Some(7));

        tasks.cancel_all();
        assert!(!tasks.is_active("lamp"));
    }
}
