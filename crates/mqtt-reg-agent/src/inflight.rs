//! Per-register publish counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Publishes allowed in flight for one register at a time.
pub const MAX_IN_FLIGHT: u8 = 2;

type Counts = Arc<Mutex<HashMap<String, u8>>>;

/// Bounded count of in-flight publishes per register name.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight {
    counts: Counts,
}

impl InFlight {
    /// Reserve a publish slot for `name`, or `None` if the bound is reached.
    pub(crate) fn try_acquire(&self, name: &str) -> Option<InFlightGuard> {
        let mut counts = lock(&self.counts);
        let count = counts.entry(name.to_string()).or_insert(0);
        if *count >= MAX_IN_FLIGHT {
            return None;
        }
        *count += 1;

        Some(InFlightGuard {
            counts: Arc::clone(&self.counts),
            name: name.to_string(),
        })
    }

    /// Current number of in-flight publishes for `name`.
    pub(crate) fn count(&self, name: &str) -> u8 {
        lock(&self.counts).get(name).copied().unwrap_or(0)
    }
}

/// Releases its slot when dropped, whatever happened to the publish.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    counts: Counts,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(count) = lock(&self.counts).get_mut(&self.name) {
            *count = count.saturating_sub(1);
        }
    }
}

fn lock(counts: &Counts) -> MutexGuard<'_, HashMap<String, u8>> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}
