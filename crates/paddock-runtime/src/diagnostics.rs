//! Leak detection for supervision tasks.
//!
//! Every reaper and stream relay holds a [`WorkerGuard`] for as long as it
//! runs, so the live count returns to its baseline once all processes have
//! exited and their output has drained.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use paddock_common::metrics::Diagnostics;

#[derive(Debug, Default)]
struct Workers {
    next_id: u64,
    live: BTreeMap<u64, (String, Instant)>,
}

/// Registry of live supervision tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkerTracker {
    workers: Arc<Mutex<Workers>>,
}

impl WorkerTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker until the returned guard is dropped.
    #[must_use]
    pub fn track(&self, label: impl Into<String>) -> WorkerGuard {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = workers.next_id;
        workers.next_id += 1;
        let _ = workers.live.insert(id, (label.into(), Instant::now()));
        WorkerGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Number of live workers.
    #[must_use]
    pub fn live(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }

    /// Current counters, with one line per live worker, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Diagnostics {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stacks = String::new();
        for (label, started) in workers.live.values() {
            let _ = writeln!(stacks, "{label} (running {:.1}s)", started.elapsed().as_secs_f64());
        }
        Diagnostics {
            live_workers: workers.live.len(),
            threads: os_threads(),
            stacks,
        }
    }

    fn release(&self, id: u64) {
        let _ = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .remove(&id);
    }
}

/// Keeps a worker registered while alive.
#[derive(Debug)]
pub struct WorkerGuard {
    tracker: WorkerTracker,
    id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}

/// Thread count of the server process, zero where `/proc` is unavailable.
fn os_threads() -> usize {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("Threads:"))
                .and_then(|n| n.trim().parse().ok())
        })
        .unwrap_or(0)
}
