use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of a task owned by the thread pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Submitted, waiting in the FIFO queue.
    Queued,
    /// Picked up by a worker.
    Running,
    /// Finished, successfully or by panicking.
    Done,
}

/// Snapshot of the pool's monotonic task counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
}

impl PoolStats {
    /// Number of tasks currently in `state`.
    pub fn count(&self, state: TaskState) -> u64 {
        match state {
            TaskState::Queued => self.submitted.saturating_sub(self.started),
            TaskState::Running => self.started.saturating_sub(self.completed),
            TaskState::Done => self.completed,
        }
    }

    /// Tasks submitted but not yet done.
    pub fn outstanding(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }
}

/// Counters shared between the pool handle and its jobs.
#[derive(Debug, Default)]
pub(crate) struct TaskCounters {
    pub submitted: AtomicU64,
    pub started: AtomicU64,
    pub completed: AtomicU64,
}

impl TaskCounters {
    /// Reads `completed` before `started` before `submitted`, so a snapshot never
    /// shows more finished tasks than submitted ones.
    pub fn snapshot(&self) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let started = self.started.load(Ordering::SeqCst);
        let submitted = self.submitted.load(Ordering::SeqCst);
        PoolStats {
            submitted,
            started,
            completed,
        }
    }
}
