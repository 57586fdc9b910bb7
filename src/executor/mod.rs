//! Local Task Execution Module
//!
//! Everything that runs work on this rank: the worker pool and the
//! single-assignment futures through which results come back, whether the
//! work was a local task or a remote call.
//!
//! ## Architecture Overview
//! 1. **Submission**: any thread hands a closure to the [`ThreadPool`](pool::ThreadPool).
//!    The task is counted as submitted before a worker can see it.
//! 2. **Execution**: a fixed set of workers dequeues tasks in FIFO order and runs
//!    them to completion. Panics are caught and logged.
//! 3. **Completion**: the result is written into a [`Promise`](future::Promise);
//!    readers block on the matching [`Future`](future::Future).
//!
//! ## Submodules
//! - **`pool`**: the worker threads, submission and shutdown.
//! - **`future`**: `Future`/`Promise` pairs.
//! - **`types`**: task lifecycle states and pool counters.

pub mod future;
pub mod pool;
pub mod types;

#[cfg(test)]
mod tests;
