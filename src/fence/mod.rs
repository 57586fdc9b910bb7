//! Global Synchronization Module
//!
//! Collective operations built from system messages, and the fence that
//! every distributed algorithm on top of the runtime uses as its only total
//! order point.
//!
//! ## Submodules
//! - **`collective`**: gather-at-root `allgather` and `allreduce_sum`.
//! - **`quiescence`**: the four-counter fence.

pub mod collective;
pub mod quiescence;

#[cfg(test)]
mod tests;
