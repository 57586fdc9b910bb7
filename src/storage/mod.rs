//! Distributed Storage Module
//!
//! Implements a sharded in-memory associative container on top of the RMI
//! engine.
//!
//! ## Core Concepts
//! - **Partitioning**: a pure `Partition` function maps each key to its owner
//!   rank. The default hashes keys into fixed virtual partitions dealt
//!   round-robin over the ranks.
//! - **Shards**: each rank stores the keys it owns in a local `DashMap`; only
//!   the owner mutates them.
//! - **Access**: `DistributedMap` routes every operation, touching the local
//!   shard directly or sending an active message to the owner.
//! - **Item operations**: named closures registered on every rank run at the
//!   owner under the item's entry lock.

pub mod handlers;
pub mod memory;
pub mod partitioner;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod tests;
