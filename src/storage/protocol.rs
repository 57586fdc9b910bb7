//! Storage Network Protocol
//!
//! Handler names and the payloads exchanged between a caller and the owner
//! of a key. Names embed the container id, so containers created in the same
//! order get the same handler ids on every rank.

use serde::{Deserialize, Serialize};

// --- Handler names ---

pub fn replace_handler(container: u64) -> String {
    format!("map.{}.replace", container)
}

pub fn erase_handler(container: u64) -> String {
    format!("map.{}.erase", container)
}

pub fn find_handler(container: u64) -> String {
    format!("map.{}.find", container)
}

pub fn op_handler(container: u64, op: &str) -> String {
    format!("map.{}.op.{}", container, op)
}

// --- Payloads ---

/// Write forwarded to the owner. Unacknowledged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceRequest<K, V> {
    pub key: K,
    pub value: V,
}

/// Key-only request, used by `erase` and `find`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRequest<K> {
    pub key: K,
}

/// Named operation to run on the item at the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvokeRequest<K, A> {
    pub key: K,
    pub arg: A,
}
