use crate::group::types::Rank;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Pure key → owner mapping. Must give the same answer on every rank.
pub trait Partition<K: ?Sized>: Send + Sync {
    fn owner(&self, key: &K) -> Rank;
}

/// Default mapping: hash the key into one of `num_partitions` virtual
/// partitions, then deal partitions round-robin over the ranks.
///
/// The owner is therefore `(hash % num_partitions) % size`, not
/// `hash % size`. When `size` does not divide `num_partitions` the low ranks
/// get one partition more than the others: with the default 256 partitions
/// over 3 ranks, rank 0 holds 86 and ranks 1 and 2 hold 85 each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartition {
    num_partitions: u32,
    size: usize,
}

impl HashPartition {
    pub fn new(size: usize) -> Self {
        Self::with_partitions(256, size)
    }

    pub fn with_partitions(num_partitions: u32, size: usize) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            size: size.max(1),
        }
    }

    /// `DefaultHasher::new()` is keyed with constants, so every process built
    /// from the same binary hashes a key identically.
    pub fn get_partition<K: Hash + ?Sized>(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_partitions
    }

    pub fn partition_owner(&self, partition: u32) -> Rank {
        (partition as usize) % self.size
    }

    /// Partitions owned by `rank`.
    pub fn my_partitions(&self, rank: Rank) -> Vec<u32> {
        (0..self.num_partitions)
            .filter(|&partition| self.partition_owner(partition) == rank)
            .collect()
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}

impl<K: Hash + ?Sized> Partition<K> for HashPartition {
    fn owner(&self, key: &K) -> Rank {
        self.partition_owner(self.get_partition(key))
    }
}

/// Custom mapping from a closure.
pub struct FnPartition<F>(pub F);

impl<K: ?Sized, F> Partition<K> for FnPartition<F>
where
    F: Fn(&K) -> Rank + Send + Sync,
{
    fn owner(&self, key: &K) -> Rank {
        (self.0)(key)
    }
}
