//! Shard routing abstractions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use darter_common::ids::{ShardCount, ShardId};

/// Resolves key ownership to a shard id.
///
/// Ownership is a pure function of key bytes and shard count, so it never
/// changes during a process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ShardResolver {
    shard_count: ShardCount,
}

impl ShardResolver {
    /// Builds a resolver for a specific shard count.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self { shard_count }
    }

    /// Returns the configured shard count.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Returns the owner shard for the given key bytes.
    #[must_use]
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = hasher.finish() % u64::from(self.shard_count.get());
        match ShardId::try_from(shard) {
            Ok(shard_id) => shard_id,
            Err(_) => unreachable!("modulo shard_count ensures shard id fits into u16"),
        }
    }
}
