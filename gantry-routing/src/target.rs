//! Target shard computation.
//!
//! Targeting reduces a query's predicate to the shards whose key ranges can
//! contain matching documents. The predicate seen here is already reduced to
//! its shard-key component by the statement layer: a point, a hash range, or
//! nothing usable (scatter-gather).

use std::collections::BTreeSet;

use gantry_core::ShardId;

use crate::routing_table::{KeyRange, RoutingTable};

/// The shard-key component of a query predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPredicate {
    /// Equality on the shard key, pre-hashed.
    ShardKeyPoint(u32),
    /// A contiguous range of shard-key hashes.
    ShardKeyRange(KeyRange),
    /// No usable shard-key bound; every data-bearing shard is targeted.
    Unbounded,
}

/// Computes the set of shards a query must run on.
///
/// The result is non-empty for every well-formed table: an unbounded
/// predicate targets all data-bearing shards, and an unsharded namespace
/// always targets its primary shard.
#[must_use]
pub fn target_shards(table: &RoutingTable, predicate: &QueryPredicate) -> BTreeSet<ShardId> {
    match predicate {
        QueryPredicate::ShardKeyPoint(hash) => {
            let mut set = BTreeSet::new();
            if let Some(shard) = table.lookup(*hash) {
                set.insert(shard);
            }
            set
        }
        QueryPredicate::ShardKeyRange(range) => table.shards_for_range(range),
        QueryPredicate::Unbounded => table.all_shards(),
    }
}
