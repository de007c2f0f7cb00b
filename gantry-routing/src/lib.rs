//! Gantry Routing - Shard targeting under versioned routing tables.
//!
//! This crate maps a query's targeting predicate to the set of shards that
//! own the matching portion of the keyspace, using per-namespace routing
//! table snapshots that are cached locally and can go stale at any moment.
//!
//! # Design (`TigerStyle`)
//!
//! - **Immutable snapshots**: One `Arc<RoutingTable>` per targeting attempt
//! - **Explicit invalidation**: Stale versions evict cache entries, never mutate them
//! - **Explicit limits**: All resources are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod catalog;
mod routing_table;
mod target;

pub use catalog::{CatalogCache, RoutingSource};
pub use routing_table::{KeyRange, RoutingStamp, RoutingTable, RoutingTableError};
pub use target::{target_shards, QueryPredicate};
