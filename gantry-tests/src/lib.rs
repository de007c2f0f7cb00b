//! Gantry Tests - Integration tests for the query router.
//!
//! Tests here drive [`gantry_router::QueryRouter`] end to end over a
//! scripted in-process cluster ([`mock_shard::MockCluster`]), which plays
//! both the routing lookup service and the remote command dispatcher.
//!
//! ## Test Organization
//!
//! - `find_tests`: targeting, retry-on-stale, first-batch, partial results
//! - `getmore_tests`: pin discipline, identity validation, continuation
//!   drains, stream invalidation
//!
//! Unit tests live inline in each crate under `#[cfg(test)]`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod mock_shard;

#[cfg(test)]
mod find_tests;
#[cfg(test)]
mod getmore_tests;
