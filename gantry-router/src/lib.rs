//! Gantry Router - The cluster-facing query entry points.
//!
//! [`QueryRouter::run_query`] resolves a routing snapshot, fans a query out
//! to the targeted shards, drains a first batch from the merged stream, and
//! either finishes with the zero cursor id or registers the cursor for
//! continuations. Targeting and establishment retry, boundedly, whenever a
//! shard proves the routing snapshot stale.
//!
//! [`QueryRouter::run_get_more`] checks a registered cursor out of the
//! registry, validates that the caller is the one the cursor was created
//! for, drains further results, and returns or deletes the cursor - on
//! every path, including errors.
//!
//! # Design (`TigerStyle`)
//!
//! - **Bounded retries**: Stale routing is retried a fixed number of times
//! - **Guarded pins**: A checked-out cursor is always returned
//! - **Explicit limits**: Reply sizes and wait loops are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod find;
mod getmore;
mod response;

pub use error::RouterError;
pub use find::{QueryResult, QueryRouter};
pub use getmore::{CursorResponse, GetMoreRequest};
