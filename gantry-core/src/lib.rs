//! Gantry Core - Strongly-typed identifiers and shared value types for Gantry.
//!
//! This crate provides the types shared by every other Gantry crate: typed
//! IDs, the system-wide limits, opaque documents with extracted sort keys,
//! and the per-operation context.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a ShardId with a CursorId
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod context;
mod document;
mod limits;
mod sort;
mod types;

pub use context::{ApiParameters, OpContext, Principal, TxnContext};
pub use document::Document;
pub use limits::Limits;
pub use sort::{SortDirection, SortKey, SortPattern, SortValue, RESERVED_SORT_KEY_FIELD};
pub use types::{
    CollectionUuid, CursorId, DatabaseVersion, Namespace, OperationKey, RemoteCursorId,
    RoutingVersion, SessionId, ShardId, TxnNumber,
};
