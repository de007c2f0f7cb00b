//! Gantry Cursor - Remote cursor fan-out and merged cluster cursors.
//!
//! This crate turns N per-shard result streams into one logical cursor:
//!
//! - [`establish_cursors`] opens one remote cursor per targeted shard,
//!   concurrently, with routing stamps attached
//! - [`MergeCursor`] merges the remote streams honoring sort/skip/limit
//! - [`CursorRegistry`] keeps partially-drained cursors alive between client
//!   continuation calls under an exclusive pin discipline
//!
//! # Design (`TigerStyle`)
//!
//! - **Single ownership**: A registered cursor is owned by the registry;
//!   an operation touches it only through a checked-out pin
//! - **No lost documents**: Overflow documents are given back to the cursor,
//!   never dropped
//! - **Explicit limits**: Buffers and queues are bounded

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod merge;
mod params;
mod query;
mod registry;
mod remote;

pub use merge::{CursorError, CursorMetrics, MergeCursor};
pub use params::MergeCursorParams;
pub use query::{FindRequest, ReadConcern, ReadPreference, TailableMode};
pub use registry::{
    CursorLifetime, CursorRegistry, CursorState, CursorType, PinnedCursor, RegistryError,
};
pub use remote::{
    establish_cursors, EstablishedCursors, RemoteCursor, RemoteError, RemoteResult,
    ShardCursorReply, ShardCursorRequest, ShardService, SortKeyExtraction,
};
