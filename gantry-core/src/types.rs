//! Strongly-typed identifiers for Gantry entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `ShardId` with `CursorId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster topology.
define_id!(ShardId, "shard", "Unique identifier for a shard in the cluster.");

// Cursor identification.
define_id!(
    CursorId,
    "cursor",
    "Router-side identifier for a registered cluster cursor."
);
define_id!(
    RemoteCursorId,
    "rcursor",
    "Shard-side identifier for a remote cursor held open on one shard."
);

// Request identity.
define_id!(SessionId, "session", "Logical session identifier attached to an operation.");
define_id!(TxnNumber, "txn", "Transaction number within a logical session.");
define_id!(
    OperationKey,
    "opkey",
    "Tracking key shared by all remote requests of one fan-out, so a caller-side cancellation covers them all."
);

// Routing metadata versions.
define_id!(
    RoutingVersion,
    "rtv",
    "Version of a collection routing table; disagreement with a shard means the cached table is stale."
);
define_id!(
    DatabaseVersion,
    "dbv",
    "Version of a database's placement metadata, stamped on requests to unsharded collections."
);

// Collection identity.
define_id!(
    CollectionUuid,
    "cuuid",
    "Collection identity token used to detect renames/drops between routing and execution."
);

impl CursorId {
    /// The zero cursor id: "fully drained, no server-side cursor to track".
    pub const ZERO: Self = Self(0);

    /// Returns true if this is the zero (no cursor) identifier.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// A fully-qualified collection namespace (`database.collection`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Creates a namespace from database and collection names.
    #[must_use]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the collection name.
    #[must_use]
    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
