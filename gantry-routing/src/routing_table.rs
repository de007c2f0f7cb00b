//! Routing table - mapping of key ranges to shards.
//!
//! The routing table defines which shard owns which portion of a
//! collection's keyspace. Shard keys are hashed and the hash value
//! determines the owning shard. Every table carries a version; a shard that
//! disagrees with the stamped version rejects the request, which is how the
//! router learns its snapshot went stale.

use std::collections::{BTreeMap, BTreeSet};

use gantry_core::{DatabaseVersion, RoutingVersion, ShardId};

/// Maximum number of key ranges in one routing table.
pub const KEY_RANGES_MAX: u32 = 65_536;

/// A range of shard-key hashes [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    /// Start of the range (inclusive).
    pub start: u32,
    /// End of the range (exclusive).
    pub end: u32,
}

impl KeyRange {
    /// Creates a new key range.
    ///
    /// # Panics
    ///
    /// Panics if start >= end.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        assert!(start < end, "key range start must be < end");
        Self { start, end }
    }

    /// Returns true if this range contains the given hash value.
    #[must_use]
    pub const fn contains(&self, hash: u32) -> bool {
        hash >= self.start && hash < self.end
    }

    /// Returns true if this range overlaps the other range.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the number of hash values in this range.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.end - self.start
    }
}

/// The routing stamp attached to a per-shard request.
///
/// A shard compares the stamp against its own view of placement and rejects
/// the request when they disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStamp {
    /// The namespace is sharded; the request is stamped with the routing
    /// table version the router targeted under.
    Sharded {
        /// Version of the routing table used for targeting.
        shard_version: RoutingVersion,
    },
    /// The namespace has no sharding metadata; the request is stamped with
    /// the database placement version instead.
    Unsharded {
        /// Version of the database's placement metadata.
        db_version: DatabaseVersion,
    },
}

/// Entry in the routing table.
#[derive(Debug, Clone)]
struct RangeEntry {
    /// The key range this entry covers.
    range: KeyRange,
    /// The shard owning this range.
    shard_id: ShardId,
}

/// Versioned mapping of a collection's keyspace to owning shards.
///
/// Instances are immutable snapshots: the catalog cache hands out an `Arc`
/// per targeting attempt and replaces the whole table on refresh.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Map from range start to entry, for efficient hash lookups.
    ranges: BTreeMap<u32, RangeEntry>,
    /// Routing version of this snapshot.
    version: RoutingVersion,
    /// Database placement version, stamped when the namespace is unsharded.
    db_version: DatabaseVersion,
    /// The shard hosting the namespace's database primary.
    primary_shard: ShardId,
    /// Whether the namespace has sharding metadata at all.
    sharded: bool,
}

impl RoutingTable {
    /// Creates a table for an unsharded namespace: everything lives on the
    /// database primary shard.
    #[must_use]
    pub fn unsharded(primary_shard: ShardId, db_version: DatabaseVersion) -> Self {
        Self {
            ranges: BTreeMap::new(),
            version: RoutingVersion::new(0),
            db_version,
            primary_shard,
            sharded: false,
        }
    }

    /// Creates a sharded table distributing the keyspace uniformly across
    /// the given shards. The first shard doubles as the database primary.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is empty or exceeds `KEY_RANGES_MAX`.
    #[must_use]
    pub fn uniform(shards: &[ShardId], version: RoutingVersion) -> Self {
        assert!(!shards.is_empty(), "shards cannot be empty");
        assert!(
            shards.len() <= KEY_RANGES_MAX as usize,
            "too many shards: {} > {}",
            shards.len(),
            KEY_RANGES_MAX
        );

        let mut ranges = BTreeMap::new();
        // Safety: length is bounded by KEY_RANGES_MAX (65_536) which fits in u32.
        #[allow(clippy::cast_possible_truncation)]
        let shard_count = shards.len() as u32;
        let range_size = u32::MAX / shard_count;

        for (i, &shard_id) in shards.iter().enumerate() {
            // Safety: i < shard_count which fits in u32.
            #[allow(clippy::cast_possible_truncation)]
            let i = i as u32;
            let start = i.saturating_mul(range_size);
            let end = if i == shard_count - 1 {
                u32::MAX
            } else {
                (i + 1).saturating_mul(range_size)
            };

            let range = KeyRange::new(start, end);
            ranges.insert(start, RangeEntry { range, shard_id });
        }

        Self {
            ranges,
            version,
            db_version: DatabaseVersion::new(1),
            primary_shard: shards[0],
            sharded: true,
        }
    }

    /// Assigns a key range to a shard, replacing any assignment starting at
    /// the same hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the table already holds `KEY_RANGES_MAX` ranges.
    pub fn assign(&mut self, range: KeyRange, shard_id: ShardId) -> Result<(), RoutingTableError> {
        if self.ranges.len() >= KEY_RANGES_MAX as usize && !self.ranges.contains_key(&range.start)
        {
            return Err(RoutingTableError::TooManyRanges {
                count: self.ranges.len(),
                max: KEY_RANGES_MAX,
            });
        }

        self.ranges.insert(range.start, RangeEntry { range, shard_id });
        self.version = RoutingVersion::new(self.version.get() + 1);
        self.sharded = true;
        Ok(())
    }

    /// Returns the shard owning the given key hash.
    #[must_use]
    pub fn lookup(&self, hash: u32) -> Option<ShardId> {
        if !self.sharded {
            return Some(self.primary_shard);
        }
        // Find the entry with the largest start <= hash.
        self.ranges
            .range(..=hash)
            .next_back()
            .filter(|(_, entry)| entry.range.contains(hash))
            .map(|(_, entry)| entry.shard_id)
    }

    /// Returns the shards owning any part of the given hash range.
    #[must_use]
    pub fn shards_for_range(&self, range: &KeyRange) -> BTreeSet<ShardId> {
        if !self.sharded {
            let mut set = BTreeSet::new();
            set.insert(self.primary_shard);
            return set;
        }
        self.ranges
            .values()
            .filter(|entry| entry.range.overlaps(range))
            .map(|entry| entry.shard_id)
            .collect()
    }

    /// Returns every shard owning at least one range.
    #[must_use]
    pub fn all_shards(&self) -> BTreeSet<ShardId> {
        if !self.sharded {
            let mut set = BTreeSet::new();
            set.insert(self.primary_shard);
            return set;
        }
        self.ranges.values().map(|entry| entry.shard_id).collect()
    }

    /// Returns the routing stamp for a request to the given shard.
    #[must_use]
    pub const fn stamp(&self) -> RoutingStamp {
        if self.sharded {
            RoutingStamp::Sharded {
                shard_version: self.version,
            }
        } else {
            RoutingStamp::Unsharded {
                db_version: self.db_version,
            }
        }
    }

    /// Returns the routing version of this snapshot.
    #[must_use]
    pub const fn version(&self) -> RoutingVersion {
        self.version
    }

    /// Returns the database placement version.
    #[must_use]
    pub const fn db_version(&self) -> DatabaseVersion {
        self.db_version
    }

    /// Returns the database primary shard.
    #[must_use]
    pub const fn primary_shard(&self) -> ShardId {
        self.primary_shard
    }

    /// Returns true if the namespace has sharding metadata.
    #[must_use]
    pub const fn is_sharded(&self) -> bool {
        self.sharded
    }

    /// Returns the number of key ranges in the table.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

/// Errors from routing table construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTableError {
    /// Too many key ranges.
    TooManyRanges {
        /// Current count.
        count: usize,
        /// Maximum allowed.
        max: u32,
    },
}

impl std::fmt::Display for RoutingTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyRanges { count, max } => {
                write!(f, "too many key ranges: {count} (max {max})")
            }
        }
    }
}

impl std::error::Error for RoutingTableError {}
