//! Canonical read requests as the router sees them.
//!
//! Statement parsing and validation happen upstream; a [`FindRequest`] is the
//! already-canonical form. The router only inspects the fields that drive
//! targeting, per-shard rewriting, and merge behavior.

use std::time::Duration;

use gantry_core::{CollectionUuid, Namespace, SortPattern};
use gantry_routing::QueryPredicate;

/// Tailable behavior of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailableMode {
    /// Ordinary cursor: end-of-stream exhausts it.
    #[default]
    Normal,
    /// Tailable cursor: end-of-stream means "no data yet".
    Tailable,
    /// Tailable cursor whose continuations block waiting for new data.
    TailableAwaitData,
}

impl TailableMode {
    /// Returns true for either tailable variant.
    #[must_use]
    pub const fn is_tailable(self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// Returns true for the await-data variant.
    #[must_use]
    pub const fn is_await_data(self) -> bool {
        matches!(self, Self::TailableAwaitData)
    }
}

/// Where reads may be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Primary members only.
    #[default]
    Primary,
    /// Primary if available, otherwise a secondary.
    PrimaryPreferred,
    /// Secondary members only.
    Secondary,
    /// A secondary if available, otherwise the primary.
    SecondaryPreferred,
    /// Whichever member answers fastest.
    Nearest,
}

/// Read isolation requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcern {
    /// Node-local reads.
    Local,
    /// Majority-committed reads.
    Majority,
    /// Snapshot reads at a cluster time.
    Snapshot,
}

/// A canonical read request.
#[derive(Debug, Clone)]
pub struct FindRequest {
    /// Collection to read.
    pub namespace: Namespace,
    /// Shard-key component of the predicate, for targeting.
    pub predicate: QueryPredicate,
    /// Client sort, reduced to merge directions.
    pub sort: Option<SortPattern>,
    /// The sort was a storage-order hint, not an ordering request.
    pub natural_scan: bool,
    /// The predicate contains a geo-nearest clause.
    pub geo_near: bool,
    /// Documents to skip before returning any.
    pub skip: Option<u64>,
    /// Maximum documents to return over the cursor's lifetime.
    pub limit: Option<u64>,
    /// Documents per reply batch. Zero means "use the default".
    pub batch_size: Option<u32>,
    /// Close the cursor after the first batch.
    pub single_batch: bool,
    /// Tailable behavior.
    pub tailable: TailableMode,
    /// Whether unresponsive shards may be dropped from the result.
    pub allow_partial_results: bool,
    /// Exempt the cursor from idle-timeout reclamation.
    pub no_cursor_timeout: bool,
    /// Total time budget for the operation.
    pub max_time: Option<Duration>,
    /// Read isolation.
    pub read_concern: Option<ReadConcern>,
    /// Projected field names, used only to reject reserved fields.
    pub projection: Vec<String>,
    /// Expected collection identity, when the client pinned one.
    pub collection_uuid: Option<CollectionUuid>,
    /// The client asked for a resume token, which routers do not support.
    pub request_resume_token: bool,
}

impl FindRequest {
    /// Creates a request with only a namespace and predicate; everything
    /// else takes its default.
    #[must_use]
    pub fn new(namespace: Namespace, predicate: QueryPredicate) -> Self {
        Self {
            namespace,
            predicate,
            sort: None,
            natural_scan: false,
            geo_near: false,
            skip: None,
            limit: None,
            batch_size: None,
            single_batch: false,
            tailable: TailableMode::Normal,
            allow_partial_results: false,
            no_cursor_timeout: false,
            max_time: None,
            read_concern: None,
            projection: Vec::new(),
            collection_uuid: None,
            request_resume_token: false,
        }
    }

    /// Sets the sort pattern.
    #[must_use]
    pub fn with_sort(mut self, sort: SortPattern) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sets skip.
    #[must_use]
    pub const fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets tailable behavior.
    #[must_use]
    pub const fn with_tailable(mut self, tailable: TailableMode) -> Self {
        self.tailable = tailable;
        self
    }

    /// Allows partial results from unresponsive shards.
    #[must_use]
    pub const fn with_allow_partial_results(mut self) -> Self {
        self.allow_partial_results = true;
        self
    }

    /// Sets the operation time budget.
    #[must_use]
    pub const fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// The sort the router should merge by, if any.
    ///
    /// A storage-order hint is not an ordering request, so it never produces
    /// a merge sort.
    #[must_use]
    pub fn router_sort(&self) -> Option<SortPattern> {
        if self.natural_scan {
            return None;
        }
        self.sort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::SortDirection;

    fn request() -> FindRequest {
        FindRequest::new(
            Namespace::new("app", "orders"),
            QueryPredicate::Unbounded,
        )
    }

    #[test]
    fn test_tailable_mode() {
        assert!(!TailableMode::Normal.is_tailable());
        assert!(TailableMode::Tailable.is_tailable());
        assert!(TailableMode::TailableAwaitData.is_tailable());
        assert!(TailableMode::TailableAwaitData.is_await_data());
        assert!(!TailableMode::Tailable.is_await_data());
    }

    #[test]
    fn test_router_sort_ignores_natural_scan() {
        let mut req = request().with_sort(SortPattern::new(vec![SortDirection::Ascending]));
        assert!(req.router_sort().is_some());

        req.natural_scan = true;
        assert!(req.router_sort().is_none());
    }
}
