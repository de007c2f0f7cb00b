//! The retrying query coordinator.
//!
//! `run_query` targets shards from a routing snapshot, establishes remote
//! cursors, and drains a first batch from the merged stream. Whenever a
//! shard proves the snapshot stale, the cached entry is invalidated and the
//! whole targeting + establishment step is retried, up to a fixed attempt
//! ceiling. The caller sees exactly one outcome: a batch with a cursor id
//! (zero when fully drained), or a single terminal error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_core::{
    CursorId, Document, Limits, OpContext, OperationKey, ShardId, SortPattern,
    RESERVED_SORT_KEY_FIELD,
};
use gantry_cursor::{
    establish_cursors, CursorLifetime, CursorRegistry, CursorState, CursorType, FindRequest,
    MergeCursor, MergeCursorParams, ReadPreference, RemoteError, ShardCursorRequest, ShardService,
    SortKeyExtraction,
};
use gantry_routing::{target_shards, CatalogCache, RoutingTable};
use rand::Rng;
use tracing::debug;

use crate::error::RouterError;
use crate::response::ResponseSizeTracker;

/// Outcome of a successful `run_query`.
#[derive(Debug)]
pub struct QueryResult {
    /// Zero when the query drained completely; otherwise the registered
    /// cursor to continue from.
    pub cursor_id: CursorId,
    /// The first batch of documents.
    pub batch: Vec<Document>,
    /// True when unresponsive shards were dropped from the result.
    pub partial_results_returned: bool,
}

/// The cluster-facing query router.
pub struct QueryRouter {
    catalog: Arc<CatalogCache>,
    shards: Arc<dyn ShardService>,
    registry: Arc<CursorRegistry>,
    limits: Limits,
}

impl QueryRouter {
    /// Creates a router over the given collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<CatalogCache>,
        shards: Arc<dyn ShardService>,
        registry: Arc<CursorRegistry>,
        limits: Limits,
    ) -> Self {
        Self {
            catalog,
            shards,
            registry,
            limits,
        }
    }

    /// Returns the cursor registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CursorRegistry> {
        &self.registry
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Runs a query and drains its first batch.
    ///
    /// # Errors
    ///
    /// Returns a [`RouterError`]; stale-routing failures are only surfaced
    /// after the attempt ceiling, wrapped with attempt-count context.
    pub async fn run_query(
        &self,
        ctx: &OpContext,
        query: &FindRequest,
        read_pref: ReadPreference,
    ) -> Result<QueryResult, RouterError> {
        // Validation failures are terminal; they never enter the retry loop.
        if query.projection.iter().any(|field| field == RESERVED_SORT_KEY_FIELD) {
            return Err(RouterError::InvalidQuery {
                reason: format!("projection contains reserved field '{RESERVED_SORT_KEY_FIELD}'"),
            });
        }
        if query.request_resume_token {
            return Err(RouterError::InvalidQuery {
                reason: "router queries may not request or provide a resume token".to_string(),
            });
        }
        if query.tailable.is_tailable() && (query.router_sort().is_some() || query.geo_near) {
            return Err(RouterError::InvalidQuery {
                reason: "tailable cursor cannot have a sort".to_string(),
            });
        }

        let max_attempts = self.limits.max_routing_attempts;
        let mut forced_targets: Option<BTreeSet<ShardId>> = None;

        for attempt in 1..=max_attempts {
            let Some(table) = self.catalog.snapshot(&query.namespace).await else {
                if let Some(expected) = query.collection_uuid {
                    // The client pinned a collection identity, but there is
                    // no such namespace at all.
                    return Err(RouterError::CollectionUuidMismatch {
                        expected,
                        actual_namespace: None,
                    });
                }
                debug!(namespace = %query.namespace, "namespace unknown; returning empty result set");
                return Ok(QueryResult {
                    cursor_id: CursorId::ZERO,
                    batch: Vec::new(),
                    partial_results_returned: false,
                });
            };

            let targets = forced_targets
                .take()
                .unwrap_or_else(|| target_shards(&table, &query.predicate));

            match self.run_query_once(ctx, query, read_pref, &table, &targets).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_stale_routing() => {
                    if attempt >= max_attempts {
                        return Err(RouterError::RetriesExhausted {
                            attempts: max_attempts,
                            source: Box::new(error),
                        });
                    }

                    debug!(
                        namespace = %query.namespace,
                        attempt,
                        max_attempts,
                        error = %error,
                        "stale routing; invalidating cache entry and retrying"
                    );
                    match &error {
                        RouterError::Remote(RemoteError::StaleDatabaseVersion { db, .. }) => {
                            self.catalog.invalidate_database(db);
                        }
                        RouterError::Remote(RemoteError::StaleShardVersion { shard, wanted }) => {
                            self.catalog.invalidate_shard(&query.namespace, *wanted, *shard);
                        }
                        _ => self.catalog.invalidate_collection(&query.namespace),
                    }

                    if let Some(txn) = ctx.txn {
                        if !txn.can_continue_on_stale_error {
                            return Err(error);
                        }
                    }
                }
                Err(error) => {
                    if let RouterError::CollectionUuidMismatch {
                        actual_namespace: None,
                        ..
                    } = &error
                    {
                        // The shard could not name the actual collection and
                        // the primary was never asked: probe the primary
                        // before giving up.
                        if attempt < max_attempts && !targets.contains(&table.primary_shard()) {
                            debug!(
                                namespace = %query.namespace,
                                primary = %table.primary_shard(),
                                "identity mismatch without an actual collection; probing the primary shard"
                            );
                            forced_targets = Some(BTreeSet::from([table.primary_shard()]));
                            continue;
                        }
                    }
                    return Err(error);
                }
            }
        }

        Err(RouterError::Internal {
            message: "routing retry loop exited without a result".to_string(),
        })
    }

    /// Kills a registered cursor at the client's request.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::CursorNotFound`], [`RouterError::CursorInUse`],
    /// or [`RouterError::Unauthorized`].
    pub async fn kill_cursor(&self, ctx: &OpContext, cursor_id: CursorId) -> Result<(), RouterError> {
        let pinned = self
            .registry
            .checkout(cursor_id, Instant::now(), |stored| ctx.is_coauthorized(stored))?;
        if let Some(cursor) = pinned.return_cursor(CursorState::Exhausted, Instant::now()) {
            cursor.close().await;
        }
        debug!(cursor_id = %cursor_id, "cursor killed by client request");
        Ok(())
    }

    /// Reclaims unpinned mortal cursors idle past the configured timeout and
    /// closes their remotes. Returns how many were reclaimed.
    pub async fn reap_idle_cursors(&self, now: Instant) -> u32 {
        let idle_timeout = Duration::from_micros(self.limits.cursor_timeout_us);
        let mut count = 0;
        for (cursor_id, cursor) in self.registry.reap_idle(now, idle_timeout) {
            debug!(cursor_id = %cursor_id, "closing reaped cursor");
            cursor.close().await;
            count += 1;
        }
        count
    }

    /// One targeting + establishment + first-batch attempt.
    async fn run_query_once(
        &self,
        ctx: &OpContext,
        query: &FindRequest,
        read_pref: ReadPreference,
        table: &RoutingTable,
        targets: &BTreeSet<ShardId>,
    ) -> Result<QueryResult, RouterError> {
        let multi = targets.len() > 1;

        // With no client sort, a geo-nearest query still merges ordered: by
        // the distance scalar each shard tags documents with.
        let router_sort = query.router_sort();
        let (merge_sort, nearest_distance) = if router_sort.is_none() && query.geo_near {
            (Some(SortPattern::whole_key()), true)
        } else {
            (router_sort, false)
        };

        let mut params = MergeCursorParams::new(query.clone(), ctx, read_pref);
        if multi {
            // Skip, limit, and the merge sort only run at the router when
            // several shards feed it; a single shard applies them itself.
            params.sort = merge_sort.clone();
            params.skip = query.skip;
            params.limit = query.limit;
        }

        let shard_query = Self::rewrite_for_shards(query, multi)?;
        let extract_sort_key = if !multi {
            SortKeyExtraction::None
        } else if nearest_distance {
            SortKeyExtraction::NearestDistance
        } else {
            merge_sort.map_or(SortKeyExtraction::None, SortKeyExtraction::ByPattern)
        };

        // Pick the shard to sample the query on, if the sampler selected it.
        let sample_shard = if ctx.query_sampling && !targets.is_empty() {
            let index = rand::thread_rng().gen_range(0..targets.len());
            targets.iter().nth(index).copied()
        } else {
            None
        };

        let operation_key = OperationKey::new(rand::random());
        let requests: Vec<ShardCursorRequest> = targets
            .iter()
            .map(|&shard| ShardCursorRequest {
                shard,
                query: shard_query.clone(),
                stamp: table.stamp(),
                read_preference: read_pref,
                extract_sort_key: extract_sort_key.clone(),
                session: ctx.session,
                txn_number: ctx.txn_number,
                sample_query: Some(shard) == sample_shard,
                operation_key,
            })
            .collect();

        // With partial results allowed, reserve part of the time budget so
        // an establishment timeout can still be turned into a success.
        let mut establish_deadline = ctx.deadline;
        if query.allow_partial_results {
            if let (Some(deadline), Some(max_time)) = (ctx.deadline, query.max_time) {
                let reserve = (max_time / 4)
                    .min(Duration::from_micros(self.limits.partial_results_reserve_cap_us));
                let earlier = deadline.checked_sub(reserve).unwrap_or(deadline);
                debug!(namespace = %query.namespace, "installed earlier artificial deadline for partial results");
                establish_deadline = Some(earlier);
            }
        }

        let established = establish_cursors(
            &self.shards,
            requests,
            query.allow_partial_results,
            establish_deadline,
        )
        .await?;

        let mut merge = MergeCursor::new(Arc::clone(&self.shards), params, established);

        // The router deadline may have expired while establishment was
        // still in flight. Give the remotes a bounded window to observe the
        // expiry; only then can a timeout become a partial-result success.
        if query.allow_partial_results && ctx.deadline_expired(Instant::now()) {
            let mut polls_left = self.limits.max_partial_wait_polls;
            while !merge.remotes_exhausted() {
                if polls_left == 0 {
                    debug!(
                        namespace = %query.namespace,
                        "deadline expired on the router but remotes are still live; surfacing the timeout"
                    );
                    merge.close().await;
                    return Err(RouterError::ExceededTimeLimit);
                }
                polls_left -= 1;
                tokio::time::sleep(Duration::from_micros(
                    self.limits.partial_wait_poll_interval_us,
                ))
                .await;
            }
        }

        // Drain enough for a full first batch. The initial documents come
        // from the establishment replies; further pulls fetch from remotes.
        let mut batch = Vec::new();
        let mut tracker = ResponseSizeTracker::new(self.limits.max_reply_bytes);
        let first_batch_target = query
            .batch_size
            .filter(|&size| size > 0)
            .unwrap_or(self.limits.default_batch_size) as usize;
        let mut state = CursorState::NotExhausted;

        while batch.len() < first_batch_target {
            let next = match merge.next(ctx).await {
                Ok(next) => next,
                Err(error) => {
                    merge.close().await;
                    return Err(error.into());
                }
            };

            let Some(doc) = next else {
                // End of this pull. A tailable cursor stays open on "no data
                // yet" unless every remote stream has ended for good.
                if !merge.params().tailable.is_tailable() || merge.remotes_exhausted() {
                    state = CursorState::Exhausted;
                }
                break;
            };

            if !tracker.fits(&doc) {
                merge.queue_result(doc);
                break;
            }
            tracker.add(&doc);
            batch.push(doc);
        }

        if query.single_batch && !merge.params().tailable.is_tailable() {
            state = CursorState::Exhausted;
        }

        let partial_results_returned = merge.partial_results_returned();
        let metrics = *merge.metrics();

        if state == CursorState::Exhausted {
            debug!(
                namespace = %query.namespace,
                shards = metrics.remotes_targeted,
                docs = metrics.docs_returned,
                bytes = metrics.bytes_returned,
                "query drained in its first batch"
            );
            merge.close().await;
            return Ok(QueryResult {
                cursor_id: CursorId::ZERO,
                batch,
                partial_results_returned,
            });
        }

        // The cursor lives on: hand it to the registry for continuations.
        merge.set_leftover_max_time(ctx.remaining_time(Instant::now()));
        let lifetime = if query.no_cursor_timeout {
            CursorLifetime::Immortal
        } else {
            CursorLifetime::Mortal
        };
        let cursor_type = if multi {
            CursorType::MultiTarget
        } else {
            CursorType::SingleTarget
        };
        let cursor_id = self.registry.register(
            merge,
            cursor_type,
            lifetime,
            ctx.principal.clone(),
            Instant::now(),
        );
        debug!(
            cursor_id = %cursor_id,
            namespace = %query.namespace,
            shards = metrics.remotes_targeted,
            docs = metrics.docs_returned,
            "registered cursor for continuation"
        );

        Ok(QueryResult {
            cursor_id,
            batch,
            partial_results_returned,
        })
    }

    /// Rewrites a request for per-shard execution.
    ///
    /// A single-shard query is forwarded unchanged: skip and limit apply
    /// remotely. With several shards, skip is withheld and the limit grows
    /// to `skip + limit` so every shard returns enough candidates for the
    /// router to apply both after the merge.
    fn rewrite_for_shards(query: &FindRequest, multi: bool) -> Result<FindRequest, RouterError> {
        let mut shard_query = query.clone();
        if !multi {
            return Ok(shard_query);
        }

        if let Some(limit) = query.limit {
            let skip = query.skip.unwrap_or(0);
            let combined = limit
                .checked_add(skip)
                .ok_or(RouterError::SkipLimitOverflow { skip, limit })?;
            shard_query.limit = Some(combined);
        }
        shard_query.skip = None;
        // A shard may need several of its own batches to fill the single
        // batch the client asked for.
        shard_query.single_batch = false;
        Ok(shard_query)
    }
}
