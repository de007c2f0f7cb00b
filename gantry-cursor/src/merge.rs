//! The merged cluster cursor.
//!
//! A [`MergeCursor`] composes N remote cursor streams into one logical
//! stream. With a sort configured it always yields the smallest pending
//! document across remotes, comparing extracted sort keys only; without one
//! it round-robins, preserving each remote's own order. Router-side skip and
//! limit are applied here, and a give-back queue lets callers return a
//! document that did not fit the current reply so it is neither dropped nor
//! duplicated across batch boundaries.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{Document, OpContext, RemoteCursorId, ShardId, SortPattern};
use thiserror::Error;
use tracing::debug;

use crate::params::MergeCursorParams;
use crate::remote::{EstablishedCursors, RemoteError, ShardService};

/// Maximum documents parked in the give-back queue.
const QUEUED_RESULTS_MAX: usize = 16;

/// Errors from merged-stream pulls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CursorError {
    /// A remote pull failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A sorted merge received a document without an extracted sort key.
    #[error("document from {shard} is missing its extracted sort key")]
    MissingSortKey {
        /// The shard that returned the untagged document.
        shard: ShardId,
    },
}

/// Cumulative counters for one merged cursor.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorMetrics {
    /// Shards targeted at establishment, including any dropped for partial
    /// results.
    pub remotes_targeted: u32,
    /// Documents handed to the caller so far.
    pub docs_returned: u64,
    /// Encoded bytes handed to the caller so far.
    pub bytes_returned: u64,
    /// Remote continuation batches pulled so far.
    pub remote_batches: u32,
}

/// One remote stream inside the merge.
#[derive(Debug)]
struct RemoteStream {
    shard: ShardId,
    /// Continuation handle; `None` once the shard's stream is exhausted.
    cursor: Option<RemoteCursorId>,
    buffer: VecDeque<Document>,
}

impl RemoteStream {
    const fn exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    fn drained(&self) -> bool {
        self.exhausted() && self.buffer.is_empty()
    }
}

/// N remote cursor streams presented as one logical stream.
pub struct MergeCursor {
    service: Arc<dyn ShardService>,
    params: MergeCursorParams,
    remotes: Vec<RemoteStream>,
    /// Documents given back by the caller, served before any new pull.
    queued: VecDeque<Document>,
    skip_remaining: u64,
    limit_remaining: Option<u64>,
    /// Round-robin position for unordered merges.
    next_remote: usize,
    partial_results: bool,
    /// Time budget left over for the next continuation call.
    leftover_max_time: Option<Duration>,
    metrics: CursorMetrics,
}

impl MergeCursor {
    /// Builds a merged cursor over freshly established remotes.
    ///
    /// # Panics
    ///
    /// Panics if the params carry both a merge sort and a tailable mode;
    /// that combination is rejected during request validation.
    #[must_use]
    pub fn new(
        service: Arc<dyn ShardService>,
        params: MergeCursorParams,
        established: EstablishedCursors,
    ) -> Self {
        assert!(
            params.sort.is_none() || !params.tailable.is_tailable(),
            "tailable cursor cannot have a merge sort"
        );

        let remotes: Vec<RemoteStream> = established
            .remotes
            .into_iter()
            .map(|remote| RemoteStream {
                shard: remote.shard,
                cursor: remote.cursor,
                buffer: remote.initial_batch.into(),
            })
            .collect();

        // Safety: fan-out width is far below u32::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let remotes_targeted = (remotes.len() + established.skipped_shards.len()) as u32;

        Self {
            service,
            skip_remaining: params.skip.unwrap_or(0),
            limit_remaining: params.limit,
            partial_results: !established.skipped_shards.is_empty(),
            params,
            remotes,
            queued: VecDeque::new(),
            next_remote: 0,
            leftover_max_time: None,
            metrics: CursorMetrics {
                remotes_targeted,
                ..CursorMetrics::default()
            },
        }
    }

    /// Pulls the next merged document.
    ///
    /// `Ok(None)` means this pull found nothing, which is end-of-stream for
    /// an ordinary cursor but only "no data yet" for a tailable one; check
    /// [`Self::remotes_exhausted`] to tell the two apart.
    ///
    /// # Errors
    ///
    /// Returns the remote failure, unless the cursor allows partial results
    /// and the failure is timeout-class, in which case the remote is dropped
    /// and the pull continues.
    pub async fn next(&mut self, ctx: &OpContext) -> Result<Option<Document>, CursorError> {
        if let Some(doc) = self.queued.pop_front() {
            self.note_returned(&doc);
            return Ok(Some(doc));
        }

        loop {
            if self.limit_remaining == Some(0) {
                self.close_remotes().await;
                return Ok(None);
            }

            let doc = match self.params.sort.clone() {
                Some(sort) => self.next_sorted(&sort, ctx).await?,
                None => self.next_unsorted(ctx).await?,
            };

            let Some(doc) = doc else {
                return Ok(None);
            };

            if self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }

            self.note_returned(&doc);
            return Ok(Some(doc));
        }
    }

    /// Gives a document back to the cursor.
    ///
    /// The document is served again, unchanged, before any new pull. Used
    /// when a fetched document does not fit the current reply-size budget.
    ///
    /// # Panics
    ///
    /// Panics if the give-back queue overflows its fixed bound.
    pub fn queue_result(&mut self, doc: Document) {
        assert!(
            self.queued.len() < QUEUED_RESULTS_MAX,
            "give-back queue overflow"
        );
        // The document was accounted as returned when it was pulled; it is
        // now owed to the caller again.
        self.metrics.docs_returned = self.metrics.docs_returned.saturating_sub(1);
        self.metrics.bytes_returned = self.metrics.bytes_returned.saturating_sub(doc.size_bytes());
        if let Some(limit) = &mut self.limit_remaining {
            *limit += 1;
        }
        self.queued.push_back(doc);
    }

    /// Returns true when every remote stream has ended and its buffer is
    /// empty. A queued give-back document may still be pending; see
    /// [`Self::is_fully_drained`].
    #[must_use]
    pub fn remotes_exhausted(&self) -> bool {
        self.remotes.iter().all(RemoteStream::drained)
    }

    /// Returns true when nothing more can ever be returned.
    #[must_use]
    pub fn is_fully_drained(&self) -> bool {
        self.remotes_exhausted() && self.queued.is_empty()
    }

    /// Returns true if any targeted shard was dropped from the result.
    #[must_use]
    pub const fn partial_results_returned(&self) -> bool {
        self.partial_results
    }

    /// Returns the creation-time configuration.
    #[must_use]
    pub const fn params(&self) -> &MergeCursorParams {
        &self.params
    }

    /// Returns the cumulative counters.
    #[must_use]
    pub const fn metrics(&self) -> &CursorMetrics {
        &self.metrics
    }

    /// Returns the number of remote streams.
    #[must_use]
    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Returns the time budget left over from the previous operation.
    #[must_use]
    pub const fn leftover_max_time(&self) -> Option<Duration> {
        self.leftover_max_time
    }

    /// Stores the time budget left for the next continuation.
    pub const fn set_leftover_max_time(&mut self, leftover: Option<Duration>) {
        self.leftover_max_time = leftover;
    }

    /// Closes the cursor, killing any remote cursor still open.
    pub async fn close(mut self) {
        self.close_remotes().await;
    }

    /// Records a document as returned to the caller.
    fn note_returned(&mut self, doc: &Document) {
        if let Some(limit) = &mut self.limit_remaining {
            *limit = limit.saturating_sub(1);
        }
        self.metrics.docs_returned += 1;
        self.metrics.bytes_returned += doc.size_bytes();
    }

    /// Pops the next buffered document round-robin, if any remote has one.
    fn pop_buffered(&mut self) -> Option<Document> {
        let count = self.remotes.len();
        for offset in 0..count {
            let index = (self.next_remote + offset) % count;
            if let Some(doc) = self.remotes[index].buffer.pop_front() {
                self.next_remote = (index + 1) % count;
                return Some(doc);
            }
        }
        None
    }

    /// Unordered merge: serve buffered documents round-robin, pulling more
    /// from whichever remote is still live.
    async fn next_unsorted(&mut self, ctx: &OpContext) -> Result<Option<Document>, CursorError> {
        loop {
            if let Some(doc) = self.pop_buffered() {
                return Ok(Some(doc));
            }
            if self.remotes_exhausted() {
                return Ok(None);
            }

            if self.params.tailable.is_tailable() {
                // One pull per live remote; absence of data is not an error,
                // it just means "no data yet".
                for index in 0..self.remotes.len() {
                    if !self.remotes[index].exhausted() && self.remotes[index].buffer.is_empty() {
                        self.fetch_more(index, ctx).await?;
                    }
                }
                return Ok(self.pop_buffered());
            }

            let live = (0..self.remotes.len())
                .map(|offset| (self.next_remote + offset) % self.remotes.len())
                .find(|&index| !self.remotes[index].exhausted());
            let Some(live) = live else {
                return Ok(None);
            };
            self.fetch_more(live, ctx).await?;
        }
    }

    /// Ordered merge: every live remote must have a buffered front before
    /// the minimum is chosen.
    async fn next_sorted(
        &mut self,
        sort: &SortPattern,
        ctx: &OpContext,
    ) -> Result<Option<Document>, CursorError> {
        loop {
            let pending: Vec<usize> = (0..self.remotes.len())
                .filter(|&index| {
                    !self.remotes[index].exhausted() && self.remotes[index].buffer.is_empty()
                })
                .collect();

            if pending.is_empty() {
                return self.pop_minimum(sort);
            }

            for index in pending {
                self.fetch_more(index, ctx).await?;
            }
        }
    }

    /// Pops the smallest buffered front document under the sort pattern.
    fn pop_minimum(&mut self, sort: &SortPattern) -> Result<Option<Document>, CursorError> {
        let mut best: Option<usize> = None;
        for (index, remote) in self.remotes.iter().enumerate() {
            let Some(doc) = remote.buffer.front() else {
                continue;
            };
            let key = doc
                .sort_key()
                .ok_or(CursorError::MissingSortKey { shard: remote.shard })?;
            best = match best {
                None => Some(index),
                Some(current) => {
                    let current_key = self.remotes[current].buffer[0]
                        .sort_key()
                        .ok_or(CursorError::MissingSortKey {
                            shard: self.remotes[current].shard,
                        })?;
                    if sort.compare(key, current_key) == Ordering::Less {
                        Some(index)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        Ok(best.and_then(|index| self.remotes[index].buffer.pop_front()))
    }

    /// Pulls one continuation batch from the remote at `index`.
    async fn fetch_more(&mut self, index: usize, ctx: &OpContext) -> Result<(), CursorError> {
        let shard = self.remotes[index].shard;
        let Some(cursor) = self.remotes[index].cursor else {
            return Ok(());
        };

        let service = Arc::clone(&self.service);
        let call = service.get_more(shard, cursor, self.params.batch_size);
        let result = match ctx.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline.into(), call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::DeadlineExceeded { shard }),
            },
            None => call.await,
        };

        match result {
            Ok(reply) => {
                let remote = &mut self.remotes[index];
                remote.cursor = reply.cursor;
                remote.buffer.extend(reply.batch);
                self.metrics.remote_batches += 1;
                Ok(())
            }
            Err(error) if error.is_timeout_class() && self.params.allow_partial_results => {
                debug!(
                    shard = %shard,
                    error = %error,
                    "remote dropped from result under partial-results policy"
                );
                self.remotes[index].cursor = None;
                self.remotes[index].buffer.clear();
                self.partial_results = true;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Kills every remote cursor still open and marks the streams ended.
    async fn close_remotes(&mut self) {
        for remote in &mut self.remotes {
            if let Some(cursor) = remote.cursor.take() {
                self.service.kill_cursor(remote.shard, cursor).await;
            }
            remote.buffer.clear();
        }
    }
}

impl std::fmt::Debug for MergeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCursor")
            .field("namespace", &self.params.namespace)
            .field("remotes", &self.remotes)
            .field("queued", &self.queued.len())
            .field("partial_results", &self.partial_results)
            .finish_non_exhaustive()
    }
}
