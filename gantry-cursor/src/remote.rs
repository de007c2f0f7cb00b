//! Remote cursor establishment.
//!
//! Opens one cursor per targeted shard, concurrently, with routing stamps
//! attached so all shards agree on placement before any data flows. The
//! actual dispatch lives behind [`ShardService`]; production code wires in
//! the cluster's command dispatcher, tests wire in a scripted double.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gantry_core::{Document, OperationKey, RemoteCursorId, SessionId, ShardId, SortPattern, TxnNumber};
use gantry_routing::RoutingStamp;
use thiserror::Error;
use tracing::{debug, warn};

use crate::query::{FindRequest, ReadPreference};

/// Errors reported by remote command dispatch.
///
/// The retry coordinator matches on these kinds: stale-routing kinds recover
/// via cache invalidation and retry, timeout kinds may degrade to partial
/// results, and everything else is fatal at this layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The shard disagrees with the routing version the request was stamped
    /// with.
    #[error("stale shard version on {shard}: shard wants {wanted}")]
    StaleShardVersion {
        /// The shard reporting the disagreement.
        shard: ShardId,
        /// The routing version the shard expects.
        wanted: gantry_core::RoutingVersion,
    },

    /// The shard disagrees with the database placement version.
    #[error("stale database version for {db}: shard wants {wanted}")]
    StaleDatabaseVersion {
        /// The database whose placement is stale.
        db: String,
        /// The database version the shard expects.
        wanted: gantry_core::DatabaseVersion,
    },

    /// The targeted shard does not exist (anymore).
    #[error("shard not found: {shard}")]
    ShardNotFound {
        /// The missing shard.
        shard: ShardId,
    },

    /// The collection at the routed namespace is not the one the client
    /// pinned by identity.
    #[error("collection identity mismatch: expected {expected}")]
    CollectionUuidMismatch {
        /// The identity the client pinned.
        expected: gantry_core::CollectionUuid,
        /// The collection actually carrying that identity, when the shard
        /// could name it.
        actual_namespace: Option<gantry_core::Namespace>,
    },

    /// The remote cursor no longer exists on the shard.
    #[error("remote cursor {cursor} not found on {shard}")]
    CursorNotFound {
        /// The shard that was asked.
        shard: ShardId,
        /// The missing remote cursor.
        cursor: RemoteCursorId,
    },

    /// The shard could not be reached.
    #[error("shard {shard} unreachable: {reason}")]
    Unreachable {
        /// The unreachable shard.
        shard: ShardId,
        /// Transport-level detail.
        reason: String,
    },

    /// The operation deadline elapsed while waiting on the shard.
    #[error("deadline exceeded waiting on {shard}")]
    DeadlineExceeded {
        /// The shard that did not answer in time.
        shard: ShardId,
    },

    /// The remote stream must stop cleanly, with no error surfaced.
    #[error("remote stream closed")]
    StreamClosed,

    /// The remote stream was invalidated; the marker lets the client resume
    /// a successor stream.
    #[error("remote stream invalidated")]
    StreamInvalidated {
        /// Opaque resume marker to surface on the final reply.
        resume_marker: bytes::Bytes,
    },

    /// Any other remote failure.
    #[error("remote error on {shard}: {message}")]
    Remote {
        /// The failing shard.
        shard: ShardId,
        /// Error detail.
        message: String,
    },
}

impl RemoteError {
    /// Returns true for the routing-staleness kinds the coordinator recovers
    /// from by invalidating the catalog cache and retrying.
    #[must_use]
    pub const fn is_stale_routing(&self) -> bool {
        matches!(
            self,
            Self::StaleShardVersion { .. }
                | Self::StaleDatabaseVersion { .. }
                | Self::ShardNotFound { .. }
        )
    }

    /// Returns true for the timeout-class kinds that partial-results queries
    /// tolerate by dropping the shard from the result.
    #[must_use]
    pub const fn is_timeout_class(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. } | Self::Unreachable { .. })
    }
}

/// Result type for remote dispatch.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// What sort key, if any, the shard must extract onto returned documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKeyExtraction {
    /// No key; the merge is unordered.
    None,
    /// Extract the key for the given sort pattern.
    ByPattern(SortPattern),
    /// Tag each document with its geo-nearest distance as a single scalar.
    NearestDistance,
}

/// One per-shard cursor-open request.
#[derive(Debug, Clone)]
pub struct ShardCursorRequest {
    /// The shard this request targets.
    pub shard: ShardId,
    /// The query body, already rewritten for fan-out.
    pub query: FindRequest,
    /// Routing stamp the shard checks placement agreement against.
    pub stamp: RoutingStamp,
    /// Where the dispatch service may serve the read from.
    pub read_preference: ReadPreference,
    /// Sort key the shard must attach to returned documents.
    pub extract_sort_key: SortKeyExtraction,
    /// Session the operation runs in, when cross-shard consistency needs it.
    pub session: Option<SessionId>,
    /// Transaction number, likewise.
    pub txn_number: Option<TxnNumber>,
    /// Whether this shard was picked to sample the query for analysis.
    pub sample_query: bool,
    /// Tracking key shared across the whole fan-out, so one caller-side
    /// cancellation covers every outstanding open.
    pub operation_key: OperationKey,
}

/// A shard's reply to a cursor open or continuation.
#[derive(Debug, Clone)]
pub struct ShardCursorReply {
    /// The remote cursor to continue from, or `None` when the shard's
    /// stream is exhausted.
    pub cursor: Option<RemoteCursorId>,
    /// Documents produced by this call.
    pub batch: Vec<Document>,
}

/// Remote command dispatch, as consumed by the cursor layer.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait ShardService: Send + Sync + 'static {
    /// Opens a cursor on one shard.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] kind describing why the open failed;
    /// stale-routing kinds drive the coordinator's retry.
    async fn open_cursor(
        &self,
        shard: ShardId,
        request: ShardCursorRequest,
    ) -> RemoteResult<ShardCursorReply>;

    /// Pulls the next batch from a previously opened remote cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] on dispatch failure or stream invalidation.
    async fn get_more(
        &self,
        shard: ShardId,
        cursor: RemoteCursorId,
        batch_size: Option<u32>,
    ) -> RemoteResult<ShardCursorReply>;

    /// Closes a remote cursor. Best effort: failures are logged, not
    /// surfaced.
    async fn kill_cursor(&self, shard: ShardId, cursor: RemoteCursorId);
}

/// One established remote cursor, with the batch its open call returned.
#[derive(Debug)]
pub struct RemoteCursor {
    /// The shard the cursor lives on.
    pub shard: ShardId,
    /// The continuation handle, or `None` when the open already exhausted
    /// the shard's stream.
    pub cursor: Option<RemoteCursorId>,
    /// Documents returned by the open call.
    pub initial_batch: Vec<Document>,
}

/// Result of establishing cursors across a target set.
#[derive(Debug)]
pub struct EstablishedCursors {
    /// One entry per shard that answered.
    pub remotes: Vec<RemoteCursor>,
    /// Shards dropped under the partial-results policy.
    pub skipped_shards: Vec<ShardId>,
}

/// Opens a remote cursor on every requested shard.
///
/// All opens are issued concurrently and every one is awaited before this
/// function returns, success or failure: no open is left in flight.
///
/// With `allow_partial_results`, timeout-class failures drop the shard from
/// the result instead of failing the establishment. Any other failure kills
/// the cursors that did open and surfaces the error; stale-routing errors
/// are preferred when several shards failed, since they are the ones the
/// caller can recover from.
///
/// # Errors
///
/// Returns the classified [`RemoteError`] of the failed shard open.
pub async fn establish_cursors(
    service: &Arc<dyn ShardService>,
    requests: Vec<ShardCursorRequest>,
    allow_partial_results: bool,
    deadline: Option<Instant>,
) -> RemoteResult<EstablishedCursors> {
    let opens = requests.into_iter().map(|request| {
        let service = Arc::clone(service);
        async move {
            let shard = request.shard;
            let open = service.open_cursor(shard, request);
            let result = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline.into(), open).await {
                        Ok(result) => result,
                        Err(_) => Err(RemoteError::DeadlineExceeded { shard }),
                    }
                }
                None => open.await,
            };
            (shard, result)
        }
    });

    let replies = futures::future::join_all(opens).await;

    let mut remotes = Vec::with_capacity(replies.len());
    let mut skipped_shards = Vec::new();
    let mut first_error: Option<RemoteError> = None;
    let mut first_stale: Option<RemoteError> = None;

    for (shard, result) in replies {
        match result {
            Ok(reply) => remotes.push(RemoteCursor {
                shard,
                cursor: reply.cursor,
                initial_batch: reply.batch,
            }),
            Err(error) if allow_partial_results && error.is_timeout_class() => {
                debug!(shard = %shard, error = %error, "dropping unresponsive shard from partial result");
                skipped_shards.push(shard);
            }
            Err(error) => {
                if error.is_stale_routing() {
                    first_stale.get_or_insert(error);
                } else {
                    first_error.get_or_insert(error);
                }
            }
        }
    }

    if let Some(error) = first_stale.or(first_error) {
        // The fan-out failed as a whole: close whatever did open.
        for remote in &remotes {
            if let Some(cursor) = remote.cursor {
                warn!(shard = %remote.shard, error = %error, "closing remote cursor after failed establishment");
                service.kill_cursor(remote.shard, cursor).await;
            }
        }
        return Err(error);
    }

    Ok(EstablishedCursors {
        remotes,
        skipped_shards,
    })
}
