//! Immutable configuration of a merged cluster cursor.
//!
//! Captured once at creation and kept for the cursor's whole lifetime; a
//! continuation call is validated against these values, never against the
//! continuation request itself.

use gantry_core::{ApiParameters, Namespace, OpContext, SessionId, SortPattern, TxnNumber};

use crate::query::{FindRequest, ReadConcern, ReadPreference, TailableMode};

/// Configuration captured when a merged cursor is created.
#[derive(Debug, Clone)]
pub struct MergeCursorParams {
    /// Namespace the remote cursors live on.
    pub namespace: Namespace,
    /// The originating request, kept for diagnostics.
    pub originating_request: FindRequest,
    /// Session the cursor was created in.
    pub session: Option<SessionId>,
    /// Transaction number the cursor was created under.
    pub txn_number: Option<TxnNumber>,
    /// Read preference honored for the cursor's lifetime.
    pub read_preference: ReadPreference,
    /// Read concern honored for the cursor's lifetime.
    pub read_concern: Option<ReadConcern>,
    /// Merge ordering. Only set when more than one shard was targeted.
    pub sort: Option<SortPattern>,
    /// Documents to skip at the router. Only set for multi-shard targeting.
    pub skip: Option<u64>,
    /// Router-applied cap on returned documents. Only set for multi-shard
    /// targeting.
    pub limit: Option<u64>,
    /// Batch size for remote continuations. Never zero.
    pub batch_size: Option<u32>,
    /// Tailable behavior.
    pub tailable: TailableMode,
    /// Whether unresponsive shards may be dropped from the result.
    pub allow_partial_results: bool,
    /// Versioned-API parameters the cursor was created with.
    pub api_parameters: ApiParameters,
}

impl MergeCursorParams {
    /// Builds params from an originating request and its operation context.
    ///
    /// Router-side sort/skip/limit start unset; the coordinator fills them
    /// in only when more than one shard is targeted.
    #[must_use]
    pub fn new(request: FindRequest, ctx: &OpContext, read_preference: ReadPreference) -> Self {
        // A remote continuation may not carry a zero batch size, so an
        // explicit zero falls back to the default sizing logic.
        let batch_size = request.batch_size.filter(|&size| size > 0);

        Self {
            namespace: request.namespace.clone(),
            session: ctx.session,
            txn_number: ctx.txn_number,
            read_preference,
            read_concern: request.read_concern,
            sort: None,
            skip: None,
            limit: None,
            batch_size,
            tailable: request.tailable,
            allow_partial_results: request.allow_partial_results,
            api_parameters: ctx.api_parameters.clone(),
            originating_request: request,
        }
    }
}
