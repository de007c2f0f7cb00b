//! Router error taxonomy.
//!
//! The retry coordinator drives its state machine by matching on error
//! kinds: stale-routing kinds are absorbed up to the attempt ceiling,
//! everything else propagates immediately. Callers always see either a
//! cursor id and a batch, or exactly one of these errors.

use gantry_core::{ApiParameters, CollectionUuid, CursorId, Namespace, SessionId, TxnNumber};
use gantry_cursor::{CursorError, RegistryError, RemoteError};
use thiserror::Error;

/// Errors surfaced by [`crate::QueryRouter`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The request is malformed; never retried.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// What is wrong with the request.
        reason: String,
    },

    /// The sum of limit and skip does not fit a 64-bit integer.
    #[error("sum of limit and skip cannot be represented as a 64-bit integer, limit: {limit}, skip: {skip}")]
    SkipLimitOverflow {
        /// Requested skip.
        skip: u64,
        /// Requested limit.
        limit: u64,
    },

    /// The requesting operation may not touch this cursor.
    #[error("not authorized to access cursor {cursor_id}")]
    Unauthorized {
        /// The cursor that was requested.
        cursor_id: CursorId,
    },

    /// No such cursor.
    #[error("cursor {cursor_id} not found")]
    CursorNotFound {
        /// The missing cursor id.
        cursor_id: CursorId,
    },

    /// Another operation holds the cursor's pin.
    #[error("cursor {cursor_id} is already in use")]
    CursorInUse {
        /// The pinned cursor id.
        cursor_id: CursorId,
    },

    /// A session-bearing continuation of a session-less cursor.
    #[error("cannot continue cursor {cursor_id}, which was not created in a session, in session {session}")]
    CursorNotCreatedInSession {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The requesting session.
        session: SessionId,
    },

    /// A session-less continuation of a session-bound cursor.
    #[error("cannot continue cursor {cursor_id}, which was created in session {session}, without a session")]
    CursorCreatedInSession {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The session the cursor was created in.
        session: SessionId,
    },

    /// A continuation from a different session than the cursor's.
    #[error("cannot continue cursor {cursor_id}, which was created in session {expected}, in session {actual}")]
    SessionMismatch {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The session the cursor was created in.
        expected: SessionId,
        /// The requesting session.
        actual: SessionId,
    },

    /// A transaction-bearing continuation of a transaction-less cursor.
    #[error("cannot continue cursor {cursor_id}, which was not created in a transaction, in transaction {txn_number}")]
    CursorNotCreatedInTransaction {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The requesting transaction number.
        txn_number: TxnNumber,
    },

    /// A transaction-less continuation of a transaction-bound cursor.
    #[error("cannot continue cursor {cursor_id}, which was created in transaction {txn_number}, without a transaction")]
    CursorCreatedInTransaction {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The transaction the cursor was created under.
        txn_number: TxnNumber,
    },

    /// A continuation under a different transaction number.
    #[error("cannot continue cursor {cursor_id}, which was created in transaction {expected}, in transaction {actual}")]
    TxnNumberMismatch {
        /// The cursor being continued.
        cursor_id: CursorId,
        /// The transaction the cursor was created under.
        expected: TxnNumber,
        /// The requesting transaction number.
        actual: TxnNumber,
    },

    /// The continuation carries different versioned-API parameters than the
    /// cursor was created with.
    #[error("API parameter mismatch: continuation used {requested:?}, the cursor-creating command used {created_with:?}")]
    ApiMismatch {
        /// Parameters on the continuation request.
        requested: ApiParameters,
        /// Parameters the cursor was created with.
        created_with: ApiParameters,
    },

    /// The collection at the routed namespace does not carry the identity
    /// the client pinned.
    #[error("collection identity mismatch: expected {expected}")]
    CollectionUuidMismatch {
        /// The identity the client pinned.
        expected: CollectionUuid,
        /// The collection actually carrying that identity, when known.
        actual_namespace: Option<Namespace>,
    },

    /// Routing stayed stale through every permitted attempt.
    #[error("failed to run query after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The final stale-routing error.
        source: Box<RouterError>,
    },

    /// The operation deadline elapsed.
    #[error("operation exceeded time limit")]
    ExceededTimeLimit,

    /// A remote failure that is fatal at this layer.
    #[error(transparent)]
    Remote(RemoteError),

    /// An invariant the router relies on did not hold.
    #[error("internal error: {message}")]
    Internal {
        /// Error detail.
        message: String,
    },
}

impl RouterError {
    /// Returns true for the stale-routing kinds the coordinator retries.
    #[must_use]
    pub fn is_stale_routing(&self) -> bool {
        matches!(self, Self::Remote(remote) if remote.is_stale_routing())
    }
}

impl From<RemoteError> for RouterError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::CollectionUuidMismatch {
                expected,
                actual_namespace,
            } => Self::CollectionUuidMismatch {
                expected,
                actual_namespace,
            },
            RemoteError::DeadlineExceeded { .. } => Self::ExceededTimeLimit,
            other => Self::Remote(other),
        }
    }
}

impl From<CursorError> for RouterError {
    fn from(error: CursorError) -> Self {
        match error {
            CursorError::Remote(remote) => remote.into(),
            CursorError::MissingSortKey { shard } => Self::Internal {
                message: format!("document from {shard} is missing its extracted sort key"),
            },
        }
    }
}

impl From<RegistryError> for RouterError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::CursorNotFound(cursor_id) => Self::CursorNotFound { cursor_id },
            RegistryError::CursorInUse(cursor_id) => Self::CursorInUse { cursor_id },
            RegistryError::Unauthorized(cursor_id) => Self::Unauthorized { cursor_id },
        }
    }
}
