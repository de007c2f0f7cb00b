//! Cursor continuation handling.
//!
//! One continuation is a four-step state machine: check the cursor out of
//! the registry, validate that the requesting operation matches the
//! cursor's creation-time identity, drain further merged results, and
//! return or delete the cursor. The pin taken at checkout is a scoped
//! lease: every path out of this module resolves it, so a pinned entry is
//! never leaked.

use std::time::{Duration, Instant};

use bytes::Bytes;
use gantry_core::{CursorId, Document, Namespace, OpContext};
use gantry_cursor::{CursorError, CursorState, MergeCursorParams, RemoteError};
use tracing::debug;

use crate::error::RouterError;
use crate::find::QueryRouter;
use crate::response::ResponseSizeTracker;

/// A client request for more results from a registered cursor.
#[derive(Debug, Clone)]
pub struct GetMoreRequest {
    /// The cursor to continue.
    pub cursor_id: CursorId,
    /// Namespace the client believes the cursor is on.
    pub namespace: Namespace,
    /// Documents wanted in this batch; `None` or zero means "until the
    /// reply is full".
    pub batch_size: Option<u32>,
    /// For await-data cursors: how long to wait for new data.
    pub max_time: Option<Duration>,
}

/// The reply to one continuation.
#[derive(Debug)]
pub struct CursorResponse {
    /// The id to continue from next time; zero when the cursor is done.
    pub cursor_id: CursorId,
    /// Documents drained by this call.
    pub batch: Vec<Document>,
    /// True when unresponsive shards were dropped from the result.
    pub partial_results_returned: bool,
    /// Set when the stream was invalidated: an opaque marker the client can
    /// resume a successor stream from.
    pub invalidation_resume_marker: Option<Bytes>,
}

impl QueryRouter {
    /// Drains more results from a registered cursor.
    ///
    /// # Errors
    ///
    /// Returns a [`RouterError`]; on every error path the cursor has
    /// already been returned to the registry unexhausted.
    pub async fn run_get_more(
        &self,
        ctx: &OpContext,
        request: &GetMoreRequest,
    ) -> Result<CursorResponse, RouterError> {
        let now = Instant::now();
        let mut pinned = self
            .registry()
            .checkout(request.cursor_id, now, |stored| ctx.is_coauthorized(stored))?;

        // Validation. The pin's drop returns the cursor should any of these
        // bail out.
        {
            let params = pinned.cursor().params();
            if params.namespace != request.namespace {
                return Err(RouterError::CursorNotFound {
                    cursor_id: request.cursor_id,
                });
            }
            Self::validate_session(request.cursor_id, ctx, params)?;
            Self::validate_transaction(request.cursor_id, ctx, params)?;
            if ctx.api_parameters != params.api_parameters {
                return Err(RouterError::ApiMismatch {
                    requested: ctx.api_parameters.clone(),
                    created_with: params.api_parameters.clone(),
                });
            }
        }

        // Re-arm the time budget for this drain: await-data cursors wait
        // for new data, ordinary cursors get whatever is left of the
        // creation-time budget.
        let await_data = pinned.cursor().params().tailable.is_await_data();
        let tailable = pinned.cursor().params().tailable.is_tailable();
        let drain_deadline = if await_data {
            let wait = request.max_time.unwrap_or(Duration::from_micros(
                self.limits().default_await_data_timeout_us,
            ));
            Some(now + wait)
        } else if request.max_time.is_some() {
            return Err(RouterError::InvalidQuery {
                reason: "max time on a continuation is only valid for await-data cursors"
                    .to_string(),
            });
        } else {
            pinned
                .cursor()
                .leftover_max_time()
                .map(|leftover| now + leftover)
        };
        let drain_ctx = ctx.clone().with_deadline(drain_deadline);

        let mut batch = Vec::new();
        let mut tracker = ResponseSizeTracker::new(self.limits().max_reply_bytes);
        let batch_target = request.batch_size.filter(|&size| size > 0);
        let mut state = CursorState::NotExhausted;
        let mut invalidation_resume_marker = None;

        loop {
            if let Some(target) = batch_target {
                if batch.len() >= target as usize {
                    break;
                }
            }

            let step = pinned.cursor_mut().next(&drain_ctx).await;
            match step {
                Ok(Some(doc)) => {
                    if !tracker.fits(&doc) {
                        pinned.cursor_mut().queue_result(doc);
                        break;
                    }
                    tracker.add(&doc);
                    batch.push(doc);
                }
                Ok(None) => {
                    if !tailable || pinned.cursor().remotes_exhausted() {
                        state = CursorState::Exhausted;
                    }
                    break;
                }
                // The stream must stop cleanly, with no error surfaced.
                Err(CursorError::Remote(RemoteError::StreamClosed)) => {
                    state = CursorState::Exhausted;
                    break;
                }
                // The stream was invalidated: stop cleanly and hand the
                // client the marker to resume a successor stream from.
                Err(CursorError::Remote(RemoteError::StreamInvalidated { resume_marker })) => {
                    invalidation_resume_marker = Some(resume_marker);
                    state = CursorState::Exhausted;
                    break;
                }
                Err(CursorError::Remote(error))
                    if error.is_timeout_class()
                        && pinned.cursor().partial_results_returned() =>
                {
                    debug!(
                        cursor_id = %request.cursor_id,
                        "returning partial results instead of a router timeout"
                    );
                    state = CursorState::Exhausted;
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }

        // Whatever is left of this drain's budget carries to the next one.
        if !await_data {
            let leftover =
                drain_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            pinned.cursor_mut().set_leftover_max_time(leftover);
        }

        let partial_results_returned = pinned.cursor().partial_results_returned();
        let cursor_id = if state == CursorState::Exhausted {
            CursorId::ZERO
        } else {
            request.cursor_id
        };

        if let Some(cursor) = pinned.return_cursor(state, Instant::now()) {
            cursor.close().await;
        }

        debug!(
            cursor_id = %request.cursor_id,
            returned = batch.len(),
            exhausted = cursor_id.is_zero(),
            "continuation drained"
        );

        Ok(CursorResponse {
            cursor_id,
            batch,
            partial_results_returned,
            invalidation_resume_marker,
        })
    }

    /// The requesting session must match the cursor's creation session
    /// exactly; each mismatch shape is its own error.
    fn validate_session(
        cursor_id: CursorId,
        ctx: &OpContext,
        params: &MergeCursorParams,
    ) -> Result<(), RouterError> {
        match (ctx.session, params.session) {
            (Some(session), None) => Err(RouterError::CursorNotCreatedInSession {
                cursor_id,
                session,
            }),
            (None, Some(session)) => Err(RouterError::CursorCreatedInSession {
                cursor_id,
                session,
            }),
            (Some(actual), Some(expected)) if actual != expected => {
                Err(RouterError::SessionMismatch {
                    cursor_id,
                    expected,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }

    /// The requesting transaction number must match the cursor's exactly.
    fn validate_transaction(
        cursor_id: CursorId,
        ctx: &OpContext,
        params: &MergeCursorParams,
    ) -> Result<(), RouterError> {
        match (ctx.txn_number, params.txn_number) {
            (Some(txn_number), None) => Err(RouterError::CursorNotCreatedInTransaction {
                cursor_id,
                txn_number,
            }),
            (None, Some(txn_number)) => Err(RouterError::CursorCreatedInTransaction {
                cursor_id,
                txn_number,
            }),
            (Some(actual), Some(expected)) if actual != expected => {
                Err(RouterError::TxnNumberMismatch {
                    cursor_id,
                    expected,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }
}
