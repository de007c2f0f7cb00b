//! Per-operation context.
//!
//! Every client request runs with an `OpContext` describing who is asking
//! (principal, session, transaction) and how long they are willing to wait
//! (deadline). The context is built by the command layer and consumed here;
//! Gantry never mutates session or transaction state itself.

use std::time::{Duration, Instant};

use crate::types::{SessionId, TxnNumber};

/// The authenticated principal an operation runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    /// Creates a principal from a user name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the user name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Versioned-API parameters attached to an operation.
///
/// A continuation must present exactly the parameter set its cursor was
/// created with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiParameters {
    /// Declared API version, if any.
    pub version: Option<String>,
    /// Whether only stable-API commands are permitted.
    pub strict: bool,
    /// Whether use of deprecated behavior is an error.
    pub deprecation_errors: bool,
}

/// State of the multi-statement transaction an operation runs inside, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnContext {
    /// Whether the transaction's retry policy allows re-running the statement
    /// after a stale-routing failure.
    pub can_continue_on_stale_error: bool,
}

/// Context for one client operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// Logical session the operation runs in.
    pub session: Option<SessionId>,
    /// Transaction number within the session.
    pub txn_number: Option<TxnNumber>,
    /// Multi-statement transaction state, when one is active.
    pub txn: Option<TxnContext>,
    /// Authenticated principal.
    pub principal: Option<Principal>,
    /// Versioned-API parameters.
    pub api_parameters: ApiParameters,
    /// Absolute deadline for the operation.
    pub deadline: Option<Instant>,
    /// Whether the external sampler selected this query for analysis.
    pub query_sampling: bool,
}

impl OpContext {
    /// Creates an empty context (no session, no deadline).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session identity.
    #[must_use]
    pub const fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the transaction number.
    #[must_use]
    pub const fn with_txn_number(mut self, txn_number: TxnNumber) -> Self {
        self.txn_number = Some(txn_number);
        self
    }

    /// Sets the principal.
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Sets the operation deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Returns the time left before the deadline.
    ///
    /// `None` means the operation has no deadline. A zero duration means the
    /// deadline has already passed.
    #[must_use]
    pub fn remaining_time(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn deadline_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// The authorization predicate over a stored principal: the requesting
    /// operation must run as the same principal the cursor was created under.
    #[must_use]
    pub fn is_coauthorized(&self, stored: Option<&Principal>) -> bool {
        self.principal.as_ref() == stored
    }
}
