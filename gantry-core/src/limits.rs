//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every retry loop, buffer, and reply has an explicit maximum size.
//! This prevents unbounded growth and makes the system predictable.

/// System-wide limits for Gantry.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Reply and batch limits.
    /// Maximum encoded bytes in a single client reply batch.
    pub max_reply_bytes: u64,
    /// Number of documents in a first batch when the client gives no batch size.
    pub default_batch_size: u32,

    // Routing limits.
    /// Maximum attempts at targeting + establishment when routing is stale.
    pub max_routing_attempts: u32,

    // Cursor lifetime limits.
    /// Idle time after which an unpinned mortal cursor is reclaimed, in microseconds.
    pub cursor_timeout_us: u64,
    /// Default wait for new data on an awaitData continuation, in microseconds.
    pub default_await_data_timeout_us: u64,

    // Partial-results limits.
    /// Cap on the time reserved for turning a timeout into a partial-result
    /// success, in microseconds.
    pub partial_results_reserve_cap_us: u64,
    /// Polls of the expiry-wait loop before a router timeout is surfaced.
    pub max_partial_wait_polls: u32,
    /// Sleep between expiry-wait polls, in microseconds.
    pub partial_wait_poll_interval_us: u64,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Replies: 16MB budget, 101-document first batch.
            max_reply_bytes: 16 * 1024 * 1024,
            default_batch_size: 101,

            // Routing: ten attempts before a stale error surfaces.
            max_routing_attempts: 10,

            // Cursors: 10min idle reap, 1s awaitData wait.
            cursor_timeout_us: 10 * 60 * 1_000_000,
            default_await_data_timeout_us: 1_000_000,

            // Partial results: reserve at most 100ms, poll 10 x 1ms.
            partial_results_reserve_cap_us: 100_000,
            max_partial_wait_polls: 10,
            partial_wait_poll_interval_us: 1000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns a description of the first invalid limit found.
    pub const fn validate(&self) -> Result<(), &'static str> {
        if self.max_reply_bytes == 0 {
            return Err("max_reply_bytes must be positive");
        }
        if self.default_batch_size == 0 {
            return Err("default_batch_size must be positive");
        }
        if self.max_routing_attempts == 0 {
            return Err("max_routing_attempts must be positive");
        }
        if self.max_partial_wait_polls == 0 {
            return Err("max_partial_wait_polls must be positive");
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_zero_reply_budget_rejected() {
        let mut limits = Limits::new();
        limits.max_reply_bytes = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut limits = Limits::new();
        limits.max_routing_attempts = 0;
        assert!(limits.validate().is_err());
    }
}
