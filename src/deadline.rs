//! Time bound for a single export operation

use std::time::{Duration, Instant};

/// Deadline shared by every stage of one export
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    /// Start a deadline now; `None` means unbounded
    pub fn start(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// A deadline that never expires
    pub fn unbounded() -> Self {
        Self::start(None)
    }

    /// The configured limit
    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Time left before expiry, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    /// Whether the limit has passed
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// Time since the deadline started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
