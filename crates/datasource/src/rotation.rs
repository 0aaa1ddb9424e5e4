//! Retry policy for the credential-rotation loop.

use serde::{Deserialize, Serialize};

/// Bounded retry for re-borrowing after a detected password change.
///
/// Deliberately has no backoff: the stale entries being drained live in
/// the local pool, so waiting between attempts buys nothing. The bound
/// exists to protect against a systematically misbehaving backend that
/// keeps producing entries with yet another password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of re-borrow attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt bound.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Iterator over attempt numbers, `0..max_attempts`.
    pub fn attempts(&self) -> impl Iterator<Item = u32> + use<> {
        0..self.max_attempts
    }
}
