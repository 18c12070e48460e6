//! Failure classification shared by the store, the remote and the coordinator.

use std::fmt;

/// Why an operation failed, reduced to what the coordinator needs to decide
/// whether an outbox item stays queued, is dead-lettered, or ends the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The call did not complete in time.
    Timeout,
    /// Network error, server error or rate limiting. Worth retrying later.
    Unreachable,
    /// The backend refused the payload; retrying the same payload will not help.
    Rejected,
    /// Local storage is out of space.
    StorageFull,
    /// Credentials are missing or expired.
    Unauthenticated,
    /// Any other local storage failure.
    Storage,
}

impl FailureReason {
    /// Permanent failures are dead-lettered instead of retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureReason::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Unreachable => "unreachable",
            FailureReason::Rejected => "rejected",
            FailureReason::StorageFull => "storage_full",
            FailureReason::Unauthenticated => "unauthenticated",
            FailureReason::Storage => "storage",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
