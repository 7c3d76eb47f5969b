use std::time::Duration;

/// Why a blocking acquisition gave up without a token.
///
/// None of these are faults: the caller was simply not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The cancellation signal fired before a token became available.
    #[error("wait cancelled before a token was available")]
    Cancelled,
    /// The token would not be available within the allowed time.
    #[error("token not available within {timeout:?} (would wait {needed:?})")]
    DeadlineExceeded {
        /// Time the caller was willing to wait.
        timeout: Duration,
        /// Time the caller would have had to wait.
        needed: Duration,
    },
    /// The bucket can never hold a token.
    #[error("limiter burst of {burst} cannot admit any request")]
    ExceedsBurst {
        /// Configured burst.
        burst: u32,
    },
    /// The bucket is empty and never refills.
    #[error("limiter has a zero rate and no tokens left")]
    NeverAvailable,
}
