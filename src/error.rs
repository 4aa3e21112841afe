// SPDX-License-Identifier: Apache-2.0 OR MIT
// Error kinds surfaced through the synchronous error path

use thiserror::Error;

/// Failures the logging core can report.
///
/// The producer-side `log` path is infallible by design; everything here is
/// either reported synchronously through the sink or returned from
/// construction-time validation.
#[derive(Debug, Error)]
pub enum LogError {
    /// A CAS the buffer ownership protocol asserts must succeed has failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// More producer threads are registered than the swap ring is sized for.
    /// Logging still works, but the bounded-retry argument for slot posting
    /// no longer holds.
    #[error("more than {max} threads logging simultaneously")]
    TooManyThreads { max: usize },

    /// `stop_logging` would deadlock waiting on its own flush sentinel.
    #[error("stop_logging is not supported from the I/O thread")]
    StopLoggingFromIoThread,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
