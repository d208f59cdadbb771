use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the backfill workspace.
///
/// The three families the rest of the workspace reasons about are
/// connectivity problems (`Connection`, `Timeout`, `CoolingDown`), data
/// problems (`Data`, `RemoteNotice`, `PacingViolation`) and caller mistakes
/// (`Validation`). Persistence failures are kept separate because they never
/// say anything about the remote terminal.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackfillError {
    /// A connection to the remote terminal could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote call succeeded at the transport level but yielded no usable data.
    #[error("data issue: {0}")]
    Data(String),

    /// Malformed or out-of-range caller input.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A blocking call exceeded its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation label (e.g. "fetch_bars", "connect").
        operation: String,
        /// Deadline that elapsed, in milliseconds.
        after_ms: u64,
    },

    /// A true (non-informational) asynchronous error notice arrived during a call.
    #[error("remote error {code}: {message}")]
    RemoteNotice {
        /// Numeric code reported by the terminal.
        code: i32,
        /// Human-readable message attached to the notice.
        message: String,
    },

    /// The request budget for historical data is exhausted for the current window.
    #[error("pacing violation: reset_in_ms={reset_in_ms}")]
    PacingViolation {
        /// Milliseconds until the pacing window admits another request.
        reset_in_ms: u64,
    },

    /// The link is cooling down after a pacing violation; retry after `reset_in_ms`.
    #[error("cooling down: reset_in_ms={reset_in_ms}")]
    CoolingDown {
        /// Milliseconds remaining in the cooldown window.
        reset_in_ms: u64,
    },

    /// Reading or writing a local state file failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Unknown/opaque error.
    #[error("unknown error: {0}")]
    Other(String),
}

impl BackfillError {
    /// Helper: build a `Connection` error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Helper: build a `Data` error.
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Helper: build a `Validation` error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Helper: build a `Timeout` error from an operation label and a duration.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Helper: build a `RemoteNotice` error.
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        Self::RemoteNotice {
            code,
            message: message.into(),
        }
    }

    /// Returns true when the error says the terminal could not be reached,
    /// as opposed to the terminal answering that something does not exist.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::CoolingDown { .. }
        )
    }

    /// Returns true when retrying the same call later may succeed.
    ///
    /// Validation and persistence failures are never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Persistence(_))
    }
}

impl From<std::io::Error> for BackfillError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for BackfillError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
