//! Results for operations whose failure is tolerated.
//!
//! A `Result` means the caller must handle the error. A `BestEffort` means the
//! operation was attempted, the failure (if any) has already been reported,
//! and the caller may carry on regardless.

use std::fmt::Display;
use tracing::warn;

/// Outcome of a best-effort operation.
#[derive(Debug)]
#[must_use = "a degraded outcome carries the error that was tolerated"]
pub enum BestEffort<T, E> {
    /// The operation completed.
    Applied(T),
    /// The operation failed and the failure was tolerated.
    Degraded(E),
}

impl<T, E> BestEffort<T, E> {
    /// Whether the operation completed.
    pub fn is_applied(&self) -> bool {
        matches!(self, BestEffort::Applied(_))
    }

    /// Whether the operation failed.
    pub fn is_degraded(&self) -> bool {
        matches!(self, BestEffort::Degraded(_))
    }

    /// The completed value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            BestEffort::Applied(value) => Some(value),
            BestEffort::Degraded(_) => None,
        }
    }

    /// The tolerated error, if any.
    pub fn error(&self) -> Option<&E> {
        match self {
            BestEffort::Applied(_) => None,
            BestEffort::Degraded(err) => Some(err),
        }
    }

    /// Map the completed value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BestEffort<U, E> {
        match self {
            BestEffort::Applied(value) => BestEffort::Applied(f(value)),
            BestEffort::Degraded(err) => BestEffort::Degraded(err),
        }
    }
}

impl<T, E: Display> BestEffort<T, E> {
    /// Convert a fallible result, logging the error once if it failed.
    pub fn tolerate(result: Result<T, E>, operation: &str) -> Self {
        match result {
            Ok(value) => BestEffort::Applied(value),
            Err(err) => {
                warn!(operation, error = %err, "Best-effort operation failed; continuing");
                BestEffort::Degraded(err)
            }
        }
    }
}

impl<T, E> From<Result<T, E>> for BestEffort<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Applied(value),
            Err(err) => BestEffort::Degraded(err),
        }
    }
}
