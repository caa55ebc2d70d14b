//! Error types for the fiber task scheduler
//!
//! Capacity limits are fixed at construction time, so running out of queue,
//! fiber or group slots is reported rather than handled by growing anything.

use thiserror::Error;

/// Main error type for scheduler operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A fixed-capacity structure is full
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// The structure that ran out of capacity
        resource: &'static str,
    },

    /// An operation was called from the wrong context or on an invalid handle
    #[error("Invalid usage: {reason}")]
    InvalidUsage {
        /// What the caller did wrong
        reason: String,
    },

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// Runtime error
    #[error("Runtime error: {reason}")]
    RuntimeError {
        /// Reason for the runtime error
        reason: String,
    },
}

impl Error {
    pub(crate) fn exhausted(resource: &'static str) -> Self {
        Error::ResourceExhausted { resource }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidUsage {
            reason: reason.into(),
        }
    }
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_problem() {
        let err = Error::exhausted("task queue");
        assert_eq!(err.to_string(), "Resource exhausted: task queue");

        let err = Error::invalid("self-group wait");
        assert_eq!(err.to_string(), "Invalid usage: self-group wait");
    }
}
