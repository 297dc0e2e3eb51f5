//! # Synchronization Error Types
//!
//! All errors that can occur while coordinating access to a monitored entity.
//!
//! Timeouts are deliberately absent: a bounded wait that expires is an
//! expected outcome and is reported as `Ok(None)`, never as an error.

use thiserror::Error;

/// Boxed error produced by a sandbox duplication function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the synchronization primitives.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The calling thread was interrupted while blocked (or on entry to a
    /// blocking call). Every lock the call acquired has been released.
    #[error("thread interrupted while waiting on monitor")]
    Interrupted,

    /// A sandbox could not produce a private copy of its entity.
    #[error("cannot duplicate entity of type {type_name}")]
    Duplication {
        /// Type name of the entity that failed to duplicate.
        type_name: &'static str,
        /// Error reported by the duplication function.
        #[source]
        source: BoxError,
    },

    /// The sandbox holds no local entity.
    #[error("sandbox holds no entity")]
    EmptySandbox,

    /// Invalid configuration text.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Returns true if this error reports an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
