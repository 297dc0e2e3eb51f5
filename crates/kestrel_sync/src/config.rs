//! # Monitor Configuration
//!
//! Lock policy and labelling for monitors, loadable from TOML:
//!
//! ```toml
//! label = "job-queue"
//! policy = "reader_preferring"
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Admission policy for new shared holders of a [`ReentrantRwLock`].
///
/// Reentrant acquisitions are always admitted regardless of policy.
///
/// [`ReentrantRwLock`]: crate::ReentrantRwLock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// New readers queue behind waiting writers. Writers cannot starve.
    #[default]
    WriterPreferring,
    /// New readers are admitted whenever no writer holds the lock.
    ReaderPreferring,
}

/// Configuration for a [`Monitor`](crate::Monitor).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Name attached to every tracing event the monitor emits.
    pub label: Option<String>,
    /// Lock admission policy.
    pub policy: LockPolicy,
}

impl MonitorConfig {
    /// Unlabelled monitor whose writers are never starved by readers.
    #[must_use]
    pub const fn writer_preferring() -> Self {
        Self {
            label: None,
            policy: LockPolicy::WriterPreferring,
        }
    }

    /// Unlabelled monitor tuned for read-mostly entities.
    #[must_use]
    pub const fn reader_preferring() -> Self {
        Self {
            label: None,
            policy: LockPolicy::ReaderPreferring,
        }
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the text is not valid TOML or
    /// names unknown fields or policies.
    pub fn from_toml(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }
}
