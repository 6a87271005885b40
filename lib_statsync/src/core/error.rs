//! # Error Taxonomy
//!
//! None of these are fatal to the process. The worst user-visible outcome of
//! any of them is a display stuck on its static defaults.

use thiserror::Error;

/// Ways a caller can misuse the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisuseKind {
    /// `attach` was called for a topic this lifecycle already holds.
    AlreadyAttached,
    /// A read was requested before any feed was ever attached.
    NotAttached,
}

/// Errors produced by the synchronization engine and its collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// The snapshot query failed. Defaults keep being served meanwhile.
    #[error("Snapshot fetch failed: {0}")]
    TransientFetch(String),

    /// A raw event could not be normalized; it is degraded to a resync.
    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    /// The lifecycle was used out of order.
    #[error("Lifecycle misuse on '{topic}': {kind:?}")]
    LifecycleMisuse {
        /// The feed topic involved, empty for store-wide reads.
        topic: String,
        /// What went wrong.
        kind: MisuseKind,
    },

    /// An event arrived after its feed was detached and was dropped.
    #[error("Event for '{0}' dropped after detach")]
    DetachedEvent(String),

    /// The change feed could not be opened.
    #[error("Change feed error: {0}")]
    Feed(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Shorthand for a double attach.
    pub fn already_attached(topic: &str) -> Self {
        SyncError::LifecycleMisuse {
            topic: topic.to_string(),
            kind: MisuseKind::AlreadyAttached,
        }
    }

    /// Shorthand for a read before any attach.
    pub fn not_attached(topic: &str) -> Self {
        SyncError::LifecycleMisuse {
            topic: topic.to_string(),
            kind: MisuseKind::NotAttached,
        }
    }
}
