//! Event type definitions for the engine event bus.
//!
//! These are control-plane signals exchanged between the crawler and its
//! external collaborators, not per-page data events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason the event bus is shutting down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// The crawl drained its frontier and finished
    CrawlCompleted,
    /// The crawl was aborted before finishing
    Aborted,
    /// The crawl terminated on an error
    Error(String),
}

/// Control events emitted by the engine and its host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    /// Host migration is imminent; receivers should persist their state.
    Migrating { timestamp: DateTime<Utc> },
    /// The crawler is aborting; receivers should stop issuing work.
    Aborting { timestamp: DateTime<Utc> },
    /// Periodic request to snapshot state.
    PersistState {
        /// True when this persist request was triggered by a migration
        /// rather than the regular timer.
        is_migrating: bool,
        timestamp: DateTime<Utc>,
    },
    /// The bus is shutting down; subscribers should exit their loops.
    Shutdown {
        reason: ShutdownReason,
        timestamp: DateTime<Utc>,
    },
}

impl SystemEvent {
    #[must_use]
    pub fn migrating() -> Self {
        Self::Migrating {
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn aborting() -> Self {
        Self::Aborting {
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn persist_state(is_migrating: bool) -> Self {
        Self::PersistState {
            is_migrating,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn shutdown(reason: ShutdownReason) -> Self {
        Self::Shutdown {
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Short name used in logs and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Migrating { .. } => "migrating",
            Self::Aborting { .. } => "aborting",
            Self::PersistState { .. } => "persistState",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
