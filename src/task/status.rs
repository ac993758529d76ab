//! Task Status
//!
//! Lifecycle states for transfer tasks, with the capability matrix used by
//! the engine facade and the progress sentinels used on the update bus.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    /// Accepted into the holding queue, not yet dispatched
    Enqueued,
    /// A worker is actively transferring
    Running,
    /// Finished successfully
    Complete,
    /// Server answered 404 for the resource
    NotFound,
    /// Finished with an error
    Failed,
    /// Canceled by request
    Canceled,
    /// Failed, waiting out the retry back-off
    WaitingToRetry,
    /// Paused with resume data captured
    Paused,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Enqueued
    }
}

impl TaskStatus {
    /// Zero-based wire ordinal.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Enqueued => 0,
            Self::Running => 1,
            Self::Complete => 2,
            Self::NotFound => 3,
            Self::Failed => 4,
            Self::Canceled => 5,
            Self::WaitingToRetry => 6,
            Self::Paused => 7,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Enqueued),
            1 => Some(Self::Running),
            2 => Some(Self::Complete),
            3 => Some(Self::NotFound),
            4 => Some(Self::Failed),
            5 => Some(Self::Canceled),
            6 => Some(Self::WaitingToRetry),
            7 => Some(Self::Paused),
            _ => None,
        }
    }

    /// Final states remove the task from live accounting and storage.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::NotFound | Self::Failed | Self::Canceled
        )
    }

    /// Progress value broadcast when this status replaces a progress event.
    ///
    /// Running and enqueued states have real progress and no sentinel.
    pub fn progress_sentinel(&self) -> Option<f64> {
        match self {
            Self::Complete => Some(PROGRESS_COMPLETE),
            Self::Failed => Some(PROGRESS_FAILED),
            Self::Canceled => Some(PROGRESS_CANCELED),
            Self::NotFound => Some(PROGRESS_NOT_FOUND),
            Self::WaitingToRetry => Some(PROGRESS_WAITING_TO_RETRY),
            Self::Paused => Some(PROGRESS_PAUSED),
            Self::Enqueued | Self::Running => None,
        }
    }
}

/// Progress sentinels for non-running statuses
pub const PROGRESS_COMPLETE: f64 = 1.0;
pub const PROGRESS_FAILED: f64 = -1.0;
pub const PROGRESS_CANCELED: f64 = -2.0;
pub const PROGRESS_NOT_FOUND: f64 = -3.0;
pub const PROGRESS_WAITING_TO_RETRY: f64 = -4.0;
pub const PROGRESS_PAUSED: f64 = -5.0;

/// Time-remaining value used when network speed is not yet known.
pub const TIME_REMAINING_UNKNOWN: i64 = -1;
