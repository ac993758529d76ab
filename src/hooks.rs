//! External Collaborators
//!
//! Interface-level seams for concerns the engine does not own: pre-start
//! short-circuiting, network-state gating for wifi-only tasks, and the
//! opaque notification configuration passed through on updates.

use async_trait::async_trait;

use crate::task::{Task, TaskStatus};

/// Opaque notification configuration, forwarded untouched to whatever layer
/// renders notifications.
pub type NotificationConfig = String;

/// Hook invoked before a worker opens its connection.
///
/// Returning `Some(status)` short-circuits the task with that final status
/// (for example a policy layer refusing a transfer).
#[async_trait]
pub trait BeforeStartHook: Send + Sync {
    async fn before_start(&self, task: &Task) -> Option<TaskStatus>;
}

/// No-op hook used when the client installs none.
pub struct NoopBeforeStartHook;

#[async_trait]
impl BeforeStartHook for NoopBeforeStartHook {
    async fn before_start(&self, _task: &Task) -> Option<TaskStatus> {
        None
    }
}

/// Network-state provider consulted for `requires_wifi` tasks.
pub trait NetworkMonitor: Send + Sync {
    /// True when an unmetered connection is available.
    fn unmetered_available(&self) -> bool;
}

/// Default monitor: assumes an unmetered connection.
pub struct AlwaysUnmetered;

impl NetworkMonitor for AlwaysUnmetered {
    fn unmetered_available(&self) -> bool {
        true
    }
}
