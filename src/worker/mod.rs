//! Transfer Workers
//!
//! One worker executes one transfer attempt. The common contract: resolve
//! paths, open the connection, stream bytes, emit progress under the cadence
//! policy, poll the stop/pause signals every 100 ms, and hand a single
//! terminal outcome back to the engine (which emits it under a guard that
//! cannot be canceled).

pub mod data;
pub mod download;
pub mod multipart;
pub mod parallel;
pub mod progress;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::events::TaskProgressUpdate;
use crate::task::{ResumeData, Task, TaskKind};

/// Interval at which workers poll the stop and pause signals.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Buffer size between socket and file.
pub const STREAM_BUFFER_SIZE: usize = 8 * 1024;

/// Terminal outcome of one transfer attempt
#[derive(Debug)]
pub enum Outcome {
    /// Transfer finished; data tasks carry the captured response
    Complete {
        response_body: Option<String>,
        response_headers: Option<std::collections::HashMap<String, String>>,
        response_status_code: Option<u16>,
        mime_type: Option<String>,
        charset: Option<String>,
    },
    /// Server answered 404
    NotFound,
    /// Transfer failed with a classified error
    Failed(TaskError),
    /// Stop signal observed; partial artifacts removed
    Canceled,
    /// Pause signal observed; partial state snapshotted
    Paused(ResumeData),
}

impl Outcome {
    pub fn complete() -> Self {
        Self::Complete {
            response_body: None,
            response_headers: None,
            response_status_code: None,
            mime_type: None,
            charset: None,
        }
    }
}

/// Result of a worker run: the task (possibly with a resolved filename) and
/// its terminal outcome.
#[derive(Debug)]
pub struct WorkerResult {
    pub task: Task,
    pub outcome: Outcome,
}

/// Process-wide state shared by every worker
pub struct SharedState {
    /// Task ids with a pending pause request
    pub paused_ids: DashSet<String>,
    /// Bytes still to download per live download task
    pub remaining_bytes: DashMap<String, u64>,
    /// Whether each live task's server supports resume
    pub can_resume: DashMap<String, bool>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            paused_ids: DashSet::new(),
            remaining_bytes: DashMap::new(),
            can_resume: DashMap::new(),
        }
    }

    /// Sum of remaining bytes across live downloads, excluding `task_id`.
    pub fn remaining_bytes_elsewhere(&self, task_id: &str) -> u64 {
        self.remaining_bytes
            .iter()
            .filter(|entry| entry.key() != task_id)
            .map(|entry| *entry.value())
            .sum()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker needs to run one attempt
pub struct RunContext {
    pub client: reqwest::Client,
    pub config: Arc<EngineConfig>,
    pub shared: Arc<SharedState>,
    /// Flipped by the engine to request cancellation
    pub cancel: CancellationToken,
    /// Resume payload for resumed downloads
    pub resume_data: Option<ResumeData>,
    /// Wall-clock deadline for this attempt
    pub deadline: std::time::Instant,
    /// Progress emission callback into the update pipeline
    pub emit_progress: Arc<dyn Fn(TaskProgressUpdate) + Send + Sync>,
}

/// Why a transfer loop stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Canceled,
    Paused,
    /// Resource timeout expired; resumable tasks convert this into a pause
    TimedOut,
}

/// Check the stop, pause and deadline signals for `task`.
///
/// A pause request is only honored when the task allows pausing and the
/// server was seen to support resume; otherwise it is ignored and the
/// transfer continues.
pub fn check_stop(ctx: &RunContext, task: &Task) -> Option<StopCause> {
    if ctx.cancel.is_cancelled() {
        return Some(StopCause::Canceled);
    }
    let resumable = task.allow_pause
        && ctx
            .shared
            .can_resume
            .get(&task.task_id)
            .map(|entry| *entry.value())
            .unwrap_or(false);
    if resumable && ctx.shared.paused_ids.contains(&task.task_id) {
        return Some(StopCause::Paused);
    }
    if std::time::Instant::now() >= ctx.deadline {
        return Some(if resumable {
            StopCause::Paused
        } else {
            StopCause::TimedOut
        });
    }
    None
}

/// Run one transfer attempt for `task`, dispatching on its kind.
///
/// Parallel downloads are coordinated by the engine (they enqueue child
/// tasks) and do not pass through here.
pub async fn run_task(task: Task, ctx: RunContext) -> WorkerResult {
    let task_id = task.task_id.clone();
    let result = match task.task_kind {
        TaskKind::Download => download::run(task, &ctx).await,
        TaskKind::Upload | TaskKind::MultiUpload => upload::run(task, &ctx).await,
        TaskKind::Data => data::run(task, &ctx).await,
        TaskKind::ParallelDownload => WorkerResult {
            task,
            outcome: Outcome::Failed(TaskError::General(
                "parallel downloads are coordinated by the engine".into(),
            )),
        },
    };
    cleanup_shared(&task_id, &ctx);
    result
}

// paused_ids is left for the engine: it distinguishes a requested pause
// from a deadline-triggered one when it processes the outcome
fn cleanup_shared(task_id: &str, ctx: &RunContext) {
    ctx.shared.remaining_bytes.remove(task_id);
    ctx.shared.can_resume.remove(task_id);
}

/// Truncate a captured response body to at most `max` bytes, backing off to
/// the nearest character boundary.
pub(crate) fn truncate_capture(body: &mut String, max: usize) {
    if body.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TaskProgressUpdate;

    fn context() -> RunContext {
        RunContext {
            client: reqwest::Client::new(),
            config: Arc::new(EngineConfig::default()),
            shared: Arc::new(SharedState::new()),
            cancel: CancellationToken::new(),
            resume_data: None,
            deadline: std::time::Instant::now() + Duration::from_secs(3600),
            emit_progress: Arc::new(|_: TaskProgressUpdate| {}),
        }
    }

    #[test]
    fn test_check_stop_cancel() {
        let ctx = context();
        let task = Task::download("t1", "https://example.com/f");
        assert_eq!(check_stop(&ctx, &task), None);
        ctx.cancel.cancel();
        assert_eq!(check_stop(&ctx, &task), Some(StopCause::Canceled));
    }

    #[test]
    fn test_pause_requires_resumable() {
        let ctx = context();
        let mut task = Task::download("t1", "https://example.com/f");
        task.allow_pause = true;
        ctx.shared.paused_ids.insert("t1".to_string());
        // server resume support not yet seen: pause ignored
        assert_eq!(check_stop(&ctx, &task), None);
        ctx.shared.can_resume.insert("t1".to_string(), true);
        assert_eq!(check_stop(&ctx, &task), Some(StopCause::Paused));
        // tasks that forbid pausing never pause
        task.allow_pause = false;
        assert_eq!(check_stop(&ctx, &task), None);
    }

    #[test]
    fn test_truncate_capture_respects_boundaries() {
        let mut body = "aé".repeat(4);
        // index 5 falls inside the second 'é'; back off to the boundary
        truncate_capture(&mut body, 5);
        assert_eq!(body, "aéa");
        let mut short = "abc".to_string();
        truncate_capture(&mut short, 10);
        assert_eq!(short, "abc");
    }

    #[test]
    fn test_remaining_bytes_elsewhere() {
        let shared = SharedState::new();
        shared.remaining_bytes.insert("a".to_string(), 100);
        shared.remaining_bytes.insert("b".to_string(), 50);
        assert_eq!(shared.remaining_bytes_elsewhere("a"), 50);
        assert_eq!(shared.remaining_bytes_elsewhere("c"), 150);
    }
}
