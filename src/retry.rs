//! Retry Scheduler
//!
//! Holds tasks in waiting-to-retry and re-submits them after an exponential
//! back-off. Retry attempts restart from byte zero; progress is reset when
//! the attempt begins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::task::Task;

/// Back-off ceiling (6 hours).
const MAX_BACKOFF: Duration = Duration::from_secs(6 * 60 * 60);

/// Exponential back-off: `2^(retries - retries_remaining)` seconds, clamped.
///
/// Called after `retries_remaining` has been decremented, so the first retry
/// waits 2 s, the second 4 s, and so on.
pub fn backoff_delay(retries: u32, retries_remaining: u32) -> Duration {
    let exponent = retries.saturating_sub(retries_remaining).min(63);
    let secs = 2u64.saturating_pow(exponent);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

struct WaitingEntry {
    task: Task,
    deadline: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Scheduler for tasks waiting out their retry back-off
pub struct RetryScheduler {
    waiting: Mutex<HashMap<String, WaitingEntry>>,
    ready_tx: mpsc::UnboundedSender<Task>,
}

impl RetryScheduler {
    /// Create the scheduler; the receiver yields tasks whose back-off has
    /// elapsed, ready for re-enqueue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            Self {
                waiting: Mutex::new(HashMap::new()),
                ready_tx,
            },
            ready_rx,
        )
    }

    /// Park `task` for `delay`, then emit it on the ready channel.
    pub fn schedule(&self, task: Task, delay: Duration) {
        let task_id = task.task_id.clone();
        let deadline = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let tx = self.ready_tx.clone();
        let task_clone = task.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task_clone);
        });
        tracing::debug!("task {task_id} waiting {delay:?} before retry");
        let mut waiting = self.waiting.lock().unwrap();
        if let Some(previous) = waiting.insert(
            task_id,
            WaitingEntry {
                task,
                deadline,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Forget a waiter once its sleep fired and it was re-enqueued.
    pub fn take_ready(&self, task_id: &str) -> Option<Task> {
        let mut waiting = self.waiting.lock().unwrap();
        waiting.remove(task_id).map(|entry| entry.task)
    }

    /// Cancel a waiter; the back-off sleep is aborted and the task returned
    /// with its `retries_remaining` untouched.
    pub fn cancel(&self, task_id: &str) -> Option<Task> {
        let mut waiting = self.waiting.lock().unwrap();
        waiting.remove(task_id).map(|entry| {
            entry.handle.abort();
            entry.task
        })
    }

    /// Cancel every waiter in `group`.
    pub fn cancel_group(&self, group: &str) -> Vec<Task> {
        let mut waiting = self.waiting.lock().unwrap();
        let ids: Vec<String> = waiting
            .iter()
            .filter(|(_, entry)| entry.task.group == group)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                waiting.remove(&id).map(|entry| {
                    entry.handle.abort();
                    entry.task
                })
            })
            .collect()
    }

    pub fn task_for_id(&self, task_id: &str) -> Option<Task> {
        let waiting = self.waiting.lock().unwrap();
        waiting.get(task_id).map(|entry| entry.task.clone())
    }

    pub fn tasks_in_group(&self, group: &str) -> Vec<Task> {
        let waiting = self.waiting.lock().unwrap();
        waiting
            .values()
            .filter(|entry| entry.task.group == group)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn is_waiting(&self, task_id: &str) -> bool {
        self.waiting.lock().unwrap().contains_key(task_id)
    }

    /// Next deadline, for diagnostics.
    pub fn deadline_for(&self, task_id: &str) -> Option<DateTime<Utc>> {
        let waiting = self.waiting.lock().unwrap();
        waiting.get(task_id).map(|entry| entry.deadline)
    }
}
