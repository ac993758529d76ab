//! Update Bus
//!
//! Fan-out of status and progress updates to the client. Per-group callbacks
//! take precedence over the broadcast channel; updates that reach neither are
//! buffered in the store's undelivered collections and drained to the first
//! subscriber at the next engine start.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{TaskError, TaskException, TaskResult};
use crate::store::{collections, FileStore};
use crate::task::codec;
use crate::task::{Task, TaskStatus};

/// Status update payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdate {
    pub task: Task,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
}

impl TaskStatusUpdate {
    pub fn simple(task: Task, status: TaskStatus) -> Self {
        Self {
            task,
            status,
            exception: None,
            response_body: None,
            response_headers: None,
            response_status_code: None,
            mime_type: None,
            charset: None,
        }
    }

    pub fn failed(task: Task, exception: TaskException) -> Self {
        let mut update = Self::simple(task, TaskStatus::Failed);
        update.exception = Some(exception);
        update
    }

    /// Positional wire form:
    /// `[task, status, exc_type?, exc_description?, http_code?, body?,
    ///   headers?, response_code?, mime_type?, charset?]`
    pub fn to_wire(&self) -> Value {
        let mut list = vec![codec::task_to_json(&self.task), json!(self.status.ordinal())];
        let mut tail: Vec<Value> = Vec::new();
        if let Some(exc) = &self.exception {
            tail.push(json!(exc.kind.as_str()));
            tail.push(json!(exc.description));
            tail.push(exc.http_response_code.map(|c| json!(c)).unwrap_or(Value::Null));
        } else {
            tail.extend([Value::Null, Value::Null, Value::Null]);
        }
        tail.push(self.response_body.as_ref().map(|b| json!(b)).unwrap_or(Value::Null));
        tail.push(
            self.response_headers
                .as_ref()
                .map(|h| json!(h))
                .unwrap_or(Value::Null),
        );
        tail.push(
            self.response_status_code
                .map(|c| json!(c))
                .unwrap_or(Value::Null),
        );
        tail.push(self.mime_type.as_ref().map(|m| json!(m)).unwrap_or(Value::Null));
        tail.push(self.charset.as_ref().map(|c| json!(c)).unwrap_or(Value::Null));
        // drop the all-null tail so simple updates stay short
        while tail.last() == Some(&Value::Null) {
            tail.pop();
        }
        list.extend(tail);
        Value::Array(list)
    }
}

/// Progress update payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressUpdate {
    pub task: Task,
    /// 0.0 ..< 1.0 while running, or a status sentinel
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_file_size: Option<i64>,
    /// MB per second; negative when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_speed: Option<f64>,
    /// Milliseconds; negative when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining_ms: Option<i64>,
}

impl TaskProgressUpdate {
    pub fn new(task: Task, progress: f64) -> Self {
        Self {
            task,
            progress,
            expected_file_size: None,
            network_speed: None,
            time_remaining_ms: None,
        }
    }

    /// Positional wire form:
    /// `[task, progress, expected_file_size?, network_speed?, time_remaining_ms?]`
    pub fn to_wire(&self) -> Value {
        let mut list = vec![codec::task_to_json(&self.task), json!(self.progress)];
        let mut tail: Vec<Value> = vec![
            self.expected_file_size.map(|s| json!(s)).unwrap_or(Value::Null),
            self.network_speed.map(|s| json!(s)).unwrap_or(Value::Null),
            self.time_remaining_ms.map(|t| json!(t)).unwrap_or(Value::Null),
        ];
        while tail.last() == Some(&Value::Null) {
            tail.pop();
        }
        list.extend(tail);
        Value::Array(list)
    }
}

/// Either kind of update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskUpdate {
    Status(TaskStatusUpdate),
    Progress(TaskProgressUpdate),
}

impl TaskUpdate {
    pub fn task(&self) -> &Task {
        match self {
            Self::Status(u) => &u.task,
            Self::Progress(u) => &u.task,
        }
    }
}

type GroupCallback = Arc<dyn Fn(&TaskUpdate) + Send + Sync>;

/// Fan-out hub for task updates
pub struct UpdateBus {
    sender: tokio::sync::broadcast::Sender<TaskUpdate>,
    group_callbacks: RwLock<HashMap<String, GroupCallback>>,
    store: FileStore,
}

impl UpdateBus {
    pub fn new(store: FileStore, capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            sender,
            group_callbacks: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Subscribe to the broadcast stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskUpdate> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Register a callback receiving every update for `group`, bypassing the
    /// broadcast channel.
    pub fn register_group_callback(
        &self,
        group: impl Into<String>,
        callback: GroupCallback,
    ) {
        self.group_callbacks
            .write()
            .unwrap()
            .insert(group.into(), callback);
    }

    pub fn unregister_group_callback(&self, group: &str) {
        self.group_callbacks.write().unwrap().remove(group);
    }

    /// Deliver an update. Returns true when a callback or subscriber took it;
    /// otherwise the update lands in the undelivered buffer.
    pub fn publish(&self, update: TaskUpdate) -> bool {
        let group = update.task().group.clone();
        let callback = {
            let callbacks = self.group_callbacks.read().unwrap();
            callbacks.get(&group).cloned()
        };
        if let Some(callback) = callback {
            callback(&update);
            return true;
        }
        if self.sender.receiver_count() > 0 && self.sender.send(update.clone()).is_ok() {
            return true;
        }
        self.buffer_undelivered(&update);
        false
    }

    /// Latest undelivered update per task, per kind; overwritten in place so
    /// the buffer never grows past one record per task.
    fn buffer_undelivered(&self, update: &TaskUpdate) {
        let (collection, task_id) = match update {
            TaskUpdate::Status(u) => (collections::STATUS_UPDATES, u.task.task_id.clone()),
            TaskUpdate::Progress(u) => (collections::PROGRESS_UPDATES, u.task.task_id.clone()),
        };
        if let Err(e) = self.store.put(collection, &task_id, update) {
            tracing::warn!("cannot buffer undelivered update for {task_id}: {e}");
        }
    }

    /// Re-deliver buffered updates to the current subscriber(s) and clear the
    /// buffers. Status updates drain before progress updates.
    pub fn drain_undelivered(&self) -> TaskResult<usize> {
        if self.sender.receiver_count() == 0 {
            return Err(TaskError::General(
                "cannot drain undelivered updates without a subscriber".into(),
            ));
        }
        let mut delivered = 0;
        for collection in [collections::STATUS_UPDATES, collections::PROGRESS_UPDATES] {
            let updates: Vec<TaskUpdate> = self.store.all(collection)?;
            for update in updates {
                if self.sender.send(update).is_ok() {
                    delivered += 1;
                }
            }
            self.store.clear(collection)?;
        }
        if delivered > 0 {
            tracing::info!("drained {delivered} undelivered updates");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus() -> (tempfile::TempDir, UpdateBus) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        (dir, UpdateBus::new(store, 64))
    }

    fn status_update(id: &str) -> TaskUpdate {
        TaskUpdate::Status(TaskStatusUpdate::simple(
            Task::download(id, "https://example.com/f"),
            TaskStatus::Complete,
        ))
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let (_dir, bus) = bus();
        let mut rx = bus.subscribe();
        assert!(bus.publish(status_update("t1")));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.task().task_id, "t1");
    }

    #[tokio::test]
    async fn test_group_callback_takes_precedence() {
        let (_dir, bus) = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.register_group_callback(
            "default",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut rx = bus.subscribe();
        assert!(bus.publish(status_update("t1")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // nothing went to the broadcast channel
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_undelivered_buffer_and_drain() {
        let (_dir, bus) = bus();
        // no subscriber: buffered
        assert!(!bus.publish(status_update("t1")));
        assert!(!bus.publish(status_update("t2")));
        let mut rx = bus.subscribe();
        let drained = bus.drain_undelivered().unwrap();
        assert_eq!(drained, 2);
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.recv().await.unwrap().task().task_id.clone());
        }
        seen.sort();
        assert_eq!(seen, vec!["t1", "t2"]);
        // buffers cleared
        assert_eq!(bus.drain_undelivered().unwrap(), 0);
    }

    #[test]
    fn test_status_wire_shape() {
        let task = Task::download("t1", "https://example.com/f");
        let mut update = TaskStatusUpdate::simple(task, TaskStatus::Failed);
        update.exception = Some(TaskException {
            kind: crate::error::ExceptionKind::HttpResponse,
            http_response_code: Some(503),
            description: "HTTP 503: unavailable".into(),
        });
        let wire = update.to_wire();
        let list = wire.as_array().unwrap();
        assert_eq!(list[1], json!(4)); // failed ordinal
        assert_eq!(list[2], json!("http-response"));
        assert_eq!(list[4], json!(503));
    }

    #[test]
    fn test_progress_wire_shape() {
        let task = Task::download("t1", "https://example.com/f");
        let update = TaskProgressUpdate {
            task,
            progress: 0.25,
            expected_file_size: Some(1000),
            network_speed: Some(1.5),
            time_remaining_ms: Some(3000),
        };
        let list_value = update.to_wire();
        let list = list_value.as_array().unwrap();
        assert_eq!(list.len(), 5);
        assert_eq!(list[1], json!(0.25));
        assert_eq!(list[4], json!(3000));
    }

    #[test]
    fn test_simple_status_wire_is_short() {
        let update = TaskStatusUpdate::simple(
            Task::download("t1", "https://example.com/f"),
            TaskStatus::Complete,
        );
        assert_eq!(update.to_wire().as_array().unwrap().len(), 2);
    }
}
