//! Engine Facade
//!
//! The single owning value of the transfer engine: public task operations
//! (enqueue, cancel, pause, resume, query, track), the dispatcher that turns
//! admitted queue items into workers, and lifecycle (restore on start,
//! cooperative shutdown). All task state flows through here; workers never
//! touch the store directly.

pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::TaskResult;
use crate::events::{TaskProgressUpdate, TaskStatusUpdate, TaskUpdate, UpdateBus};
use crate::hooks::{AlwaysUnmetered, BeforeStartHook, NetworkMonitor, NoopBeforeStartHook};
use crate::queue::{AdmissionCaps, EnqueueItem, HoldingQueue};
use crate::retry::{backoff_delay, RetryScheduler};
use crate::store::{collections, FileStore};
use crate::task::{ResumeData, Task, TaskKind, TaskStatus};
use crate::worker::parallel::{ChunkMetadata, ParallelContext, CHUNK_GROUP};
use crate::transport;
use crate::worker::{self, Outcome, RunContext, SharedState, WorkerResult};

use tracker::Tracker;

/// Admission watchdog interval.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Counter self-heal interval.
const RECOMPUTE_INTERVAL: Duration = Duration::from_secs(60);

/// Broadcast channel capacity.
const BUS_CAPACITY: usize = 1024;

/// Engine-internal control messages (chunk coordinator transport).
enum Control {
    ChildEnqueue(Task),
    ChildCancel(String),
}

struct LiveWorker {
    task: Task,
    cancel: CancellationToken,
}

/// The background transfer engine
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    store: FileStore,
    bus: UpdateBus,
    queue: HoldingQueue,
    retry: RetryScheduler,
    tracker: Tracker,
    shared: Arc<SharedState>,
    live: DashMap<String, LiveWorker>,
    paused: DashMap<String, (Task, ResumeData)>,
    notification_configs: DashMap<String, String>,
    /// parent task id -> channel feeding its chunk coordinator
    chunk_routes: DashMap<String, mpsc::UnboundedSender<TaskUpdate>>,
    admission_notify: Notify,
    control_tx: mpsc::UnboundedSender<Control>,
    before_start: Arc<dyn BeforeStartHook>,
    network: Arc<dyn NetworkMonitor>,
    shutdown: CancellationToken,
}

/// Receivers handed to the background loops at `start()`.
struct Pending {
    control_rx: mpsc::UnboundedReceiver<Control>,
    retry_rx: mpsc::UnboundedReceiver<Task>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> TaskResult<Self> {
        Self::with_collaborators(
            config,
            Arc::new(NoopBeforeStartHook),
            Arc::new(AlwaysUnmetered),
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        before_start: Arc<dyn BeforeStartHook>,
        network: Arc<dyn NetworkMonitor>,
    ) -> TaskResult<Self> {
        let store = FileStore::open(&config.store_dir)?;
        let client = transport::build_client(&config)?;
        let bus = UpdateBus::new(store.clone(), BUS_CAPACITY);
        let queue = HoldingQueue::new(AdmissionCaps::from(&config));
        let (retry, retry_rx) = RetryScheduler::new();
        let tracker = Tracker::new(store.clone(), config.base_dirs.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config: Arc::new(config),
            client,
            store,
            bus,
            queue,
            retry,
            tracker,
            shared: Arc::new(SharedState::new()),
            live: DashMap::new(),
            paused: DashMap::new(),
            notification_configs: DashMap::new(),
            chunk_routes: DashMap::new(),
            admission_notify: Notify::new(),
            control_tx,
            before_start,
            network,
            shutdown: CancellationToken::new(),
        });
        let engine = Self { inner };
        engine.spawn_loops(Pending {
            control_rx,
            retry_rx,
        });
        Ok(engine)
    }

    /// Restore persisted state and kick admission. Call once, after
    /// subscribing a listener if buffered updates from a previous run should
    /// be received.
    pub async fn start(&self) -> TaskResult<usize> {
        let restored = self.inner.restore().await?;
        if self.inner.bus.subscriber_count() > 0 {
            let _ = self.inner.bus.drain_undelivered();
        }
        self.inner.admission_notify.notify_one();
        Ok(restored)
    }

    /// Stop cooperatively: cancel workers without treating it as a client
    /// cancel, so in-flight tasks stay persisted for the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.live.iter() {
            entry.value().cancel.cancel();
        }
        // give workers a moment to observe the flag
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !self.inner.live.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!("engine stopped");
    }

    // ---- task submission -------------------------------------------------

    /// Validate and submit one task. Returns false (emitting nothing) when
    /// the URL is invalid.
    pub fn enqueue(&self, task: Task, notification_config: Option<String>) -> bool {
        self.enqueue_all_with_config(vec![(task, notification_config)])
            .pop()
            .unwrap_or(false)
    }

    /// Batch submission: one store write pass, one queue insert, one
    /// admission signal.
    pub fn enqueue_all(&self, tasks: Vec<Task>) -> Vec<bool> {
        self.enqueue_all_with_config(tasks.into_iter().map(|t| (t, None)).collect())
    }

    fn enqueue_all_with_config(&self, tasks: Vec<(Task, Option<String>)>) -> Vec<bool> {
        let inner = &self.inner;
        let mut results = Vec::with_capacity(tasks.len());
        let mut items = Vec::new();
        for (mut task, notification_config) in tasks {
            if let Err(e) = task.validate() {
                tracing::warn!("rejecting task {}: {e}", task.task_id);
                results.push(false);
                continue;
            }
            if inner.task_exists(&task.task_id) {
                tracing::warn!("rejecting task {}: id already in use", task.task_id);
                results.push(false);
                continue;
            }
            task.retries_remaining = task.retries;
            if let Err(e) = inner.store.put(collections::TASKS, &task.task_id, &task) {
                tracing::error!("cannot persist task {}: {e}", task.task_id);
                results.push(false);
                continue;
            }
            if let Some(config) = notification_config {
                inner
                    .notification_configs
                    .insert(task.task_id.clone(), config);
            }
            items.push(EnqueueItem::new(task));
            results.push(true);
        }
        if !items.is_empty() {
            let tasks_for_status: Vec<Task> = items.iter().map(|i| i.task.clone()).collect();
            inner.queue.add_all(items);
            for task in &tasks_for_status {
                inner.emit_status(task, TaskStatus::Enqueued, None);
            }
            inner.admission_notify.notify_one();
        }
        results
    }

    // ---- cancel / pause / resume ----------------------------------------

    /// Cancel each task by id: queued, waiting-to-retry and paused tasks are
    /// finalized directly; running workers are signalled. Idempotent.
    pub async fn cancel_tasks_with_ids(&self, ids: &[String]) -> bool {
        for id in ids {
            self.inner.cancel_one(id).await;
        }
        true
    }

    pub async fn cancel_all(&self, group: Option<&str>) -> usize {
        let ids: Vec<String> = self
            .all_tasks(group, true)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        let count = ids.len();
        self.cancel_tasks_with_ids(&ids).await;
        count
    }

    /// Cancel every non-final task in `group`; returns how many were hit.
    pub async fn reset(&self, group: &str) -> usize {
        self.cancel_all(Some(group)).await
    }

    /// Request a pause. False unless the task is running, allows pausing and
    /// the server was seen to support resume.
    pub fn pause(&self, task_id: &str) -> bool {
        let inner = &self.inner;
        let Some(live) = inner.live.get(task_id) else {
            return false;
        };
        let task = &live.task;
        if !task.allow_pause
            || matches!(
                task.task_kind,
                TaskKind::Upload | TaskKind::MultiUpload | TaskKind::Data
            )
        {
            return false;
        }
        let resumable = inner
            .shared
            .can_resume
            .get(task_id)
            .map(|entry| *entry.value())
            .unwrap_or(false);
        if !resumable {
            return false;
        }
        inner.shared.paused_ids.insert(task_id.to_string());
        true
    }

    /// Pause every pauseable running task; returns the ids actually signalled.
    pub fn pause_all(&self) -> Vec<String> {
        let ids: Vec<String> = self
            .inner
            .live
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter().filter(|id| self.pause(id)).collect()
    }

    /// Re-enqueue a paused task with its resume payload.
    pub fn resume(&self, task_id: &str, notification_config: Option<String>) -> bool {
        let inner = &self.inner;
        let Some((_, (task, resume_data))) = inner.paused.remove(task_id) else {
            return false;
        };
        if let Some(config) = notification_config {
            inner.notification_configs.insert(task_id.to_string(), config);
        }
        inner.re_enqueue(task, Some(resume_data));
        true
    }

    pub fn resume_all(&self) -> Vec<String> {
        let ids: Vec<String> = self
            .inner
            .paused
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter()
            .filter(|id| self.resume(id, None))
            .collect()
    }

    // ---- queries ---------------------------------------------------------

    /// Union of queued, running, paused and (optionally) waiting-to-retry
    /// tasks, filtered by group.
    pub fn all_tasks(&self, group: Option<&str>, include_waiting_to_retry: bool) -> Vec<Task> {
        let inner = &self.inner;
        let matches = |task: &Task| {
            task.group != CHUNK_GROUP && group.map(|g| task.group == g).unwrap_or(true)
        };
        let mut tasks: Vec<Task> = Vec::new();
        match group {
            Some(g) => tasks.extend(inner.queue.tasks_in_group(g)),
            None => tasks.extend(inner.queue.all_tasks()),
        }
        tasks.extend(inner.live.iter().map(|entry| entry.value().task.clone()));
        tasks.extend(inner.paused.iter().map(|entry| entry.value().0.clone()));
        if include_waiting_to_retry {
            match group {
                Some(g) => tasks.extend(inner.retry.tasks_in_group(g)),
                None => tasks.extend(inner.all_waiting_tasks()),
            }
        }
        tasks.retain(|task| matches(task));
        // queued duplicates possible when a task raced from queue to live
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks.dedup_by(|a, b| a.task_id == b.task_id);
        tasks
    }

    pub fn all_task_ids(&self, group: Option<&str>, include_waiting_to_retry: bool) -> Vec<String> {
        self.all_tasks(group, include_waiting_to_retry)
            .into_iter()
            .map(|t| t.task_id)
            .collect()
    }

    /// First hit across waiting-to-retry, paused, queued and running tasks.
    pub fn task_for_id(&self, task_id: &str) -> Option<Task> {
        let inner = &self.inner;
        inner
            .retry
            .task_for_id(task_id)
            .or_else(|| inner.paused.get(task_id).map(|entry| entry.value().0.clone()))
            .or_else(|| inner.queue.task_for_id(task_id))
            .or_else(|| inner.live.get(task_id).map(|entry| entry.task.clone()))
    }

    // ---- tracking --------------------------------------------------------

    /// Persist a `TaskRecord` per event for `group` (all groups when `None`).
    /// With `mark_downloaded_complete`, records whose file already exists are
    /// promoted to complete and their updates re-emitted.
    pub fn track_tasks(&self, group: Option<&str>, mark_downloaded_complete: bool) -> TaskResult<()> {
        let promoted = self.inner.tracker.track(group, mark_downloaded_complete)?;
        for record in promoted {
            self.inner
                .emit_status(&record.task, TaskStatus::Complete, None);
        }
        Ok(())
    }

    pub fn record_for_id(&self, task_id: &str) -> Option<tracker::TaskRecord> {
        self.inner.tracker.record_for_id(task_id)
    }

    pub fn records_in_group(&self, group: Option<&str>) -> TaskResult<Vec<tracker::TaskRecord>> {
        self.inner.tracker.records_in_group(group)
    }

    pub fn remove_records(&self, group: Option<&str>) -> TaskResult<usize> {
        self.inner.tracker.remove_records(group)
    }

    // ---- events ----------------------------------------------------------

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskUpdate> {
        self.inner.bus.subscribe()
    }

    pub fn register_group_callback(
        &self,
        group: impl Into<String>,
        callback: Arc<dyn Fn(&TaskUpdate) + Send + Sync>,
    ) {
        self.inner.bus.register_group_callback(group, callback);
    }

    pub fn unregister_group_callback(&self, group: &str) {
        self.inner.bus.unregister_group_callback(group);
    }

    /// Deliver updates buffered while no listener existed.
    pub fn drain_undelivered(&self) -> TaskResult<usize> {
        self.inner.bus.drain_undelivered()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ---- background loops ------------------------------------------------

    fn spawn_loops(&self, pending: Pending) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.admission_loop().await });
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.recompute_loop().await });
        let inner = Arc::clone(&self.inner);
        let control_rx = pending.control_rx;
        tokio::spawn(async move { inner.control_loop(control_rx).await });
        let inner = Arc::clone(&self.inner);
        let retry_rx = pending.retry_rx;
        tokio::spawn(async move { inner.retry_loop(retry_rx).await });
    }
}

impl Inner {
    fn task_exists(&self, task_id: &str) -> bool {
        self.queue.task_for_id(task_id).is_some()
            || self.live.contains_key(task_id)
            || self.paused.contains_key(task_id)
            || self.retry.is_waiting(task_id)
    }

    fn all_waiting_tasks(&self) -> Vec<Task> {
        // the scheduler has no "all" accessor by design; collect via ids
        self.store
            .all::<Task>(collections::TASKS)
            .unwrap_or_default()
            .into_iter()
            .filter(|task| self.retry.is_waiting(&task.task_id))
            .collect()
    }

    /// Restore persisted tasks: paused ones re-register their resume data,
    /// everything else re-enters the holding queue. Chunk children are
    /// dropped; their parent rebuilds them.
    async fn restore(&self) -> TaskResult<usize> {
        let tasks: Vec<Task> = self.store.all(collections::TASKS)?;
        let mut restored = 0;
        let mut items = Vec::new();
        for task in tasks {
            if task.group == CHUNK_GROUP {
                let _ = self.store.remove(collections::TASKS, &task.task_id);
                continue;
            }
            let resume: Option<ResumeData> = self
                .store
                .get(collections::RESUME_DATA, &task.task_id)
                .unwrap_or(None);
            match resume {
                Some(resume) => {
                    self.paused
                        .insert(task.task_id.clone(), (task, resume));
                }
                None => {
                    let mut item = EnqueueItem::new(task.clone());
                    item.resume_data = None;
                    items.push(item);
                    self.emit_status(&task, TaskStatus::Enqueued, None);
                }
            }
            restored += 1;
        }
        if !items.is_empty() {
            self.queue.add_all(items);
        }
        tracing::info!("restored {restored} persisted tasks");
        Ok(restored)
    }

    fn re_enqueue(&self, task: Task, resume_data: Option<ResumeData>) {
        let mut item = EnqueueItem::new(task.clone());
        item.resume_data = resume_data;
        item.notification_config = self
            .notification_configs
            .get(&task.task_id)
            .map(|entry| entry.value().clone());
        self.queue.add(item);
        self.emit_status(&task, TaskStatus::Enqueued, None);
        self.admission_notify.notify_one();
    }

    async fn cancel_one(&self, task_id: &str) {
        if let Some(item) = self.queue.remove_by_id(task_id) {
            self.finalize_canceled(&item.task).await;
            return;
        }
        if let Some(task) = self.retry.cancel(task_id) {
            self.finalize_canceled(&task).await;
            return;
        }
        if let Some((_, (task, resume_data))) = self.paused.remove(task_id) {
            self.remove_paused_artifacts(&task, &resume_data).await;
            self.finalize_canceled(&task).await;
            return;
        }
        if let Some(live) = self.live.get(task_id) {
            live.cancel.cancel();
        }
        // unknown or already final: no-op
    }

    /// Delete the partial artifacts a paused task left behind.
    async fn remove_paused_artifacts(&self, task: &Task, resume_data: &ResumeData) {
        match task.task_kind {
            TaskKind::ParallelDownload => {
                #[derive(serde::Deserialize)]
                struct Snapshot {
                    chunks: Vec<crate::worker::parallel::Chunk>,
                }
                if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&resume_data.data) {
                    for chunk in snapshot.chunks {
                        let path =
                            std::path::PathBuf::from(&chunk.task.directory).join(&chunk.task.filename);
                        let _ = tokio::fs::remove_file(path).await;
                    }
                }
            }
            _ => {
                let _ = tokio::fs::remove_file(&resume_data.data).await;
            }
        }
    }

    async fn finalize_canceled(&self, task: &Task) {
        self.purge(&task.task_id);
        self.emit_status(task, TaskStatus::Canceled, None);
    }

    fn purge(&self, task_id: &str) {
        let _ = self.store.remove(collections::TASKS, task_id);
        let _ = self.store.remove(collections::RESUME_DATA, task_id);
        self.notification_configs.remove(task_id);
    }

    // ---- dispatch --------------------------------------------------------

    fn dispatch(self: &Arc<Self>, item: EnqueueItem) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let task = item.task.clone();
            let task_id = task.task_id.clone();
            if let Some(status) = inner.before_start.before_start(&task).await {
                inner.queue.task_finished(&task);
                inner.admission_notify.notify_one();
                inner.purge(&task_id);
                inner.emit_status(&task, status, None);
                return;
            }
            let cancel = CancellationToken::new();
            inner.live.insert(
                task_id.clone(),
                LiveWorker {
                    task: task.clone(),
                    cancel: cancel.clone(),
                },
            );
            inner.emit_status(&task, TaskStatus::Running, None);

            let emit_inner = Arc::clone(&inner);
            let ctx = RunContext {
                client: inner.client.clone(),
                config: Arc::clone(&inner.config),
                shared: Arc::clone(&inner.shared),
                cancel,
                resume_data: item.resume_data.clone(),
                deadline: std::time::Instant::now() + inner.config.resource_timeout(),
                emit_progress: Arc::new(move |update: TaskProgressUpdate| {
                    emit_inner.handle_progress(update);
                }),
            };

            let result = if task.task_kind == TaskKind::ParallelDownload {
                let (route_tx, route_rx) = mpsc::unbounded_channel();
                inner.chunk_routes.insert(task_id.clone(), route_tx);
                let ctx = ParallelContext {
                    base: ctx,
                    child_enqueue: child_enqueue_channel(&inner.control_tx),
                    child_cancel: child_cancel_channel(&inner.control_tx),
                    child_updates: route_rx,
                };
                let result = crate::worker::parallel::run(task, ctx).await;
                inner.chunk_routes.remove(&task_id);
                result
            } else {
                worker::run_task(task, ctx).await
            };

            inner.finish(result).await;
        });
    }

    /// Terminal handling for one attempt. Runs after the worker returned, so
    /// nothing here can be interrupted by a cancel signal: the final status
    /// is always emitted exactly once.
    async fn finish(&self, result: WorkerResult) {
        let task = result.task;
        let task_id = task.task_id.clone();
        let pause_requested = self.shared.paused_ids.remove(&task_id).is_some();
        self.live.remove(&task_id);
        self.queue.task_finished(&task);
        self.admission_notify.notify_one();

        if self.shutdown.is_cancelled() {
            // cooperative shutdown: keep the task persisted for restore
            let _ = self.store.put(collections::TASKS, &task_id, &task);
            return;
        }

        match result.outcome {
            Outcome::Complete {
                response_body,
                response_headers,
                response_status_code,
                mime_type,
                charset,
            } => {
                self.purge(&task_id);
                let mut update = TaskStatusUpdate::simple(task.clone(), TaskStatus::Complete);
                update.response_body = response_body;
                update.response_headers = response_headers;
                update.response_status_code = response_status_code;
                update.mime_type = mime_type;
                update.charset = charset;
                self.emit_status_update(update);
            }
            Outcome::NotFound => {
                self.purge(&task_id);
                self.emit_status(&task, TaskStatus::NotFound, None);
            }
            Outcome::Canceled => {
                self.purge(&task_id);
                self.emit_status(&task, TaskStatus::Canceled, None);
            }
            Outcome::Paused(resume_data) => {
                if let Err(e) = self
                    .store
                    .put(collections::RESUME_DATA, &task_id, &resume_data)
                {
                    tracing::error!("cannot persist resume data for {task_id}: {e}");
                }
                let _ = self.store.put(collections::TASKS, &task_id, &task);
                if pause_requested {
                    // register before emitting so a resume() call racing the
                    // paused update finds the task
                    self.paused
                        .insert(task_id.clone(), (task.clone(), resume_data));
                    self.emit_status(&task, TaskStatus::Paused, None);
                } else {
                    // deadline-triggered pause: immediately continue
                    tracing::debug!("auto-resuming {task_id} after timeout pause");
                    self.emit_status(&task, TaskStatus::Paused, None);
                    self.re_enqueue(task, Some(resume_data));
                }
            }
            Outcome::Failed(error) => {
                let retryable = error.is_retryable()
                    && task.retries_remaining > 0
                    && task.group != CHUNK_GROUP;
                if retryable {
                    let mut task = task;
                    task.retries_remaining -= 1;
                    let _ = self.store.put(collections::TASKS, &task_id, &task);
                    let delay = backoff_delay(task.retries, task.retries_remaining);
                    self.emit_status(&task, TaskStatus::WaitingToRetry, None);
                    self.retry.schedule(task, delay);
                } else {
                    self.purge(&task_id);
                    let exception = error.to_exception();
                    tracing::warn!("task {task_id} failed: {}", exception.description);
                    self.emit_status(&task, TaskStatus::Failed, Some(exception));
                }
            }
        }
    }

    // ---- update pipeline -------------------------------------------------

    fn emit_status(&self, task: &Task, status: TaskStatus, exception: Option<crate::error::TaskException>) {
        let mut update = TaskStatusUpdate::simple(task.clone(), status);
        update.exception = exception;
        self.emit_status_update(update);
    }

    fn emit_status_update(&self, update: TaskStatusUpdate) {
        let task = &update.task;
        if task.group == CHUNK_GROUP {
            self.route_to_coordinator(TaskUpdate::Status(update));
            return;
        }
        if self.tracker.is_tracked(&task.group) {
            self.tracker
                .record_status(task, update.status, update.exception.as_ref());
        }
        // a progress sentinel accompanies statuses that replace progress
        if task.provides_progress_updates() {
            if let Some(sentinel) = update.status.progress_sentinel() {
                self.bus.publish(TaskUpdate::Progress(TaskProgressUpdate::new(
                    task.clone(),
                    sentinel,
                )));
            }
        }
        if task.provides_status_updates() {
            self.bus.publish(TaskUpdate::Status(update));
        }
    }

    fn handle_progress(&self, update: TaskProgressUpdate) {
        let task = &update.task;
        if task.group == CHUNK_GROUP {
            self.route_to_coordinator(TaskUpdate::Progress(update));
            return;
        }
        if self.tracker.is_tracked(&task.group) {
            self.tracker
                .record_progress(task, update.progress, update.expected_file_size);
        }
        if task.provides_progress_updates() {
            self.bus.publish(TaskUpdate::Progress(update));
        }
    }

    fn route_to_coordinator(&self, update: TaskUpdate) {
        let Some(meta) = ChunkMetadata::from_task(update.task()) else {
            tracing::warn!(
                "chunk task {} has no parent metadata, dropping update",
                update.task().task_id
            );
            return;
        };
        if let Some(route) = self.chunk_routes.get(&meta.parent_task_id) {
            let _ = route.send(update);
        }
    }

    // ---- loops -----------------------------------------------------------

    async fn admission_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.admission_notify.notified() => {}
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                _ = self.shutdown.cancelled() => break,
            }
            let network = Arc::clone(&self.network);
            let admitted = self
                .queue
                .admit(|task| !task.requires_wifi || network.unmetered_available());
            for item in admitted {
                self.dispatch(item);
            }
        }
    }

    async fn recompute_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECOMPUTE_INTERVAL) => {}
                _ = self.shutdown.cancelled() => break,
            }
            let live: Vec<(String, String)> = self
                .live
                .iter()
                .map(|entry| {
                    let task = &entry.value().task;
                    (task.host(), task.group.clone())
                })
                .collect();
            self.queue.recompute_counters(&live);
            self.admission_notify.notify_one();
        }
    }

    async fn control_loop(self: Arc<Self>, mut control_rx: mpsc::UnboundedReceiver<Control>) {
        loop {
            tokio::select! {
                message = control_rx.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        Control::ChildEnqueue(task) => {
                            if let Err(e) = self.store.put(collections::TASKS, &task.task_id, &task) {
                                tracing::error!("cannot persist chunk child {}: {e}", task.task_id);
                            }
                            self.queue.add(EnqueueItem::new(task.clone()));
                            self.emit_status(&task, TaskStatus::Enqueued, None);
                            self.admission_notify.notify_one();
                        }
                        Control::ChildCancel(task_id) => {
                            self.cancel_one(&task_id).await;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn retry_loop(self: Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<Task>) {
        loop {
            tokio::select! {
                task = retry_rx.recv() => {
                    let Some(task) = task else { break };
                    let task_id = task.task_id.clone();
                    if self.retry.take_ready(&task_id).is_none() {
                        // canceled while the sleep was firing
                        continue;
                    }
                    // a retried request restarts from byte zero
                    if self.tracker.is_tracked(&task.group) {
                        self.tracker.record_progress(&task, 0.0, None);
                    }
                    self.re_enqueue(task, None);
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}

fn child_enqueue_channel(tx: &mpsc::UnboundedSender<Control>) -> mpsc::UnboundedSender<Task> {
    let (mapped_tx, mut mapped_rx) = mpsc::unbounded_channel::<Task>();
    let tx = tx.clone();
    tokio::spawn(async move {
        while let Some(task) = mapped_rx.recv().await {
            if tx.send(Control::ChildEnqueue(task)).is_err() {
                break;
            }
        }
    });
    mapped_tx
}

fn child_cancel_channel(tx: &mpsc::UnboundedSender<Control>) -> mpsc::UnboundedSender<String> {
    let (mapped_tx, mut mapped_rx) = mpsc::unbounded_channel::<String>();
    let tx = tx.clone();
    tokio::spawn(async move {
        while let Some(task_id) = mapped_rx.recv().await {
            if tx.send(Control::ChildCancel(task_id)).is_err() {
                break;
            }
        }
    });
    mapped_tx
}
