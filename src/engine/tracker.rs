//! Tracked Groups
//!
//! Persists a `TaskRecord` per status/progress event for groups the client
//! marked as tracked, so task state can be queried across process restarts.

use std::collections::HashSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::BaseDirs;
use crate::error::{TaskException, TaskResult};
use crate::paths;
use crate::store::{collections, FileStore};
use crate::task::{Task, TaskStatus};

/// Persistent record of a task's last known state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskException>,
}

#[derive(Debug, Default)]
enum TrackMode {
    #[default]
    Nothing,
    /// Track every group
    All,
    /// Track the named groups only
    Groups(HashSet<String>),
}

/// Records status/progress events for tracked groups
pub struct Tracker {
    store: FileStore,
    base_dirs: BaseDirs,
    mode: RwLock<TrackMode>,
}

impl Tracker {
    pub fn new(store: FileStore, base_dirs: BaseDirs) -> Self {
        Self {
            store,
            base_dirs,
            mode: RwLock::new(TrackMode::Nothing),
        }
    }

    /// Mark `group` (or all groups, when `None`) as tracked. When
    /// `mark_downloaded_complete` is set, records that are not complete but
    /// whose destination file exists are promoted to complete; the promoted
    /// records are returned so the engine can notify listeners.
    pub fn track(
        &self,
        group: Option<&str>,
        mark_downloaded_complete: bool,
    ) -> TaskResult<Vec<TaskRecord>> {
        {
            let mut mode = self.mode.write().unwrap();
            match group {
                None => *mode = TrackMode::All,
                Some(group) => match &mut *mode {
                    TrackMode::Groups(groups) => {
                        groups.insert(group.to_string());
                    }
                    TrackMode::All => {}
                    TrackMode::Nothing => {
                        *mode = TrackMode::Groups(HashSet::from([group.to_string()]));
                    }
                },
            }
        }
        if !mark_downloaded_complete {
            return Ok(Vec::new());
        }
        let mut promoted = Vec::new();
        for mut record in self
            .store
            .all::<TaskRecord>(collections::TASK_RECORDS)?
        {
            let group_matches = group.map(|g| record.task.group == g).unwrap_or(true);
            if !group_matches || record.status == TaskStatus::Complete {
                continue;
            }
            let file_exists = paths::task_file_path(&record.task, &self.base_dirs)
                .map(|path| path.exists())
                .unwrap_or(false);
            if file_exists {
                record.status = TaskStatus::Complete;
                record.progress = 1.0;
                self.store
                    .put(collections::TASK_RECORDS, &record.task.task_id, &record)?;
                promoted.push(record);
            }
        }
        Ok(promoted)
    }

    pub fn is_tracked(&self, group: &str) -> bool {
        match &*self.mode.read().unwrap() {
            TrackMode::Nothing => false,
            TrackMode::All => true,
            TrackMode::Groups(groups) => groups.contains(group),
        }
    }

    /// Record a status event (keeps the previous progress value).
    pub fn record_status(
        &self,
        task: &Task,
        status: TaskStatus,
        exception: Option<&TaskException>,
    ) {
        let previous: Option<TaskRecord> = self
            .store
            .get(collections::TASK_RECORDS, &task.task_id)
            .ok()
            .flatten();
        let progress = status
            .progress_sentinel()
            .unwrap_or_else(|| previous.as_ref().map(|r| r.progress).unwrap_or(0.0));
        let record = TaskRecord {
            task: task.clone(),
            status,
            progress,
            expected_file_size: previous.and_then(|r| r.expected_file_size),
            exception: exception.cloned(),
        };
        if let Err(e) = self
            .store
            .put(collections::TASK_RECORDS, &task.task_id, &record)
        {
            tracing::warn!("cannot persist record for {}: {e}", task.task_id);
        }
    }

    /// Record a progress event (keeps the previous status value).
    pub fn record_progress(&self, task: &Task, progress: f64, expected_file_size: Option<i64>) {
        let previous: Option<TaskRecord> = self
            .store
            .get(collections::TASK_RECORDS, &task.task_id)
            .ok()
            .flatten();
        let record = TaskRecord {
            task: task.clone(),
            status: previous.map(|r| r.status).unwrap_or(TaskStatus::Running),
            progress,
            expected_file_size,
            exception: None,
        };
        if let Err(e) = self
            .store
            .put(collections::TASK_RECORDS, &task.task_id, &record)
        {
            tracing::warn!("cannot persist record for {}: {e}", task.task_id);
        }
    }

    pub fn record_for_id(&self, task_id: &str) -> Option<TaskRecord> {
        self.store
            .get(collections::TASK_RECORDS, task_id)
            .ok()
            .flatten()
    }

    pub fn records_in_group(&self, group: Option<&str>) -> TaskResult<Vec<TaskRecord>> {
        let records = self.store.all::<TaskRecord>(collections::TASK_RECORDS)?;
        Ok(records
            .into_iter()
            .filter(|record| group.map(|g| record.task.group == g).unwrap_or(true))
            .collect())
    }

    pub fn remove_records(&self, group: Option<&str>) -> TaskResult<usize> {
        let mut removed = 0;
        for record in self.records_in_group(group)? {
            if self
                .store
                .remove(collections::TASK_RECORDS, &record.task.task_id)?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
