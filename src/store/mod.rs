//! Persistent Store
//!
//! Embedded file-backed key-value store: one directory per collection, one
//! JSON file per record. Record files are accessed under OS advisory locks
//! (shared for reads, exclusive for writes) so concurrent engine instances
//! do not tear records.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TaskError, TaskResult};

/// Collection names used by the engine.
pub mod collections {
    /// Live or in-flight tasks, removed on final state
    pub const TASKS: &str = "tasks";
    /// Status/progress records for tracked groups
    pub const TASK_RECORDS: &str = "task_records";
    /// Resume data for paused tasks
    pub const RESUME_DATA: &str = "resume_data";
    /// Status updates that could not be delivered
    pub const STATUS_UPDATES: &str = "status_updates";
    /// Progress updates that could not be delivered
    pub const PROGRESS_UPDATES: &str = "progress_updates";
}

/// File-backed record store
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> TaskResult<Self> {
        let root = root.into();
        for collection in [
            collections::TASKS,
            collections::TASK_RECORDS,
            collections::RESUME_DATA,
            collections::STATUS_UPDATES,
            collections::PROGRESS_UPDATES,
        ] {
            fs::create_dir_all(root.join(collection))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Insert or replace a record.
    pub fn put<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> TaskResult<()> {
        let path = self.record_path(collection, id)?;
        let json = serde_json::to_vec(value)
            .map_err(|e| TaskError::General(format!("cannot encode record {id}: {e}")))?;
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        let result = write_locked(&mut file, &json);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Fetch a record, `None` when absent.
    pub fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> TaskResult<Option<T>> {
        let path = self.record_path(collection, id)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        let _ = fs2::FileExt::unlock(&file);
        read?;
        let value = serde_json::from_str(&contents)
            .map_err(|e| TaskError::General(format!("corrupt record {collection}/{id}: {e}")))?;
        Ok(Some(value))
    }

    /// Delete a record; true when one existed.
    pub fn remove(&self, collection: &str, id: &str) -> TaskResult<bool> {
        let path = self.record_path(collection, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All record ids in a collection (sanitized filesystem form).
    pub fn ids(&self, collection: &str) -> TaskResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(collection))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// All records in a collection. Unreadable records are skipped with a
    /// warning rather than failing the scan.
    pub fn all<T: DeserializeOwned>(&self, collection: &str) -> TaskResult<Vec<T>> {
        let mut records = Vec::new();
        for id in self.ids(collection)? {
            match self.get(collection, &id) {
                Ok(Some(value)) => records.push(value),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping unreadable record {collection}/{id}: {e}"),
            }
        }
        Ok(records)
    }

    /// Remove every record in a collection; returns the number removed.
    pub fn clear(&self, collection: &str) -> TaskResult<usize> {
        let mut removed = 0;
        for id in self.ids(collection)? {
            if self.remove(collection, &id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn record_path(&self, collection: &str, id: &str) -> TaskResult<PathBuf> {
        if id.is_empty() {
            return Err(TaskError::General("record id must not be empty".into()));
        }
        Ok(self
            .root
            .join(collection)
            .join(format!("{}.json", sanitize_id(id))))
    }
}

fn write_locked(file: &mut File, json: &[u8]) -> TaskResult<()> {
    file.set_len(0)?;
    file.write_all(json)?;
    file.flush()?;
    Ok(())
}

/// Filesystem form of a record id: illegal filename characters become `_`.
/// The in-memory id is never altered.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
