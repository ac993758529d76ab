//! Transfer Task
//!
//! The immutable task descriptor submitted to the engine, plus the
//! discriminated task kinds and their serialization.

pub mod codec;
pub mod resume;
pub mod status;

use std::collections::HashMap;

use chrono::Utc;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{TaskError, TaskResult};

pub use resume::ResumeData;
pub use status::TaskStatus;

/// Filename sentinel meaning "derive the name from the server response".
pub const SUGGESTED_FILENAME: &str = "?";

/// Default priority (0 is highest, 9 lowest).
pub const DEFAULT_PRIORITY: u8 = 5;

/// Discriminator for the five task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Download,
    Upload,
    MultiUpload,
    Data,
    ParallelDownload,
}

impl TaskKind {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Download => 0,
            Self::Upload => 1,
            Self::MultiUpload => 2,
            Self::Data => 3,
            Self::ParallelDownload => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Download),
            1 => Some(Self::Upload),
            2 => Some(Self::MultiUpload),
            3 => Some(Self::Data),
            4 => Some(Self::ParallelDownload),
            _ => None,
        }
    }

    /// Default HTTP method when the task does not set one.
    pub fn default_http_method(&self) -> &'static str {
        match self {
            Self::Download | Self::ParallelDownload => "GET",
            Self::Upload | Self::MultiUpload => "POST",
            Self::Data => "POST",
        }
    }
}

impl Serialize for TaskKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for TaskKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ordinal = u8::deserialize(deserializer)?;
        Self::from_ordinal(ordinal)
            .ok_or_else(|| de::Error::custom(format!("invalid task kind ordinal {ordinal}")))
    }
}

/// Which updates the client wants for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Updates {
    None,
    StatusChange,
    Progress,
    StatusChangeAndProgress,
}

impl Updates {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::StatusChange => 1,
            Self::Progress => 2,
            Self::StatusChangeAndProgress => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::None),
            1 => Some(Self::StatusChange),
            2 => Some(Self::Progress),
            3 => Some(Self::StatusChangeAndProgress),
            _ => None,
        }
    }

    pub fn wants_status(&self) -> bool {
        matches!(self, Self::StatusChange | Self::StatusChangeAndProgress)
    }

    pub fn wants_progress(&self) -> bool {
        matches!(self, Self::Progress | Self::StatusChangeAndProgress)
    }
}

impl Serialize for Updates {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for Updates {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ordinal = u8::deserialize(deserializer)?;
        Self::from_ordinal(ordinal)
            .ok_or_else(|| de::Error::custom(format!("invalid updates ordinal {ordinal}")))
    }
}

/// Base location a task's directory/filename are resolved against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseDirectory {
    /// Application documents directory
    ApplicationDocuments,
    /// System temporary directory
    Temporary,
    /// Application support directory
    ApplicationSupport,
    /// Application library directory
    ApplicationLibrary,
    /// `directory` is an absolute path
    Root,
}

impl BaseDirectory {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::ApplicationDocuments => 0,
            Self::Temporary => 1,
            Self::ApplicationSupport => 2,
            Self::ApplicationLibrary => 3,
            Self::Root => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::ApplicationDocuments),
            1 => Some(Self::Temporary),
            2 => Some(Self::ApplicationSupport),
            3 => Some(Self::ApplicationLibrary),
            4 => Some(Self::Root),
            _ => None,
        }
    }
}

impl Serialize for BaseDirectory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for BaseDirectory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ordinal = u8::deserialize(deserializer)?;
        Self::from_ordinal(ordinal)
            .ok_or_else(|| de::Error::custom(format!("invalid base directory ordinal {ordinal}")))
    }
}

/// Transfer task descriptor
///
/// Tasks are treated as immutable once enqueued; the engine re-persists a
/// fresh copy when policy fields (e.g. `retries_remaining`) change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Task {
    /// Client-supplied unique id
    pub task_id: String,

    /// Request URL
    pub url: String,

    /// Extra query parameters merged into `url` at request time
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub url_query_parameters: HashMap<String, String>,

    /// Source URLs for multi-source parallel downloads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Target filename, or [`SUGGESTED_FILENAME`]
    pub filename: String,

    /// Append " (n)" before the extension until the destination is free
    #[serde(default)]
    pub unique: bool,

    /// Request headers, sent verbatim
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Explicit HTTP method override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,

    /// Request body: text, JSON string, or the literal "binary" marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,

    /// Form field name for single-file uploads
    #[serde(default)]
    pub file_field: String,

    /// MIME type for single-file uploads (inferred from extension when empty)
    #[serde(default)]
    pub mime_type: String,

    /// Scalar multipart form fields
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,

    /// Subdirectory below the base directory (absolute path for `Root`)
    #[serde(default)]
    pub directory: String,

    /// Base location for the destination or source file
    #[serde(default = "default_base_directory")]
    pub base_directory: BaseDirectory,

    /// Group tag for queries, callbacks and admission caps
    #[serde(default = "default_group")]
    pub group: String,

    /// Which updates the client wants
    #[serde(default = "default_updates")]
    pub updates: Updates,

    /// Only transfer over unmetered connections
    #[serde(default)]
    pub requires_wifi: bool,

    /// Automatic retries on retryable failures
    #[serde(default)]
    pub retries: u32,

    /// Retries still available
    #[serde(default)]
    pub retries_remaining: u32,

    /// Whether the task may be paused
    #[serde(default)]
    pub allow_pause: bool,

    /// 0 (highest) ..= 9 (lowest), default 5
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Opaque client metadata
    #[serde(default)]
    pub metadata: String,

    /// Optional human-readable name
    #[serde(default)]
    pub display_name: String,

    /// Creation time, milliseconds since epoch
    pub creation_time: i64,

    /// Number of chunks per URL for parallel downloads
    #[serde(default = "default_chunks")]
    pub chunks: u32,

    /// Task kind discriminator
    pub task_kind: TaskKind,
}

fn default_base_directory() -> BaseDirectory {
    BaseDirectory::ApplicationDocuments
}

fn default_group() -> String {
    "default".to_string()
}

fn default_updates() -> Updates {
    Updates::StatusChange
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_chunks() -> u32 {
    1
}

impl Task {
    /// Create a task of `kind` with defaults for everything but id and url.
    pub fn new(kind: TaskKind, task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            url: url.into(),
            url_query_parameters: HashMap::new(),
            urls: Vec::new(),
            filename: String::new(),
            unique: false,
            headers: HashMap::new(),
            http_method: None,
            post: None,
            file_field: "file".to_string(),
            mime_type: String::new(),
            fields: HashMap::new(),
            directory: String::new(),
            base_directory: BaseDirectory::ApplicationDocuments,
            group: default_group(),
            updates: Updates::StatusChange,
            requires_wifi: false,
            retries: 0,
            retries_remaining: 0,
            allow_pause: false,
            priority: DEFAULT_PRIORITY,
            metadata: String::new(),
            display_name: String::new(),
            creation_time: Utc::now().timestamp_millis(),
            chunks: 1,
            task_kind: kind,
        }
    }

    pub fn download(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(TaskKind::Download, task_id, url)
    }

    pub fn upload(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(TaskKind::Upload, task_id, url)
    }

    pub fn data(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(TaskKind::Data, task_id, url)
    }

    pub fn parallel_download(task_id: impl Into<String>, url: impl Into<String>) -> Self {
        let mut task = Self::new(TaskKind::ParallelDownload, task_id, url);
        task.allow_pause = true;
        task
    }

    /// Effective HTTP method for this task.
    pub fn http_method(&self) -> &str {
        match &self.http_method {
            Some(method) if !method.is_empty() => method,
            _ => {
                if self.task_kind == TaskKind::Download && self.post.is_some() {
                    "POST"
                } else {
                    self.task_kind.default_http_method()
                }
            }
        }
    }

    /// Request URL with `url_query_parameters` merged in.
    pub fn parsed_url(&self) -> TaskResult<Url> {
        let mut url =
            Url::parse(&self.url).map_err(|e| TaskError::Url(format!("{}: {e}", self.url)))?;
        if !self.url_query_parameters.is_empty() {
            let mut pairs: Vec<(String, String)> = self
                .url_query_parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            pairs.sort();
            for (key, value) in pairs {
                url.query_pairs_mut().append_pair(&key, &value);
            }
        }
        Ok(url)
    }

    /// Host component of the URL; empty string when the URL does not parse.
    pub fn host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn provides_status_updates(&self) -> bool {
        self.updates.wants_status()
    }

    pub fn provides_progress_updates(&self) -> bool {
        self.updates.wants_progress()
    }

    /// Whether the task's destination filename must still be derived.
    pub fn needs_suggested_filename(&self) -> bool {
        self.filename == SUGGESTED_FILENAME
    }

    /// Validate invariants that enqueue enforces.
    pub fn validate(&self) -> TaskResult<()> {
        if self.task_id.is_empty() {
            return Err(TaskError::General("taskId must not be empty".into()));
        }
        if self.priority > 9 {
            return Err(TaskError::General(format!(
                "priority {} out of range 0..=9",
                self.priority
            )));
        }
        if self.retries_remaining > self.retries {
            return Err(TaskError::General(
                "retriesRemaining exceeds retries".into(),
            ));
        }
        if self.task_kind == TaskKind::ParallelDownload && self.chunks == 0 {
            return Err(TaskError::General("chunks must be >= 1".into()));
        }
        self.parsed_url()?;
        Ok(())
    }
}
