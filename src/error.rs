//! Ferry Domain Errors
//!
//! Typed error definitions for the transfer engine. Worker failures are
//! classified into a small taxonomy that decides retry eligibility and is
//! surfaced to listeners as a [`TaskException`].

use serde::{Deserialize, Serialize};

/// HTTP response codes eligible for automatic retry.
pub const RETRYABLE_HTTP_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionKind {
    /// Fallback for unclassified runtime errors
    General,
    /// Cannot create/write/move/delete a destination or temp file
    FileSystem,
    /// URL is malformed or cannot be decoded
    Url,
    /// Socket error, DNS failure, TLS failure, timeout
    Connection,
    /// Server did not honor Range/If-Range for a resume
    Resume,
    /// Non-2xx response outside the not-found case
    HttpResponse,
}

impl ExceptionKind {
    /// Wire name used in status update payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::FileSystem => "file-system",
            Self::Url => "url",
            Self::Connection => "connection",
            Self::Resume => "resume",
            Self::HttpResponse => "http-response",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "general" => Some(Self::General),
            "file-system" => Some(Self::FileSystem),
            "url" => Some(Self::Url),
            "connection" => Some(Self::Connection),
            "resume" => Some(Self::Resume),
            "http-response" => Some(Self::HttpResponse),
            _ => None,
        }
    }
}

/// Error type for a failed transfer attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    General(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("invalid URL: {0}")]
    Url(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("resume failed: {0}")]
    Resume(String),

    #[error("HTTP {code}: {description}")]
    HttpResponse { code: u16, description: String },
}

impl TaskError {
    pub fn kind(&self) -> ExceptionKind {
        match self {
            Self::General(_) => ExceptionKind::General,
            Self::FileSystem(_) => ExceptionKind::FileSystem,
            Self::Url(_) => ExceptionKind::Url,
            Self::Connection(_) => ExceptionKind::Connection,
            Self::Resume(_) => ExceptionKind::Resume,
            Self::HttpResponse { .. } => ExceptionKind::HttpResponse,
        }
    }

    /// Response code, for http-response errors.
    pub fn http_response_code(&self) -> Option<u16> {
        match self {
            Self::HttpResponse { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this failure may be retried automatically (given retries remain).
    ///
    /// Connection errors are always retryable; HTTP errors only for a known
    /// transient subset. File system, URL and resume errors never retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::HttpResponse { code, .. } => RETRYABLE_HTTP_CODES.contains(code),
            _ => false,
        }
    }

    /// Exception record surfaced to listeners.
    pub fn to_exception(&self) -> TaskException {
        TaskException {
            kind: self.kind(),
            http_response_code: self.http_response_code(),
            description: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            TaskError::Url(err.to_string())
        } else {
            // connect/timeout/body/decode all count as connection-level
            TaskError::Connection(err.to_string())
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::FileSystem(err.to_string())
    }
}

/// Exception details attached to a failed status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskException {
    pub kind: ExceptionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_response_code: Option<u16>,
    pub description: String,
}

/// Result type alias for engine operations.
pub type TaskResult<T> = Result<T, TaskError>;
