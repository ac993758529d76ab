//! Resume Data
//!
//! Snapshot of a partially transferred task, captured on pause and replayed
//! on resume.

use serde::{Deserialize, Serialize};

/// Partial-transfer state for a paused task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResumeData {
    /// Task this snapshot belongs to
    pub task_id: String,

    /// Opaque handle to the partial artifact. For downloads this is the
    /// temp file path; for parallel downloads the serialized chunk list.
    pub data: String,

    /// Absolute byte offset the server response must start at
    pub required_start_byte: u64,

    /// Entity tag captured from the original response, when the server sent
    /// a strong validator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ResumeData {
    pub fn new(
        task_id: impl Into<String>,
        data: impl Into<String>,
        required_start_byte: u64,
        etag: Option<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            data: data.into(),
            required_start_byte,
            etag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let resume = ResumeData::new("t1", "/tmp/ferry-abc123", 4096, Some("\"v1\"".to_string()));
        let json = serde_json::to_string(&resume).unwrap();
        let back: ResumeData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resume);
    }

    #[test]
    fn test_etag_omitted_when_absent() {
        let resume = ResumeData::new("t1", "blob", 0, None);
        let json = serde_json::to_string(&resume).unwrap();
        assert!(!json.contains("etag"));
    }
}
