//! Destination Paths
//!
//! Resolves a task's `base_directory`/`directory`/`filename` triple into a
//! concrete filesystem path, and derives server-suggested filenames from
//! response headers.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use url::Url;

use crate::config::BaseDirs;
use crate::error::{TaskError, TaskResult};
use crate::task::{BaseDirectory, Task};

/// RFC 5987 extended parameter: filename*=charset'lang'percent-encoded
static FILENAME_STAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename\*\s*=\s*([^']*)'[^']*'([^;\r\n"]+)"#).expect("valid regex")
});

/// Plain filename="..." or filename=token
static FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]+)"|([^;\r\n"]+))"#).expect("valid regex"));

/// Resolve the directory a task reads from or writes to (without filename).
pub fn task_directory(task: &Task, dirs: &BaseDirs) -> TaskResult<PathBuf> {
    let base = match task.base_directory {
        BaseDirectory::ApplicationDocuments => dirs.documents.clone(),
        BaseDirectory::Temporary => dirs.temporary.clone(),
        BaseDirectory::ApplicationSupport => dirs.support.clone(),
        BaseDirectory::ApplicationLibrary => dirs.library.clone(),
        BaseDirectory::Root => {
            let path = PathBuf::from(&task.directory);
            if !path.is_absolute() {
                return Err(TaskError::FileSystem(format!(
                    "root base directory requires an absolute path, got {:?}",
                    task.directory
                )));
            }
            return Ok(path);
        }
    };
    if task.directory.is_empty() {
        return Ok(base);
    }
    let sub = Path::new(&task.directory);
    if sub.is_absolute() || sub.components().any(|c| c.as_os_str() == "..") {
        return Err(TaskError::FileSystem(format!(
            "directory {:?} must be a relative subpath",
            task.directory
        )));
    }
    Ok(base.join(sub))
}

/// Full destination (or source) path for a task with a concrete filename.
pub fn task_file_path(task: &Task, dirs: &BaseDirs) -> TaskResult<PathBuf> {
    if task.needs_suggested_filename() {
        return Err(TaskError::FileSystem(
            "filename not resolved before destination lookup".into(),
        ));
    }
    if task.filename.is_empty() || task.filename.contains('/') || task.filename.contains('\\') {
        return Err(TaskError::FileSystem(format!(
            "invalid filename {:?}",
            task.filename
        )));
    }
    Ok(task_directory(task, dirs)?.join(&task.filename))
}

/// Derive a filename from a Content-Disposition header value.
///
/// Prefers the RFC 5987 `filename*` form, falls back to plain `filename`.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    if let Some(caps) = FILENAME_STAR_RE.captures(value) {
        let charset = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let encoded = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if charset.eq_ignore_ascii_case("utf-8") || charset.is_empty() {
            if let Ok(decoded) = urlencoding::decode(encoded) {
                let name = sanitize_filename(decoded.trim());
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }
    if let Some(caps) = FILENAME_RE.captures(value) {
        let raw = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim())
            .unwrap_or("");
        let name = sanitize_filename(raw);
        if !name.is_empty() {
            return Some(name);
        }
    }
    None
}

/// Suggested filename per the resolution order: Content-Disposition header,
/// then the final URL's last path segment, then a random digit string.
pub fn suggested_filename(content_disposition: Option<&str>, final_url: &Url) -> String {
    if let Some(value) = content_disposition {
        if let Some(name) = filename_from_content_disposition(value) {
            return name;
        }
    }
    if let Some(segment) = final_url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
    {
        let name = sanitize_filename(segment);
        if !name.is_empty() {
            return name;
        }
    }
    random_digit_filename()
}

/// Random digit-string filename used when nothing better is available.
pub fn random_digit_filename() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| rng.gen_range(0..10).to_string()).collect()
}

/// Strip path separators and control characters from a derived name.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .to_string()
}

/// First free path obtained by appending " (n)" before the extension.
pub fn unique_file_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let mut n = 1;
    loop {
        let candidate = parent.join(format!("{stem} ({n}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
