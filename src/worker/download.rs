//! Download Worker
//!
//! Streams one URL to a temp file and atomically moves it to the destination.
//! Handles ranged resume with ETag validation, server-suggested filenames,
//! the available-space guard, and pause/cancel signals.

use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_RANGE, ETAG, IF_RANGE, RANGE,
};
use reqwest::StatusCode;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use super::progress::ProgressTracker;
use super::{check_stop, Outcome, RunContext, StopCause, WorkerResult, STREAM_BUFFER_SIZE};
use crate::error::{TaskError, TaskResult};
use crate::events::TaskProgressUpdate;
use crate::paths;
use crate::task::{ResumeData, Task};

pub async fn run(mut task: Task, ctx: &RunContext) -> WorkerResult {
    let outcome = match execute(&mut task, ctx).await {
        Ok(outcome) => outcome,
        Err(error) => Outcome::Failed(error),
    };
    WorkerResult { task, outcome }
}

async fn execute(task: &mut Task, ctx: &RunContext) -> TaskResult<Outcome> {
    // partial artifact from a previous attempt, or a fresh temp file
    let (temp_path, start_offset, resume_etag, resuming) = match &ctx.resume_data {
        Some(resume) => {
            let path = PathBuf::from(&resume.data);
            let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if on_disk != resume.required_start_byte {
                return Err(TaskError::Resume(format!(
                    "partial file has {on_disk} bytes, expected {}",
                    resume.required_start_byte
                )));
            }
            (path, resume.required_start_byte, resume.etag.clone(), true)
        }
        None => (
            std::env::temp_dir().join(format!("ferry-{}", Uuid::new_v4())),
            0u64,
            None,
            false,
        ),
    };

    let url = task.parsed_url()?;
    let method = reqwest::Method::from_bytes(task.http_method().as_bytes())
        .map_err(|e| TaskError::General(format!("bad HTTP method: {e}")))?;
    let mut request = ctx.client.request(method, url);
    for (key, value) in &task.headers {
        request = request.header(key, value);
    }
    if resuming {
        request = request.header(RANGE, format!("bytes={start_offset}-"));
        if let Some(etag) = &resume_etag {
            request = request.header(IF_RANGE, etag.clone());
        }
    }
    if let Some(post) = &task.post {
        if task.http_method() == "POST" {
            request = request.body(post.clone());
        }
    }

    let response = tokio::select! {
        result = request.send() => result.map_err(TaskError::from)?,
        _ = ctx.cancel.cancelled() => return Ok(Outcome::Canceled),
    };
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(Outcome::NotFound);
    }
    // a 416 on resume means the partial file already holds every byte
    if resuming && status == StatusCode::RANGE_NOT_SATISFIABLE {
        tracing::info!("task {} already fully transferred", task.task_id);
        finalize_destination(task, &temp_path, ctx).await?;
        return Ok(Outcome::complete());
    }
    if !(200..=206).contains(&status.as_u16()) {
        return Err(TaskError::HttpResponse {
            code: status.as_u16(),
            description: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        });
    }

    // a resume must be answered with 206 starting exactly at our offset;
    // a 200 restarts from zero only when we hold no validator
    let mut effective_offset = start_offset;
    if resuming {
        if status == StatusCode::PARTIAL_CONTENT {
            let range_start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_start);
            if range_start != Some(start_offset) {
                return Err(TaskError::Resume(format!(
                    "server range starts at {range_start:?}, required {start_offset}"
                )));
            }
        } else if status == StatusCode::OK {
            if resume_etag.is_some() {
                return Err(TaskError::Resume(
                    "server ignored If-Range for a validated resume".into(),
                ));
            }
            tracing::warn!(
                "server ignored range for task {}, restarting from zero",
                task.task_id
            );
            effective_offset = 0;
        } else {
            return Err(TaskError::Resume(format!(
                "expected 206 for resume, got {status}"
            )));
        }
    }

    let accept_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false);
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.starts_with("W/"))
        .map(str::to_string);
    ctx.shared.can_resume.insert(
        task.task_id.clone(),
        accept_ranges || status == StatusCode::PARTIAL_CONTENT,
    );

    let content_length = response.content_length().unwrap_or(0);
    let expected_size = if content_length > 0 {
        effective_offset + content_length
    } else {
        0
    };

    if task.needs_suggested_filename() {
        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        task.filename = paths::suggested_filename(content_disposition.as_deref(), response.url());
        tracing::debug!("task {} filename resolved to {}", task.task_id, task.filename);
    }
    let destination = paths::task_file_path(task, &ctx.config.base_dirs)?;
    check_available_space(ctx, &task.task_id, content_length, &destination)?;
    if content_length > 0 {
        ctx.shared
            .remaining_bytes
            .insert(task.task_id.clone(), content_length);
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(effective_offset > 0)
        .truncate(effective_offset == 0)
        .open(&temp_path)
        .await?;
    let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);

    let mut tracker = ProgressTracker::new(expected_size, effective_offset);
    let mut stream = response.bytes_stream();
    let mut poll = tokio::time::interval(super::STOP_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        // stop signals are checked at every chunk boundary as well as on the
        // 100 ms tick, so a stalled stream still observes them promptly
        let stopped = tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    writer.write_all(&bytes).await?;
                    tracker.add_bytes(bytes.len() as u64);
                    if let Some(mut entry) = ctx.shared.remaining_bytes.get_mut(&task.task_id) {
                        *entry = entry.saturating_sub(bytes.len() as u64);
                    }
                    if let Some(snapshot) = tracker.poll(Instant::now()) {
                        emit_progress(task, expected_size, snapshot, ctx);
                    }
                    check_stop(ctx, task)
                }
                Some(Err(e)) => {
                    let _ = writer.flush().await;
                    remove_quietly(&temp_path).await;
                    return Err(TaskError::Connection(e.to_string()));
                }
                None => break,
            },
            _ = poll.tick() => check_stop(ctx, task),
        };
        if let Some(cause) = stopped {
            writer.flush().await?;
            match cause {
                StopCause::Canceled => {
                    remove_quietly(&temp_path).await;
                    return Ok(Outcome::Canceled);
                }
                StopCause::Paused => {
                    return Ok(Outcome::Paused(ResumeData::new(
                        task.task_id.clone(),
                        temp_path.to_string_lossy(),
                        tracker.transferred(),
                        etag,
                    )));
                }
                StopCause::TimedOut => {
                    remove_quietly(&temp_path).await;
                    return Err(TaskError::Connection("transfer timed out".into()));
                }
            }
        }
    }
    writer.flush().await?;

    if expected_size > 0 && tracker.transferred() < expected_size {
        remove_quietly(&temp_path).await;
        return Err(TaskError::Connection(format!(
            "connection closed after {} of {} bytes",
            tracker.transferred(),
            expected_size
        )));
    }

    finalize_destination(task, &temp_path, ctx).await?;
    tracing::info!(
        "task {} complete: {} bytes",
        task.task_id,
        tracker.transferred()
    );
    Ok(Outcome::complete())
}

/// Resolve the destination (applying the `unique` option), then move the
/// temp file into place.
async fn finalize_destination(
    task: &mut Task,
    temp_path: &Path,
    ctx: &RunContext,
) -> TaskResult<()> {
    let mut destination = paths::task_file_path(task, &ctx.config.base_dirs)?;
    if task.unique {
        destination = paths::unique_file_path(&destination);
        if let Some(name) = destination.file_name() {
            task.filename = name.to_string_lossy().to_string();
        }
    }
    move_into_place(temp_path, &destination).await
}

/// `Content-Range: bytes <start>-<end>/<total>` -> start
fn parse_content_range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Fail when free space minus what other live downloads still need would
/// drop below the configured floor after this download.
fn check_available_space(
    ctx: &RunContext,
    task_id: &str,
    content_length: u64,
    destination: &Path,
) -> TaskResult<()> {
    let Some(floor) = ctx.config.check_available_space_bytes() else {
        return Ok(());
    };
    if content_length == 0 {
        return Ok(());
    }
    let probe = destination
        .parent()
        .filter(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let available = fs2::available_space(&probe)
        .map_err(|e| TaskError::FileSystem(format!("cannot determine free space: {e}")))?;
    let reserved = ctx.shared.remaining_bytes_elsewhere(task_id);
    if available.saturating_sub(reserved) < content_length + floor {
        return Err(TaskError::FileSystem(format!(
            "insufficient disk space: {available} free, {reserved} reserved, {content_length} needed"
        )));
    }
    Ok(())
}

fn emit_progress(
    task: &Task,
    expected_size: u64,
    snapshot: super::progress::ProgressSnapshot,
    ctx: &RunContext,
) {
    let mut update = TaskProgressUpdate::new(task.clone(), snapshot.progress);
    update.expected_file_size = Some(expected_size as i64);
    update.network_speed = Some(snapshot.network_speed_mbps);
    update.time_remaining_ms = Some(snapshot.time_remaining_ms);
    (ctx.emit_progress)(update);
}

/// Atomic rename with a copy fallback for cross-device moves.
async fn move_into_place(temp_path: &Path, destination: &Path) -> TaskResult<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(temp_path, destination).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(temp_path, destination).await?;
            tokio::fs::remove_file(temp_path).await?;
            Ok(())
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("cannot remove temp file {path:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_start("bytes 500-999/1234"), Some(500));
        assert_eq!(parse_content_range_start("bytes 0-99/100"), Some(0));
        assert_eq!(parse_content_range_start("items 0-9/10"), None);
        assert_eq!(parse_content_range_start("bytes */1234"), None);
    }
}
