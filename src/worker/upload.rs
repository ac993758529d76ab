//! Upload Worker
//!
//! Uploads one or more files as a raw binary body or a multipart/form-data
//! body with a pre-computed Content-Length. Uploads cannot be paused; a
//! cancel request aborts the body stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::multipart::{self, FilePart, MultipartBody, Segment};
use super::progress::ProgressTracker;
use super::{Outcome, RunContext, WorkerResult, STREAM_BUFFER_SIZE};
use crate::error::{TaskError, TaskResult};
use crate::events::TaskProgressUpdate;
use crate::paths;
use crate::task::{Task, TaskKind};

/// `post` value selecting the raw-body upload mode.
const BINARY_MODE: &str = "binary";

/// Response bodies larger than this are truncated before capture.
const MAX_RESPONSE_CAPTURE: usize = 2 * 1024 * 1024;

pub async fn run(mut task: Task, ctx: &RunContext) -> WorkerResult {
    let outcome = match execute(&mut task, ctx).await {
        Ok(outcome) => outcome,
        Err(error) => Outcome::Failed(error),
    };
    WorkerResult { task, outcome }
}

async fn execute(task: &mut Task, ctx: &RunContext) -> TaskResult<Outcome> {
    let url = task.parsed_url()?;
    let method = reqwest::Method::from_bytes(task.http_method().as_bytes())
        .map_err(|e| TaskError::General(format!("bad HTTP method: {e}")))?;
    let mut request = ctx.client.request(method, url);
    // generated headers below must win over user-supplied ones
    for (key, value) in &task.headers {
        if key.eq_ignore_ascii_case("range") || key.eq_ignore_ascii_case("content-disposition") {
            continue;
        }
        request = request.header(key, value);
    }

    let binary = task.task_kind == TaskKind::Upload && task.post.as_deref() == Some(BINARY_MODE);
    let (request, content_length) = if binary {
        build_binary(task, ctx, request).await?
    } else {
        build_multipart(task, ctx, request).await?
    };

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            if ctx.cancel.is_cancelled() {
                return Ok(Outcome::Canceled);
            }
            return Err(TaskError::Connection(e.to_string()));
        }
    };
    if ctx.cancel.is_cancelled() {
        return Ok(Outcome::Canceled);
    }

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(Outcome::NotFound);
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

    tracing::info!(
        "task {} uploaded {} bytes, server answered {}",
        task.task_id,
        content_length,
        status
    );
    let mut body = response.text().await.unwrap_or_default();
    super::truncate_capture(&mut body, MAX_RESPONSE_CAPTURE);
    Ok(Outcome::Complete {
        response_body: Some(body),
        response_headers: None,
        response_status_code: Some(status.as_u16()),
        mime_type: None,
        charset: None,
    })
}

/// Raw-body mode: the file is the request body, fixed length.
async fn build_binary(
    task: &Task,
    ctx: &RunContext,
    request: reqwest::RequestBuilder,
) -> TaskResult<(reqwest::RequestBuilder, u64)> {
    let path = paths::task_file_path(task, &ctx.config.base_dirs)?;
    let length = file_length(&path).await?;
    let mime_type = if task.mime_type.is_empty() {
        mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    } else {
        task.mime_type.clone()
    };
    let segments = vec![Segment::File {
        path,
        length,
    }];
    let body = stream_body(task, ctx, segments, length);
    Ok((
        request
            .header(CONTENT_TYPE, mime_type)
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", task.filename),
            )
            .header(CONTENT_LENGTH, length)
            .body(body),
        length,
    ))
}

/// Multipart mode: scalar fields plus one file (Upload) or several
/// (MultiUpload, with JSON-encoded parallel arrays).
async fn build_multipart(
    task: &Task,
    ctx: &RunContext,
    request: reqwest::RequestBuilder,
) -> TaskResult<(reqwest::RequestBuilder, u64)> {
    let files = resolve_file_parts(task, ctx).await?;
    let body: MultipartBody = multipart::build(&task.fields, &files);
    let length = body.content_length;
    let stream = stream_body(task, ctx, body.segments, length);
    Ok((
        request
            .header(CONTENT_TYPE, multipart::content_type())
            .header(CONTENT_LENGTH, length)
            .body(stream),
        length,
    ))
}

async fn resolve_file_parts(task: &Task, ctx: &RunContext) -> TaskResult<Vec<FilePart>> {
    if task.task_kind == TaskKind::MultiUpload {
        let fields: Vec<String> = parse_json_list(&task.file_field, "fileField")?;
        let filenames: Vec<String> = parse_json_list(&task.filename, "filename")?;
        let mime_types: Vec<String> = parse_json_list(&task.mime_type, "mimeType")?;
        if fields.len() != filenames.len() || fields.len() != mime_types.len() {
            return Err(TaskError::General(
                "fileField, filename and mimeType lists must have equal length".into(),
            ));
        }
        let directory = paths::task_directory(task, &ctx.config.base_dirs)?;
        let mut parts = Vec::with_capacity(fields.len());
        for ((field, filename), mime_type) in
            fields.into_iter().zip(filenames).zip(mime_types)
        {
            let path = directory.join(&filename);
            let length = file_length(&path).await?;
            let mime_type = if mime_type.is_empty() {
                mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            } else {
                mime_type
            };
            parts.push(FilePart {
                field,
                filename,
                mime_type,
                path,
                length,
            });
        }
        Ok(parts)
    } else {
        let path = paths::task_file_path(task, &ctx.config.base_dirs)?;
        let length = file_length(&path).await?;
        let mime_type = if task.mime_type.is_empty() {
            mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            task.mime_type.clone()
        };
        Ok(vec![FilePart {
            field: task.file_field.clone(),
            filename: task.filename.clone(),
            mime_type,
            path,
            length,
        }])
    }
}

fn parse_json_list(value: &str, what: &str) -> TaskResult<Vec<String>> {
    serde_json::from_str(value)
        .map_err(|e| TaskError::General(format!("{what} must be a JSON list: {e}")))
}

async fn file_length(path: &PathBuf) -> TaskResult<u64> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| TaskError::FileSystem(format!("cannot read {path:?}: {e}")))?;
    if !meta.is_file() {
        return Err(TaskError::FileSystem(format!("{path:?} is not a file")));
    }
    Ok(meta.len())
}

/// Fixed-length body streamed through a producer task. The producer walks
/// the segments in order, reads files in 8 KiB slices, counts progress and
/// stops early when the task is canceled.
fn stream_body(
    task: &Task,
    ctx: &RunContext,
    segments: Vec<Segment>,
    total: u64,
) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, std::io::Error>>(8);
    let cancel = ctx.cancel.clone();
    let emit = Arc::clone(&ctx.emit_progress);
    let task_for_updates = task.clone();
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new(total, 0);
        for segment in segments {
            match segment {
                Segment::Bytes(bytes) => {
                    tracker.add_bytes(bytes.len() as u64);
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Segment::File { path, .. } => {
                    let mut file = match tokio::fs::File::open(&path).await {
                        Ok(file) => file,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    let mut buffer = vec![0u8; STREAM_BUFFER_SIZE];
                    loop {
                        if cancel.is_cancelled() {
                            return;
                        }
                        match file.read(&mut buffer).await {
                            Ok(0) => break,
                            Ok(n) => {
                                tracker.add_bytes(n as u64);
                                if tx.send(Ok(buffer[..n].to_vec())).await.is_err() {
                                    return;
                                }
                                if let Some(snapshot) = tracker.poll(Instant::now()) {
                                    let mut update = TaskProgressUpdate::new(
                                        task_for_updates.clone(),
                                        snapshot.progress,
                                    );
                                    update.expected_file_size = Some(total as i64);
                                    update.network_speed = Some(snapshot.network_speed_mbps);
                                    update.time_remaining_ms = Some(snapshot.time_remaining_ms);
                                    emit(update);
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    reqwest::Body::wrap_stream(stream)
}
