//! Parallel Chunked Download
//!
//! Splits one resource into N ranged child download tasks, re-enqueues
//! failing children with back-off, aggregates their status and progress for
//! the parent, and stitches the chunk files into the destination when all
//! children complete.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::progress::ProgressCadence;
use super::{check_stop, Outcome, RunContext, StopCause, WorkerResult};
use crate::error::{TaskError, TaskResult};
use crate::events::{TaskProgressUpdate, TaskUpdate};
use crate::task::{BaseDirectory, ResumeData, Task, TaskKind, TaskStatus, Updates};
use crate::paths;

/// Reserved group routing child updates to the coordinator.
pub const CHUNK_GROUP: &str = "chunk";

/// A byte-range sub-task of a parallel download
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub parent_task_id: String,
    pub url: String,
    pub from_byte: u64,
    pub to_byte: u64,
    /// Synthesized ranged download task
    pub task: Task,
    pub status: TaskStatus,
    pub progress: f64,
}

/// Metadata carried on every chunk child, linking it back to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub parent_task_id: String,
    pub from: u64,
    pub to: u64,
}

impl ChunkMetadata {
    pub fn from_task(task: &Task) -> Option<Self> {
        serde_json::from_str(&task.metadata).ok()
    }
}

/// Parent pause snapshot: the chunk list plus the probed length.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParallelResumePayload {
    chunks: Vec<Chunk>,
    content_length: u64,
}

/// Channels wiring a coordinator to the engine
pub struct ParallelContext {
    pub base: RunContext,
    /// Submit a child task for enqueue
    pub child_enqueue: mpsc::UnboundedSender<Task>,
    /// Request cancellation of a child by id
    pub child_cancel: mpsc::UnboundedSender<String>,
    /// Status/progress updates of this parent's children
    pub child_updates: mpsc::UnboundedReceiver<TaskUpdate>,
}

/// Byte ranges for `n` chunks over `content_length` bytes.
///
/// `chunk_size = ceil(content_length / n)`; chunk `i` covers
/// `[i*chunk_size, min((i+1)*chunk_size - 1, content_length - 1)]`.
pub fn chunk_ranges(content_length: u64, n: u64) -> Vec<(u64, u64)> {
    if content_length == 0 || n == 0 {
        return Vec::new();
    }
    let chunk_size = content_length.div_ceil(n);
    (0..n)
        .map(|i| {
            (
                i * chunk_size,
                ((i + 1) * chunk_size - 1).min(content_length - 1),
            )
        })
        .filter(|(from, to)| from <= to)
        .collect()
}

pub async fn run(mut task: Task, ctx: ParallelContext) -> WorkerResult {
    let ParallelContext {
        base,
        child_enqueue,
        child_cancel,
        mut child_updates,
    } = ctx;
    let outcome = match execute(
        &mut task,
        &base,
        &child_enqueue,
        &child_cancel,
        &mut child_updates,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(error) => Outcome::Failed(error),
    };
    base.shared.can_resume.remove(&task.task_id);
    WorkerResult { task, outcome }
}

async fn execute(
    task: &mut Task,
    base: &RunContext,
    child_enqueue: &mpsc::UnboundedSender<Task>,
    child_cancel: &mpsc::UnboundedSender<String>,
    child_updates: &mut mpsc::UnboundedReceiver<TaskUpdate>,
) -> TaskResult<Outcome> {
    let (mut chunks, content_length) = match &base.resume_data {
        Some(resume) => {
            let payload: ParallelResumePayload = serde_json::from_str(&resume.data)
                .map_err(|e| TaskError::Resume(format!("bad chunk snapshot: {e}")))?;
            (payload.chunks, payload.content_length)
        }
        None => {
            let content_length = probe(task, base).await?;
            let chunks = build_chunks(task, content_length);
            (chunks, content_length)
        }
    };
    if chunks.is_empty() {
        return Err(TaskError::General("no chunks to download".into()));
    }

    // the parent itself is always pauseable once the probe succeeded
    if task.allow_pause {
        base.shared.can_resume.insert(task.task_id.clone(), true);
    }

    // (re-)enqueue every child that is not already complete
    for chunk in chunks.iter_mut() {
        if chunk.status != TaskStatus::Complete {
            chunk.status = TaskStatus::Enqueued;
            chunk.progress = 0.0;
            child_enqueue
                .send(chunk.task.clone())
                .map_err(|_| TaskError::General("engine shut down".into()))?;
        }
    }

    let mut cadence = ProgressCadence::new();
    let mut poll = tokio::time::interval(super::STOP_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            update = child_updates.recv() => {
                let Some(update) = update else {
                    return Err(TaskError::General("engine shut down".into()));
                };
                match update {
                    TaskUpdate::Status(status_update) => {
                        let child_id = status_update.task.task_id.clone();
                        let Some(index) = chunks.iter().position(|c| c.task.task_id == child_id) else {
                            continue;
                        };
                        chunks[index].status = status_update.status;
                        match status_update.status {
                            TaskStatus::Complete => {
                                chunks[index].progress = 1.0;
                                if chunks.iter().all(|c| c.status == TaskStatus::Complete) {
                                    return stitch(task, &chunks, content_length, base).await;
                                }
                            }
                            TaskStatus::NotFound => {
                                cancel_children(&chunks, child_cancel);
                                return Ok(Outcome::NotFound);
                            }
                            TaskStatus::Failed => {
                                let chunk = &mut chunks[index];
                                if chunk.task.retries_remaining > 0 {
                                    chunk.task.retries_remaining -= 1;
                                    let exponent = chunk
                                        .task
                                        .retries
                                        .saturating_sub(chunk.task.retries_remaining)
                                        .saturating_sub(1)
                                        .min(10);
                                    let delay = Duration::from_secs(2u64.pow(exponent));
                                    tracing::debug!(
                                        "chunk {child_id} retrying in {delay:?} ({} left)",
                                        chunk.task.retries_remaining
                                    );
                                    chunk.status = TaskStatus::Enqueued;
                                    let enqueue = child_enqueue.clone();
                                    let child = chunk.task.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = enqueue.send(child);
                                    });
                                } else {
                                    cancel_children(&chunks, child_cancel);
                                    let description = status_update
                                        .exception
                                        .map(|e| e.description)
                                        .unwrap_or_else(|| "chunk download failed".to_string());
                                    return Err(TaskError::General(description));
                                }
                            }
                            _ => {}
                        }
                    }
                    TaskUpdate::Progress(progress_update) => {
                        let child_id = &progress_update.task.task_id;
                        if let Some(chunk) = chunks.iter_mut().find(|c| &c.task.task_id == child_id) {
                            if progress_update.progress >= 0.0 {
                                chunk.progress = progress_update.progress;
                            }
                        }
                        let mean: f64 =
                            chunks.iter().map(|c| c.progress).sum::<f64>() / chunks.len() as f64;
                        if cadence.should_emit(mean, Instant::now()) {
                            let mut update = TaskProgressUpdate::new(task.clone(), mean.min(0.999));
                            update.expected_file_size = Some(content_length as i64);
                            (base.emit_progress)(update);
                        }
                    }
                }
            }
            _ = poll.tick() => {
                if let Some(cause) = check_stop(base, task) {
                    cancel_children(&chunks, child_cancel);
                    match cause {
                        StopCause::Canceled => return Ok(Outcome::Canceled),
                        StopCause::Paused => {
                            let payload = ParallelResumePayload {
                                chunks: chunks.clone(),
                                content_length,
                            };
                            let data = serde_json::to_string(&payload)
                                .map_err(|e| TaskError::General(e.to_string()))?;
                            return Ok(Outcome::Paused(ResumeData::new(
                                task.task_id.clone(),
                                data,
                                0,
                                None,
                            )));
                        }
                        StopCause::TimedOut => {
                            return Err(TaskError::Connection("transfer timed out".into()));
                        }
                    }
                }
            }
        }
    }
}

/// HEAD probe: the server must expose a content length and byte ranges.
async fn probe(task: &mut Task, ctx: &RunContext) -> TaskResult<u64> {
    let url = task.parsed_url()?;
    let mut request = ctx.client.head(url);
    for (key, value) in &task.headers {
        request = request.header(key, value);
    }
    let response = request.send().await.map_err(TaskError::from)?;
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(TaskError::HttpResponse {
            code: 404,
            description: "resource not found".into(),
        });
    }
    if !status.is_success() {
        return Err(TaskError::HttpResponse {
            code: status.as_u16(),
            description: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        });
    }
    let accept_ranges = response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false);
    let content_length: Option<u64> = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .filter(|&len| len > 0);
    let (Some(content_length), true) = (content_length, accept_ranges) else {
        return Err(TaskError::General(
            "server does not provide content length or does not accept ranges".into(),
        ));
    };
    if task.needs_suggested_filename() {
        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        task.filename = paths::suggested_filename(content_disposition.as_deref(), response.url());
    }
    Ok(content_length)
}

/// Synthesize the ranged children: `len(urls) * chunks` of them, sources
/// assigned round-robin.
fn build_chunks(task: &Task, content_length: u64) -> Vec<Chunk> {
    let sources: Vec<String> = if task.urls.is_empty() {
        vec![task.url.clone()]
    } else {
        task.urls.clone()
    };
    let n = sources.len() as u64 * task.chunks.max(1) as u64;
    chunk_ranges(content_length, n)
        .into_iter()
        .enumerate()
        .map(|(i, (from, to))| {
            let url = sources[i % sources.len()].clone();
            let child_id = format!("chunk-{}", Uuid::new_v4());
            let mut child = Task::new(TaskKind::Download, child_id, url.clone());
            child.filename = format!("ferry-chunk-{}", Uuid::new_v4());
            child.base_directory = BaseDirectory::Root;
            child.directory = std::env::temp_dir().to_string_lossy().to_string();
            child.group = CHUNK_GROUP.to_string();
            child.headers = task.headers.clone();
            child
                .headers
                .insert("Range".to_string(), format!("bytes={from}-{to}"));
            child.metadata = serde_json::to_string(&ChunkMetadata {
                parent_task_id: task.task_id.clone(),
                from,
                to,
            })
            .unwrap_or_default();
            child.retries = task.retries;
            child.retries_remaining = task.retries;
            child.requires_wifi = task.requires_wifi;
            child.allow_pause = false;
            child.priority = task.priority;
            // the parent always needs child statuses, progress only if asked
            child.updates = if task.provides_progress_updates() {
                Updates::StatusChangeAndProgress
            } else {
                Updates::StatusChange
            };
            child.creation_time = task.creation_time;
            Chunk {
                parent_task_id: task.task_id.clone(),
                url,
                from_byte: from,
                to_byte: to,
                task: child,
                status: TaskStatus::Enqueued,
                progress: 0.0,
            }
        })
        .collect()
}

fn cancel_children(chunks: &[Chunk], child_cancel: &mpsc::UnboundedSender<String>) {
    for chunk in chunks {
        if !chunk.status.is_final() {
            let _ = child_cancel.send(chunk.task.task_id.clone());
        }
    }
}

/// Concatenate the chunk files in range order into the destination.
async fn stitch(
    task: &Task,
    chunks: &[Chunk],
    content_length: u64,
    ctx: &RunContext,
) -> TaskResult<Outcome> {
    let destination = paths::task_file_path(task, &ctx.config.base_dirs)?;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.from_byte);

    let file = tokio::fs::File::create(&destination).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(super::STREAM_BUFFER_SIZE, file);
    let mut written = 0u64;
    for chunk in &ordered {
        let chunk_path = chunk_file_path(chunk);
        let mut reader = tokio::fs::File::open(&chunk_path).await.map_err(|e| {
            TaskError::FileSystem(format!("missing chunk file {chunk_path:?}: {e}"))
        })?;
        written += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    if written != content_length {
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(TaskError::FileSystem(format!(
            "stitched {written} bytes, expected {content_length}"
        )));
    }
    for chunk in &ordered {
        let _ = tokio::fs::remove_file(chunk_file_path(chunk)).await;
    }
    tracing::info!(
        "task {} stitched {} chunks into {:?}",
        task.task_id,
        ordered.len(),
        destination
    );
    Ok(Outcome::complete())
}

fn chunk_file_path(chunk: &Chunk) -> PathBuf {
    PathBuf::from(&chunk.task.directory).join(&chunk.task.filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_even_split() {
        let ranges = chunk_ranges(4096, 4);
        assert_eq!(
            ranges,
            vec![(0, 1023), (1024, 2047), (2048, 3071), (3072, 4095)]
        );
    }

    #[test]
    fn test_chunk_ranges_uneven() {
        let ranges = chunk_ranges(10, 3);
        // ceil(10/3) = 4
        assert_eq!(ranges, vec![(0, 3), (4, 7), (8, 9)]);
    }

    #[test]
    fn test_chunk_ranges_more_chunks_than_bytes() {
        let ranges = chunk_ranges(2, 4);
        // chunk_size 1; trailing empty ranges dropped
        assert_eq!(ranges, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_build_chunks_inherits_policy() {
        let mut task = Task::parallel_download("p1", "https://example.com/big.bin");
        task.retries = 2;
        task.priority = 1;
        task.requires_wifi = true;
        task.chunks = 2;
        task.updates = Updates::StatusChangeAndProgress;
        let chunks = build_chunks(&task, 1000);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.task.group, CHUNK_GROUP);
            assert_eq!(chunk.task.retries, 2);
            assert_eq!(chunk.task.priority, 1);
            assert!(chunk.task.requires_wifi);
            assert_eq!(chunk.task.updates, Updates::StatusChangeAndProgress);
            let range = chunk.task.headers.get("Range").unwrap();
            assert_eq!(range, &format!("bytes={}-{}", chunk.from_byte, chunk.to_byte));
            let meta = ChunkMetadata::from_task(&chunk.task).unwrap();
            assert_eq!(meta.parent_task_id, "p1");
            assert_eq!(meta.from, chunk.from_byte);
        }
    }

    #[test]
    fn test_build_chunks_multi_url_round_robin() {
        let mut task = Task::parallel_download("p1", "https://a.example.com/f");
        task.urls = vec![
            "https://a.example.com/f".to_string(),
            "https://b.example.com/f".to_string(),
        ];
        task.chunks = 2;
        let chunks = build_chunks(&task, 4000);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].url, "https://a.example.com/f");
        assert_eq!(chunks[1].url, "https://b.example.com/f");
        assert_eq!(chunks[2].url, "https://a.example.com/f");
    }

    #[test]
    fn test_resume_payload_round_trip() {
        let task = Task::parallel_download("p1", "https://example.com/f");
        let chunks = build_chunks(&task, 100);
        let payload = ParallelResumePayload {
            chunks,
            content_length: 100,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: ParallelResumePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content_length, 100);
        assert_eq!(back.chunks.len(), 1);
        assert_eq!(back.chunks[0].parent_task_id, "p1");
    }
}
