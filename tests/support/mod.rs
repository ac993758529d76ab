//! Shared utilities for engine integration tests: a throttleable fixture
//! server with byte-range support, engine builders on temp directories, and
//! update-stream helpers.

// not every test binary uses every helper
#![allow(dead_code)]

pub mod fixture_server;

use std::path::Path;
use std::time::Duration;

use ferry::{BaseDirs, Engine, EngineConfig, TaskStatus, TaskStatusUpdate, TaskUpdate};
use tokio::sync::broadcast::Receiver;

/// Engine configuration rooted in a temp directory.
pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        store_dir: root.join("store"),
        base_dirs: BaseDirs {
            documents: root.join("docs"),
            temporary: root.join("tmp"),
            support: root.join("support"),
            library: root.join("library"),
        },
        ..Default::default()
    }
}

/// Engine + subscribed update stream on a fresh temp store.
pub async fn started_engine(config: EngineConfig) -> (Engine, Receiver<TaskUpdate>) {
    let engine = Engine::new(config).expect("engine");
    let updates = engine.subscribe();
    engine.start().await.expect("start");
    (engine, updates)
}

/// Receive updates until `task_id` reaches `status`, or panic after 30 s.
/// Returns the matching update.
pub async fn wait_for_status(
    updates: &mut Receiver<TaskUpdate>,
    task_id: &str,
    status: TaskStatus,
) -> TaskStatusUpdate {
    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async {
        loop {
            match updates.recv().await.expect("update stream closed") {
                TaskUpdate::Status(update)
                    if update.task.task_id == task_id && update.status == status =>
                {
                    return update;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {task_id} to reach {status:?}"))
}

/// Keep asking for a pause until the worker has seen the server's resume
/// support and the request is accepted. Yields between attempts so the
/// worker can make progress; panics after 10 s.
pub async fn pause_when_possible(engine: &Engine, task_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !engine.pause(task_id) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("pause for {task_id} was never accepted"));
}

/// Receive updates until every listed task has reached `status`, in any
/// order. Panics after 30 s.
pub async fn wait_for_all_status(
    updates: &mut Receiver<TaskUpdate>,
    task_ids: &[&str],
    status: TaskStatus,
) {
    let mut missing: std::collections::HashSet<String> =
        task_ids.iter().map(|id| id.to_string()).collect();
    tokio::time::timeout(Duration::from_secs(30), async {
        while !missing.is_empty() {
            if let TaskUpdate::Status(update) = updates.recv().await.expect("update stream closed")
            {
                if update.status == status {
                    missing.remove(&update.task.task_id);
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {task_ids:?} to reach {status:?}"));
}

/// Collect the ordered status history for one task until a final status.
pub async fn status_history(
    updates: &mut Receiver<TaskUpdate>,
    task_id: &str,
) -> Vec<TaskStatus> {
    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async {
        let mut history = Vec::new();
        loop {
            if let TaskUpdate::Status(update) = updates.recv().await.expect("update stream closed")
            {
                if update.task.task_id == task_id {
                    history.push(update.status);
                    if update.status.is_final() {
                        return history;
                    }
                }
            }
        }
    })
    .await
    .expect("timed out collecting status history")
}

/// Deterministic pseudo-random body of `len` bytes.
pub fn pseudo_random_body(len: usize) -> Vec<u8> {
    let mut state = 0x2545f491_u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 24) as u8
        })
        .collect()
}
