//! Parallel chunked download scenarios: range math against a fixed-size
//! fixture, stitched output identical to a single-stream download, and
//! failure when the server cannot serve ranges.

mod support;

use std::collections::HashSet;

use ferry::{Task, TaskStatus};
use support::fixture_server::{FixtureOptions, FixtureServer};
use support::{
    pseudo_random_body, started_engine, status_history, test_config, wait_for_all_status,
    wait_for_status,
};

#[tokio::test]
async fn four_chunks_cover_exact_ranges_and_stitch() {
    let body = pseudo_random_body(4096);
    let server = FixtureServer::spawn(FixtureOptions {
        body: body.clone(),
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (engine, mut updates) = started_engine(test_config(root.path())).await;

    let mut task = Task::parallel_download("par-1", server.url("/blob.bin"));
    task.filename = "blob.bin".to_string();
    task.chunks = 4;
    assert!(engine.enqueue(task, None));

    wait_for_status(&mut updates, "par-1", TaskStatus::Complete).await;

    let ranges: HashSet<String> = server
        .requests()
        .await
        .into_iter()
        .filter_map(|r| r.range)
        .collect();
    let expected: HashSet<String> = [
        "bytes=0-1023",
        "bytes=1024-2047",
        "bytes=2048-3071",
        "bytes=3072-4095",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    assert_eq!(ranges, expected);

    let stitched = std::fs::read(root.path().join("docs/blob.bin")).unwrap();
    assert_eq!(stitched.len(), 4096);
    assert_eq!(stitched, body);
}

#[tokio::test]
async fn stitched_file_matches_single_stream_download() {
    let body = pseudo_random_body(100_000);
    let server = FixtureServer::spawn(FixtureOptions {
        body: body.clone(),
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (engine, mut updates) = started_engine(test_config(root.path())).await;

    let mut single = Task::download("single", server.url("/payload.bin"));
    single.filename = "single.bin".to_string();
    let mut parallel = Task::parallel_download("parallel", server.url("/payload.bin"));
    parallel.filename = "parallel.bin".to_string();
    parallel.chunks = 3;
    assert!(engine.enqueue(single, None));
    assert!(engine.enqueue(parallel, None));

    wait_for_all_status(&mut updates, &["single", "parallel"], TaskStatus::Complete).await;

    let single_bytes = std::fs::read(root.path().join("docs/single.bin")).unwrap();
    let parallel_bytes = std::fs::read(root.path().join("docs/parallel.bin")).unwrap();
    assert_eq!(single_bytes, body);
    assert_eq!(parallel_bytes, single_bytes);
}

#[tokio::test]
async fn server_without_ranges_fails_parallel_download() {
    let server = FixtureServer::spawn(FixtureOptions {
        body: pseudo_random_body(4096),
        accept_ranges: false,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (engine, mut updates) = started_engine(test_config(root.path())).await;

    let mut task = Task::parallel_download("par-bad", server.url("/blob.bin"));
    task.filename = "blob.bin".to_string();
    task.chunks = 4;
    assert!(engine.enqueue(task, None));

    let update = wait_for_status(&mut updates, "par-bad", TaskStatus::Failed).await;
    let exception = update.exception.expect("exception");
    assert_eq!(exception.kind, ferry::ExceptionKind::General);
    assert!(!root.path().join("docs/blob.bin").exists());
}

#[tokio::test]
async fn chunk_children_stay_invisible_to_queries() {
    let body = pseudo_random_body(64 * 1024);
    let server = FixtureServer::spawn(FixtureOptions {
        body,
        ..Default::default()
    })
    .await;
    let root = tempfile::tempdir().unwrap();
    let (engine, mut updates) = started_engine(test_config(root.path())).await;

    let mut task = Task::parallel_download("par-vis", server.url("/blob.bin"));
    task.filename = "vis.bin".to_string();
    task.chunks = 4;
    assert!(engine.enqueue(task, None));
    wait_for_status(&mut updates, "par-vis", TaskStatus::Running).await;

    // only the parent shows up while children transfer
    let ids = engine.all_task_ids(None, true);
    assert_eq!(ids, vec!["par-vis"]);

    let history = status_history(&mut updates, "par-vis").await;
    assert_eq!(history.last(), Some(&TaskStatus::Complete));
}
