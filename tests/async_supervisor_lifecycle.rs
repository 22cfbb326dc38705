// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Async supervisor lifecycle against a shell-script stand-in server.

#![cfg(unix)]

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use llama_warden::{AsyncLlamaServer, ServerOptions, ServerState, WardenError};
use tempfile::TempDir;

use common::{
    archive_options, kill_hard, local_options, process_exists, stand_in_server, FakeDownloader,
    FakeIndex, MarkerProbe, READY_THEN_SLEEP,
};

fn setup(body: &str) -> (TempDir, PathBuf, ServerOptions) {
    let tmp = TempDir::new().unwrap();
    let bin = tmp.path().join("bin");
    stand_in_server(&bin, body);
    let options = local_options(&bin, &tmp.path().join("releases"));
    (tmp, bin.join("ready"), options)
}

fn server(options: ServerOptions, marker: PathBuf) -> AsyncLlamaServer {
    AsyncLlamaServer::with_probe(options, Arc::new(MarkerProbe::new(marker))).unwrap()
}

#[tokio::test]
async fn test_start_then_stop() {
    let (_tmp, marker, options) = setup(READY_THEN_SLEEP);
    let server = server(options.ctx_size(1024).arg("--metrics"), marker.clone());

    server.start().await.unwrap();
    assert!(server.is_ready());
    assert_eq!(server.openai_base_url().unwrap(), "http://127.0.0.1:18181/v1");
    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "18181 1024 --metrics");

    let pid = server.pid().unwrap();
    assert!(process_exists(pid));

    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let (_tmp, marker, options) = setup(READY_THEN_SLEEP);
    let server = server(options, marker);

    server.start().await.unwrap();
    let pid = server.pid();
    assert!(matches!(
        server.start().await,
        Err(WardenError::AlreadyRunning { state: ServerState::Ready })
    ));
    assert_eq!(server.pid(), pid);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_hung_server_times_out() {
    let (_tmp, marker, options) = setup("exec sleep 30");
    let server = server(options.start_timeout(Duration::from_secs(2)), marker);

    let started = Instant::now();
    assert!(matches!(
        server.start().await,
        Err(WardenError::ServerStartTimeout { .. })
    ));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(server.state(), ServerState::Failed);
    assert_eq!(server.pid(), None);
}

#[tokio::test]
async fn test_crash_during_startup_is_reported() {
    let (_tmp, marker, options) = setup("exit 3");
    let server = server(options, marker);

    match server.start().await.unwrap_err() {
        WardenError::ServerCrashed { status, .. } => assert!(status.contains('3'), "{status}"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.state(), ServerState::Failed);
}

#[tokio::test]
async fn test_exit_after_ready_is_noticed() {
    let (_tmp, marker, options) = setup(READY_THEN_SLEEP);
    let server = server(options, marker.clone());

    server.start().await.unwrap();
    let pid = server.pid().unwrap();
    kill_hard(pid);

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.state() == ServerState::Ready && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(server.state(), ServerState::Failed);
    assert!(!server.is_ready());
    assert!(matches!(server.server_url(), Err(WardenError::ServerNotReady { .. })));
    assert_eq!(server.pid(), None);
    assert!(server.last_exit_status().is_some());
    assert!(matches!(
        server.start().await,
        Err(WardenError::AlreadyRunning { state: ServerState::Failed })
    ));

    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    fs::remove_file(&marker).unwrap();
    server.start().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_from_archive_url() {
    let tmp = TempDir::new().unwrap();
    let url = "https://example.com/builds/llama-b1-bin-ubuntu-x64.tar.gz";
    let index = Arc::new(FakeIndex::new("unused"));
    let (options, downloader, marker) = archive_options(
        url,
        READY_THEN_SLEEP,
        &tmp.path().join("releases"),
        &index,
        FakeDownloader::default(),
    );
    let server = server(options, marker.clone());

    server.start().await.unwrap();
    assert!(server.is_ready());
    assert!(marker.is_file());
    server.stop().await.unwrap();

    assert_eq!(downloader.count(), 1);
    assert_eq!(index.calls(), 0);
}

#[tokio::test]
async fn test_stop_during_start_cancels_it() {
    let (_tmp, marker, options) = setup("exec sleep 30");
    let server = server(options.start_timeout(Duration::from_secs(20)), marker);

    let (started, stopped) = tokio::join!(server.start(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let pid = server.pid();
        server.stop().await.map(|_| pid)
    });

    assert!(matches!(started, Err(WardenError::StartCancelled)));
    let pid = stopped.unwrap().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_term_ignoring_server_is_killed_after_grace() {
    let (_tmp, marker, options) = setup(&format!("trap '' TERM\n{READY_THEN_SLEEP}"));
    let server = server(options.stop_grace(Duration::from_millis(300)), marker);

    server.start().await.unwrap();
    let pid = server.pid().unwrap();

    let stopping = Instant::now();
    server.stop().await.unwrap();
    assert!(stopping.elapsed() >= Duration::from_millis(300));
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_scoped_stops_afterwards() {
    let (_tmp, marker, options) = setup(READY_THEN_SLEEP);
    let server = server(options, marker);

    let pid = server
        .scoped(|s| async move {
            assert!(s.is_ready());
            s.pid().unwrap()
        })
        .await
        .unwrap();

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_scoped_start_failure_cleans_up() {
    let (_tmp, marker, options) = setup("exit 1");
    let server = server(options, marker);

    let out = server.scoped(|_| async { unreachable!("body must not run") }).await;
    assert!(matches!(out, Err(WardenError::ServerCrashed { .. })));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_drop_kills_child() {
    let (_tmp, marker, options) = setup(READY_THEN_SLEEP);
    let server = server(options, marker);
    server.start().await.unwrap();
    let pid = server.pid().unwrap();

    drop(server);
    // start_kill() is asynchronous; give the signal a moment to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while process_exists(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!process_exists(pid) || is_zombie(pid));
}

/// A killed child that tokio has not reaped yet still answers `kill -0`.
fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| stat.split_whitespace().nth(2) == Some("Z"))
        .unwrap_or(false)
}
