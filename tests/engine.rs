use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tracemirror::config::Config;
use tracemirror::orchestrator::read_snapshot;
use tracemirror::store::MirrorStore;
use tracemirror::{EngineState, Orchestrator};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.database.path = dir.join("mirror.db").display().to_string();
    config.watch.root = dir.join("logs").display().to_string();
    config.watch.quiescence_ms = 100;
    config.engine.state_dir = dir.join("state").display().to_string();
    config.engine.health_interval_secs = 1;
    config.engine.workers = 2;
    config
}

fn log_line(id: &str, ts: &str) -> String {
    format!(
        "{{\"type\":\"user\",\"uuid\":\"{}\",\"timestamp\":\"{}\",\"message\":{{\"content\":\"hi\"}}}}\n",
        id, ts
    )
}

/// Poll the store until `session` has `count` messages or the deadline passes
async fn wait_for_messages(db: &Path, session: &str, count: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if db.exists() {
            if let Ok(store) = MirrorStore::open_read_only(db) {
                if store.get_messages(session).map(|m| m.len()).unwrap_or(0) >= count {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Spawn `run` with a oneshot-driven shutdown
fn spawn_engine(
    orchestrator: &Arc<Orchestrator>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let engine = Arc::clone(orchestrator);
    let handle = tokio::spawn(async move {
        engine
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });
    (stop_tx, handle)
}

async fn wait_for_state(orchestrator: &Orchestrator, target: EngineState) {
    let mut states = orchestrator.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *states.borrow_and_update() != target {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("engine did not reach the expected state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_and_new_files_reach_the_store() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("logs/proj");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("old.jsonl"), log_line("o1", "2024-01-01T09:00:00Z")).unwrap();

    let config = config(dir.path());
    let db = config.database_path();
    let orchestrator = Arc::new(Orchestrator::new(config));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let engine = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move {
        engine
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });

    assert!(wait_for_messages(&db, "proj/old", 1).await, "existing file not synced");
    assert_eq!(orchestrator.state(), EngineState::BackfillAndWatching);

    let live = project.join("live.jsonl");
    fs::write(&live, log_line("l1", "2024-01-01T10:00:00Z")).unwrap();
    assert!(wait_for_messages(&db, "proj/live", 1).await, "new file not synced");

    let mut content = log_line("l1", "2024-01-01T10:00:00Z");
    content.push_str(&log_line("l2", "2024-01-01T10:00:01Z"));
    fs::write(&live, content).unwrap();
    assert!(wait_for_messages(&db, "proj/live", 2).await, "appended line not synced");

    let health = orchestrator.health();
    assert!(health.watcher_alive);
    assert!(health.files_processed >= 3);
    assert_eq!(health.files_failed, 0);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(orchestrator.state(), EngineState::Stopped);
    let snapshot = read_snapshot(&dir.path().join("state")).unwrap();
    assert_eq!(snapshot.state, EngineState::Stopped);
    assert!(!snapshot.watcher_alive);

    let store = MirrorStore::open_read_only(&db).unwrap();
    assert_eq!(store.stats().unwrap().messages, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_root_stops_with_error() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("logs");
    fs::create_dir_all(root.join("proj")).unwrap();

    let orchestrator = Arc::new(Orchestrator::new(config(dir.path())));
    let engine = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move { engine.run(std::future::pending()).await });

    let mut states = orchestrator.subscribe();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *states.borrow_and_update() != EngineState::BackfillAndWatching {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();

    fs::remove_dir_all(&root).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("engine did not stop after losing its root")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(orchestrator.state(), EngineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_during_large_backfill_completes() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("logs/proj");
    fs::create_dir_all(&project).unwrap();
    for i in 0..2000 {
        fs::write(
            project.join(format!("s{i:04}.jsonl")),
            log_line(&format!("m{i}"), "2024-01-01T09:00:00Z"),
        )
        .unwrap();
    }

    let mut config = config(dir.path());
    config.watch.channel_capacity = 1;
    config.engine.workers = 1;
    config.engine.shutdown_timeout_secs = 1;

    let orchestrator = Orchestrator::new(config);
    let shutdown = tokio::time::sleep(Duration::from_millis(1500));
    let result = tokio::time::timeout(Duration::from_secs(15), orchestrator.run(shutdown))
        .await
        .expect("shutdown hung while the backfill was still queued");

    assert!(result.is_ok());
    assert_eq!(orchestrator.state(), EngineState::Stopped);
    assert!(!orchestrator.health().watcher_alive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_abandons_work_stuck_on_a_locked_store() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("logs/proj");
    fs::create_dir_all(&project).unwrap();

    let mut config = config(dir.path());
    config.database.busy_timeout_ms = 20_000;
    config.database.retry.max_attempts = 1;
    config.engine.shutdown_timeout_secs = 1;
    let db = config.database_path();

    let orchestrator = Arc::new(Orchestrator::new(config));
    let (stop_tx, handle) = spawn_engine(&orchestrator);
    wait_for_state(&orchestrator, EngineState::BackfillAndWatching).await;

    // Another writer holds the lock, so the sync below waits in SQLite
    let blocker = Connection::open(&db).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    fs::write(project.join("stuck.jsonl"), log_line("x1", "2024-01-01T09:00:00Z")).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let requested = Instant::now();
    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(8), handle)
        .await
        .expect("shutdown waited on the blocked write")
        .unwrap();

    assert!(result.is_ok());
    assert!(requested.elapsed() < Duration::from_secs(8));
    assert_eq!(orchestrator.state(), EngineState::Stopped);

    blocker.execute_batch("ROLLBACK").unwrap();
    drop(blocker);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rapid_rewrites_of_one_file_end_at_latest_content() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("logs/proj");
    fs::create_dir_all(&project).unwrap();

    let mut config = config(dir.path());
    config.engine.workers = 4;
    let db = config.database_path();

    let orchestrator = Arc::new(Orchestrator::new(config));
    let (stop_tx, handle) = spawn_engine(&orchestrator);
    wait_for_state(&orchestrator, EngineState::BackfillAndWatching).await;

    // Each version outlives the quiescence window, so each one is dispatched
    let path = project.join("busy.jsonl");
    let mut content = String::new();
    for i in 0..6 {
        content.push_str(&log_line(&format!("v{i}"), &format!("2024-01-01T10:00:0{i}Z")));
        fs::write(&path, &content).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    assert!(wait_for_messages(&db, "proj/busy", 6).await, "final version not synced");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let store = MirrorStore::open_read_only(&db).unwrap();
    let ledger = store.sync_file(&path).unwrap().unwrap();
    assert_eq!(ledger.content_hash, hex::encode(Sha256::digest(content.as_bytes())));
    assert_eq!(ledger.record_count, 6);
    let ids: Vec<String> = store
        .get_messages("proj/busy")
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["v0", "v1", "v2", "v3", "v4", "v5"]);
    assert_eq!(orchestrator.health().files_failed, 0);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_file_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("logs/proj");
    fs::create_dir_all(&project).unwrap();

    // A single worker puts both files on the same queue
    let mut config = config(dir.path());
    config.engine.workers = 1;
    let db = config.database_path();

    let orchestrator = Arc::new(Orchestrator::new(config));
    let (stop_tx, handle) = spawn_engine(&orchestrator);
    wait_for_state(&orchestrator, EngineState::BackfillAndWatching).await;

    let broken = project.join("broken.jsonl");
    fs::write(
        &broken,
        "{\"type\":\"user\",\"uuid\":\"u1\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"tool_use_id\":\"ghost\",\"content\":\"?\"}]}}\n",
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let good = project.join("good.jsonl");
    fs::write(&good, log_line("g1", "2024-01-01T10:00:00Z")).unwrap();
    assert!(wait_for_messages(&db, "proj/good", 1).await, "good file not synced");

    // The broken file fails again on every change; the good one keeps flowing
    fs::write(&broken, "{\"type\":\"user\",\"uuid\":\"u2\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"tool_use_id\":\"ghost\"}]}}\n").unwrap();
    let mut content = log_line("g1", "2024-01-01T10:00:00Z");
    content.push_str(&log_line("g2", "2024-01-01T10:00:01Z"));
    fs::write(&good, content).unwrap();
    assert!(wait_for_messages(&db, "proj/good", 2).await, "update after failure not synced");

    let health = orchestrator.health();
    assert!(health.files_failed >= 1);
    assert!(health.watcher_alive);
    assert_eq!(orchestrator.state(), EngineState::BackfillAndWatching);

    let store = MirrorStore::open_read_only(&db).unwrap();
    assert!(store.sync_file(&broken).unwrap().is_none());
    assert!(store.get_session("proj/broken").unwrap().is_none());

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
