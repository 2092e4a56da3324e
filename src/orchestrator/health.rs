//! Engine health: state, liveness, and progress counters
//!
//! Taking a snapshot only reads atomics and locks; it never triggers work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

pub const HEALTH_FILE: &str = "health.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Initializing,
    BackfillAndWatching,
    ShuttingDown,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Initializing => "initializing",
            EngineState::BackfillAndWatching => "backfill_and_watching",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub run_id: Uuid,
    pub pid: u32,
    pub state: EngineState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub watcher_alive: bool,
    /// Milliseconds since a worker last finished an event without error;
    /// `None` before the first one
    pub last_event_age_ms: Option<u64>,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub written_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// A snapshot older than three write intervals means the engine stopped reporting
    pub fn is_stale(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        chrono::Duration::from_std(interval * 3)
            .map(|max_age| now.signed_duration_since(self.written_at) > max_age)
            .unwrap_or(false)
    }

    pub fn is_healthy(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        self.state == EngineState::BackfillAndWatching
            && self.watcher_alive
            && !self.is_stale(now, interval)
    }
}

pub struct HealthMonitor {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    state: watch::Receiver<EngineState>,
    watcher_alive: Mutex<Option<Arc<AtomicBool>>>,
    last_event: Mutex<Option<Instant>>,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl HealthMonitor {
    pub fn new(state: watch::Receiver<EngineState>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            state,
            watcher_alive: Mutex::new(None),
            last_event: Mutex::new(None),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn attach_watcher(&self, alive: Arc<AtomicBool>) {
        *self.watcher_alive.lock().unwrap_or_else(|p| p.into_inner()) = Some(alive);
    }

    /// Stamp the last successfully handled event
    pub fn mark_processed(&self) {
        *self.last_event.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let watcher_alive = self
            .watcher_alive
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false);
        let last_event_age_ms = self
            .last_event
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map(|at| at.elapsed().as_millis() as u64);

        HealthSnapshot {
            run_id: self.run_id,
            pid: std::process::id(),
            state: *self.state.borrow(),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            watcher_alive,
            last_event_age_ms,
            files_processed: self.processed.load(Ordering::Relaxed),
            files_skipped: self.skipped.load(Ordering::Relaxed),
            files_failed: self.failed.load(Ordering::Relaxed),
            written_at: Utc::now(),
        }
    }
}

pub fn health_path(state_dir: &Path) -> PathBuf {
    state_dir.join(HEALTH_FILE)
}

/// Write the snapshot atomically (temp file + rename)
pub async fn write_snapshot(state_dir: &Path, snapshot: &HealthSnapshot) -> Result<()> {
    tokio::fs::create_dir_all(state_dir)
        .await
        .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;

    let target = health_path(state_dir);
    let tmp = target.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &target)
        .await
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    Ok(())
}

pub fn read_snapshot(state_dir: &Path) -> Result<HealthSnapshot> {
    let path = health_path(state_dir);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("No health snapshot at {}", path.display()))?;
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Corrupt health snapshot at {}", path.display()))?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_reflects_counters_without_side_effects() {
        let (state_tx, state_rx) = watch::channel(EngineState::Initializing);
        let monitor = HealthMonitor::new(state_rx);

        let first = monitor.snapshot();
        assert_eq!(first.state, EngineState::Initializing);
        assert!(!first.watcher_alive);
        assert_eq!(first.last_event_age_ms, None);

        let alive = Arc::new(AtomicBool::new(true));
        monitor.attach_watcher(Arc::clone(&alive));
        monitor.mark_processed();
        monitor.record_processed();
        monitor.record_failed();
        state_tx.send(EngineState::BackfillAndWatching).unwrap();

        let second = monitor.snapshot();
        let third = monitor.snapshot();
        assert!(second.watcher_alive);
        assert_eq!(second.state, EngineState::BackfillAndWatching);
        assert_eq!(second.files_processed, 1);
        assert_eq!(second.files_failed, 1);
        assert_eq!(third.files_processed, 1);
        assert!(second.last_event_age_ms.is_some());
        assert_eq!(second.run_id, first.run_id);

        alive.store(false, Ordering::SeqCst);
        assert!(!monitor.snapshot().watcher_alive);
    }

    #[test]
    fn test_staleness() {
        let (_tx, rx) = watch::channel(EngineState::BackfillAndWatching);
        let mut snapshot = HealthMonitor::new(rx).snapshot();
        snapshot.watcher_alive = true;
        let interval = Duration::from_secs(10);

        assert!(snapshot.is_healthy(snapshot.written_at, interval));
        let later = snapshot.written_at + chrono::Duration::seconds(31);
        assert!(snapshot.is_stale(later, interval));
        assert!(!snapshot.is_healthy(later, interval));
    }

    #[tokio::test]
    async fn test_write_then_read_snapshot() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = watch::channel(EngineState::Stopped);
        let snapshot = HealthMonitor::new(rx).snapshot();

        write_snapshot(dir.path(), &snapshot).await.unwrap();
        let read = read_snapshot(dir.path()).unwrap();
        assert_eq!(read.run_id, snapshot.run_id);
        assert_eq!(read.state, EngineState::Stopped);
        assert!(!dir.path().join("health.json.tmp").exists());
    }
}
