//! Engine lifecycle: startup, dispatch, health, shutdown
//!
//! ```text
//! Initializing -> BackfillAndWatching -> ShuttingDown -> Stopped
//! ```
//!
//! Watch events are routed to a fixed set of workers by a hash of the file
//! path. Each worker handles its queue in order, so events for one file are
//! applied in the order they were observed while different files proceed in
//! parallel.

mod health;
mod pipeline;

pub use health::{
    health_path, read_snapshot, write_snapshot, EngineState, HealthMonitor, HealthSnapshot,
};
pub use pipeline::{FileReport, SyncPipeline};

use anyhow::{anyhow, bail, Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::store::StoreExecutor;
use crate::watcher::{scan_tree, FileEvent, LogWatcher, WatchEvent, WatchFilter};

pub struct Orchestrator {
    config: Config,
    state: watch::Sender<EngineState>,
    health: Arc<HealthMonitor>,
}

/// Running components, owned by [`Orchestrator::run`]
struct Engine {
    executor: Arc<StoreExecutor>,
    watcher: LogWatcher,
    pool: WorkerPool,
    events: mpsc::Receiver<WatchEvent>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let (state, state_rx) = watch::channel(EngineState::Initializing);
        Self {
            config,
            state,
            health: Arc::new(HealthMonitor::new(state_rx)),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Current health; reads counters only
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Run until `shutdown` resolves or the watch root is lost.
    ///
    /// Returns an error when startup fails after all retries or the root
    /// disappears; a requested shutdown returns `Ok`.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        self.publish_health().await;
        let engine = match self.start().await {
            Ok(engine) => engine,
            Err(e) => {
                self.transition(EngineState::Stopped);
                self.publish_health().await;
                return Err(e);
            }
        };
        let Engine {
            executor,
            watcher,
            pool,
            mut events,
        } = engine;

        self.health.attach_watcher(watcher.liveness());
        self.transition(EngineState::BackfillAndWatching);
        self.publish_health().await;

        let mut ticker = tokio::time::interval(self.config.engine.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tokio::pin!(shutdown);
        let outcome: Result<()> = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(WatchEvent::File(event)) => {
                        // A full shard queue must not hold off shutdown
                        tokio::select! {
                            sent = pool.dispatch(event) => {
                                if !sent {
                                    break Err(anyhow!("worker pool closed unexpectedly"));
                                }
                            }
                            _ = &mut shutdown => {
                                info!("Shutdown requested");
                                break Ok(());
                            }
                        }
                    }
                    Some(WatchEvent::RootLost(root)) => {
                        error!(root = %root.display(), stage = "watch", "Watch root lost; shutting down");
                        break Err(SyncError::WatchLost { root }.into());
                    }
                    None => break Err(anyhow!("watcher stopped unexpectedly")),
                },
                _ = ticker.tick() => self.publish_health().await,
            }
        };

        self.transition(EngineState::ShuttingDown);
        self.publish_health().await;

        // Closing the receiver first releases a watcher blocked on a full channel
        drop(events);
        let timeout = self.config.engine.shutdown_timeout();
        if tokio::time::timeout(timeout, watcher.stop()).await.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "Watcher did not stop in time");
        }

        if !pool.drain(timeout).await {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Workers did not finish in time; abandoning queued and in-flight work"
            );
        }

        let pending = Arc::strong_count(&executor) - 1;
        if pending > 0 {
            warn!(pending, "Store still referenced by abandoned work");
        }
        drop(executor);

        self.transition(EngineState::Stopped);
        self.publish_health().await;
        info!(
            uptime_secs = started.elapsed().as_secs(),
            clean = outcome.is_ok(),
            "Engine stopped"
        );
        outcome
    }

    async fn start(&self) -> Result<Engine> {
        let attempts = self.config.engine.startup_retries + 1;
        let delay = Duration::from_millis(self.config.engine.startup_retry_delay_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_start() {
                Ok(engine) => return Ok(engine),
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, stage = e.stage(), "Engine startup failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Engine failed to start after {} attempt(s)", attempt)
                    });
                }
            }
        }
    }

    fn try_start(&self) -> SyncResult<Engine> {
        let db_path = self.config.database_path();
        let root = self.config.watch_root();

        let executor = Arc::new(StoreExecutor::open(&db_path, &self.config.database)?);
        info!(path = %db_path.display(), "Store ready");

        let pipeline = SyncPipeline::new(&root, Arc::clone(&executor));
        let pool = WorkerPool::spawn(
            self.config.engine.workers,
            self.config.watch.channel_capacity,
            pipeline,
            Arc::clone(&self.health),
        );

        let (events_tx, events) = mpsc::channel(self.config.watch.channel_capacity);
        let watcher = LogWatcher::start(&root, &self.config.watch, events_tx)?;

        Ok(Engine {
            executor,
            watcher,
            pool,
            events,
        })
    }

    fn transition(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = previous.as_str(), to = next.as_str(), "Engine state changed");
        }
    }

    async fn publish_health(&self) {
        let snapshot = self.health.snapshot();
        let state_dir = self.config.state_dir();
        match write_snapshot(&state_dir, &snapshot).await {
            Ok(()) => debug!(
                state = snapshot.state.as_str(),
                watcher_alive = snapshot.watcher_alive,
                files_processed = snapshot.files_processed,
                files_failed = snapshot.files_failed,
                "Health snapshot written"
            ),
            Err(e) => warn!(dir = %state_dir.display(), error = %e, "Failed to write health snapshot"),
        }
    }
}

// ============================================
// WORKERS
// ============================================

struct WorkerPool {
    shards: Vec<mpsc::Sender<FileEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(size: usize, capacity: usize, pipeline: SyncPipeline, health: Arc<HealthMonitor>) -> Self {
        let size = size.max(1);
        let mut shards = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for shard in 0..size {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            shards.push(tx);
            handles.push(tokio::spawn(worker_loop(
                shard,
                rx,
                pipeline.clone(),
                Arc::clone(&health),
            )));
        }

        Self { shards, handles }
    }

    /// Queue an event on its file's shard; `false` if that worker is gone
    async fn dispatch(&self, event: FileEvent) -> bool {
        let shard = shard_for(&event.path, self.shards.len());
        self.shards[shard].send(event).await.is_ok()
    }

    /// Close the queues and wait for workers to finish what they hold.
    ///
    /// On timeout the workers are aborted: queued events are dropped and a
    /// file already inside `spawn_blocking` finishes its transaction on its own.
    async fn drain(self, timeout: Duration) -> bool {
        let WorkerPool { shards, mut handles } = self;
        drop(shards);

        let join_all = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker ended abnormally");
                }
            }
        };
        let finished = tokio::time::timeout(timeout, join_all).await.is_ok();
        if !finished {
            for handle in &handles {
                handle.abort();
            }
        }
        finished
    }
}

fn shard_for(path: &Path, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn worker_loop(
    shard: usize,
    mut queue: mpsc::Receiver<FileEvent>,
    pipeline: SyncPipeline,
    health: Arc<HealthMonitor>,
) {
    while let Some(event) = queue.recv().await {
        let started = Instant::now();
        let path = event.path.clone();
        let job = pipeline.clone();

        // A panic stays inside the blocking task and surfaces as a JoinError
        let result = tokio::task::spawn_blocking(move || job.handle(&event)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(FileReport::Synced {
                records,
                line_errors,
                outcome,
            })) => {
                health.record_processed();
                health.mark_processed();
                info!(
                    path = %path.display(),
                    shard,
                    records,
                    line_errors,
                    messages = outcome.messages,
                    invocations = outcome.invocations,
                    results = outcome.results,
                    attempts = outcome.attempts,
                    elapsed_ms,
                    "Synced file"
                );
            }
            Ok(Ok(FileReport::Unchanged)) => {
                health.record_skipped();
                health.mark_processed();
                debug!(path = %path.display(), shard, elapsed_ms, "Skipped unchanged file");
            }
            Ok(Ok(FileReport::Removed)) => health.mark_processed(),
            Ok(Err(e)) => {
                health.record_failed();
                error!(
                    path = %path.display(),
                    shard,
                    stage = e.stage(),
                    error = %e,
                    elapsed_ms,
                    "Failed to sync file"
                );
            }
            Err(e) => {
                health.record_failed();
                error!(path = %path.display(), shard, error = %e, "Sync task aborted");
            }
        }
    }
    debug!(shard, "Worker queue closed");
}

// ============================================
// ONE-SHOT BACKFILL
// ============================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub files: usize,
    pub synced: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub messages: usize,
    pub line_errors: usize,
}

/// Sync every file currently under the root once, without watching
pub fn backfill(config: &Config) -> Result<BackfillSummary> {
    let root = config.watch_root();
    if !root.is_dir() {
        bail!("Watch root {} is not a directory", root.display());
    }

    let executor = Arc::new(StoreExecutor::open(&config.database_path(), &config.database)?);
    let filter = WatchFilter::new(&root, &config.watch)?;
    let pipeline = SyncPipeline::new(&root, executor);

    let files = scan_tree(&root, &filter, config.watch.max_depth);
    let mut summary = BackfillSummary {
        files: files.len(),
        ..Default::default()
    };

    for path in files {
        match pipeline.sync_file(&path) {
            Ok(FileReport::Synced {
                line_errors,
                outcome,
                ..
            }) => {
                summary.synced += 1;
                summary.messages += outcome.messages;
                summary.line_errors += line_errors;
            }
            Ok(FileReport::Unchanged) => summary.unchanged += 1,
            Ok(FileReport::Removed) => {}
            Err(e) => {
                summary.failed += 1;
                error!(path = %path.display(), stage = e.stage(), error = %e, "Failed to sync file");
            }
        }
    }

    info!(
        files = summary.files,
        synced = summary.synced,
        unchanged = summary.unchanged,
        failed = summary.failed,
        "Backfill complete"
    );
    Ok(summary)
}
