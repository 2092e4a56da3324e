//! Log tree watcher
//!
//! Produces one stream of [`WatchEvent`]s covering both files that exist at
//! startup and files that appear or change later. The notify watch is
//! registered *before* the initial scan, and both feed the same pending set,
//! so a file modified between scan and watch can't be missed. A path is only
//! emitted once it has gone `quiescence` without further notifications.

mod filter;

pub use filter::WatchFilter;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    File(FileEvent),
    /// The watched root is gone; no further events will arrive.
    RootLost(PathBuf),
}

/// Internal notifications feeding the pending set
#[derive(Debug)]
enum Signal {
    Touched(PathBuf),
    ScanComplete(usize),
    RootRemoved,
}

pub struct LogWatcher {
    watcher: Option<RecommendedWatcher>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl LogWatcher {
    /// Register the watch, queue every existing file, and start emitting into `events`.
    pub fn start(root: &Path, config: &WatchConfig, events: mpsc::Sender<WatchEvent>) -> SyncResult<Self> {
        let metadata = std::fs::metadata(root).map_err(|e| SyncError::io(root, e))?;
        if !metadata.is_dir() {
            return Err(SyncError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "watch root is not a directory"),
            ));
        }

        let filter = WatchFilter::new(root, config)?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let callback_tx = signal_tx.clone();
        let callback_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let signal = if matches!(event.kind, EventKind::Remove(_)) && path == callback_root {
                        Signal::RootRemoved
                    } else {
                        Signal::Touched(path)
                    };
                    let _ = callback_tx.send(signal);
                }
            }
            Err(e) => {
                warn!(root = %callback_root.display(), error = %e, "File watcher error");
            }
        })
        .map_err(|e| SyncError::Config(format!("failed to create file watcher: {}", e)))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Config(format!("failed to watch {}: {}", root.display(), e)))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_loop(
            filter,
            config.quiescence(),
            signal_tx,
            signal_rx,
            events,
            stop_rx,
            Arc::clone(&alive),
        ));

        info!(
            root = %root.display(),
            quiescence_ms = config.quiescence_ms,
            max_depth = config.max_depth,
            "Watching log tree"
        );

        Ok(Self {
            watcher: Some(watcher),
            stop_tx,
            task: Some(task),
            alive,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Shared liveness flag, cleared when the event loop exits
    pub fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    /// Stop watching and wait for the event loop to exit
    pub async fn stop(mut self) {
        self.watcher.take();
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Watcher task ended abnormally");
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

async fn run_loop(
    filter: WatchFilter,
    quiescence: Duration,
    signal_tx: mpsc::UnboundedSender<Signal>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::Sender<WatchEvent>,
    mut stop_rx: watch::Receiver<bool>,
    alive: Arc<AtomicBool>,
) {
    // Backfill: existing files join the same pending set as live notifications.
    let scan_filter = filter.clone();
    let scan_tx = signal_tx.clone();
    tokio::task::spawn_blocking(move || {
        let files = scan_tree(scan_filter.root(), &scan_filter, scan_filter.max_depth());
        let count = files.len();
        for path in files {
            let _ = scan_tx.send(Signal::Touched(path));
        }
        let _ = scan_tx.send(Signal::ScanComplete(count));
    });
    drop(signal_tx);

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut known: HashSet<PathBuf> = HashSet::new();
    let tick_every = (quiescence / 4).max(Duration::from_millis(20));
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let lost = 'events: loop {
        tokio::select! {
            _ = stop_rx.changed() => break false,

            Some(signal) = signals.recv() => match signal {
                Signal::RootRemoved => break true,
                Signal::Touched(path) => touch(&filter, &mut pending, path),
                Signal::ScanComplete(count) => {
                    info!(root = %filter.root().display(), files = count, "Backfill scan queued");
                }
            },

            _ = ticker.tick() => {
                if !filter.root().exists() {
                    break true;
                }
                let due = take_due(&mut pending, quiescence);
                for path in due {
                    let Some(event) = classify(&mut known, path) else {
                        continue;
                    };
                    debug!(path = %event.path.display(), kind = ?event.kind, "File event");
                    // A full channel must not hold off a stop request
                    tokio::select! {
                        sent = events.send(WatchEvent::File(event)) => {
                            if sent.is_err() {
                                alive.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                        _ = stop_rx.changed() => break 'events false,
                    }
                }
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    if lost {
        error!(root = %filter.root().display(), "Watch root removed");
        tokio::select! {
            _ = events.send(WatchEvent::RootLost(filter.root().to_path_buf())) => {}
            _ = stop_rx.changed() => {}
        }
    }
}

/// Record activity on a path. New directories are scanned, since files can
/// land in them before the recursive watch picks them up.
fn touch(filter: &WatchFilter, pending: &mut HashMap<PathBuf, Instant>, path: PathBuf) {
    if path.is_dir() {
        let depth_used = path
            .strip_prefix(filter.root())
            .map(|rel| rel.components().count())
            .unwrap_or(usize::MAX);
        if depth_used < filter.max_depth() {
            for file in scan_tree(&path, filter, filter.max_depth() - depth_used) {
                pending.insert(file, Instant::now());
            }
        }
        return;
    }

    if filter.accepts(&path) {
        pending.insert(path, Instant::now());
    }
}

/// Paths whose last activity is at least `quiescence` ago, removed from `pending`
fn take_due(pending: &mut HashMap<PathBuf, Instant>, quiescence: Duration) -> Vec<PathBuf> {
    let now = Instant::now();
    let mut due: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, last)| now.duration_since(**last) >= quiescence)
        .map(|(path, _)| path.clone())
        .collect();
    due.sort();
    for path in &due {
        pending.remove(path);
    }
    due
}

/// Turn a settled path into an event based on what we've emitted before
fn classify(known: &mut HashSet<PathBuf>, path: PathBuf) -> Option<FileEvent> {
    if path.is_file() {
        let kind = if known.insert(path.clone()) {
            FileEventKind::Added
        } else {
            FileEventKind::Modified
        };
        Some(FileEvent { kind, path })
    } else if known.remove(&path) {
        Some(FileEvent {
            kind: FileEventKind::Removed,
            path,
        })
    } else {
        // Created and deleted within one window, never seen.
        None
    }
}

/// Accepted files under `dir`, at most `max_depth` levels down
pub fn scan_tree(dir: &Path, filter: &WatchFilter, max_depth: usize) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(max_depth).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if filter.accepts(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry during scan");
            }
        }
    }
    files.sort();
    files
}
