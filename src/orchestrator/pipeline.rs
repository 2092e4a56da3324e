//! One file through read → parse → transform → store

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::parser::parse_content;
use crate::store::{FileWrite, StoreExecutor, WriteOutcome};
use crate::transform::{transform, SessionIdentity};
use crate::watcher::{FileEvent, FileEventKind};

/// What happened to one file event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReport {
    Synced {
        records: usize,
        line_errors: usize,
        outcome: WriteOutcome,
    },
    /// Content hash matches the last sync
    Unchanged,
    /// Source is gone; stored rows are kept
    Removed,
}

#[derive(Clone)]
pub struct SyncPipeline {
    root: PathBuf,
    executor: Arc<StoreExecutor>,
}

impl SyncPipeline {
    pub fn new(root: &Path, executor: Arc<StoreExecutor>) -> Self {
        Self {
            root: root.to_path_buf(),
            executor,
        }
    }

    pub fn handle(&self, event: &FileEvent) -> SyncResult<FileReport> {
        match event.kind {
            FileEventKind::Removed => {
                info!(path = %event.path.display(), "Source file removed; stored rows retained");
                Ok(FileReport::Removed)
            }
            FileEventKind::Added | FileEventKind::Modified => self.sync_file(&event.path),
        }
    }

    /// Read the file's current content and apply it to the store
    pub fn sync_file(&self, path: &Path) -> SyncResult<FileReport> {
        let (bytes, observed_at) = match read_source(path) {
            Ok(read) => read,
            // Deleted between notification and read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "File vanished before read");
                return Ok(FileReport::Removed);
            }
            Err(e) => return Err(SyncError::io(path, e)),
        };

        let content_hash = hex::encode(Sha256::digest(&bytes));
        if self.executor.is_unchanged(path, &content_hash)? {
            debug!(path = %path.display(), "Content unchanged since last sync");
            return Ok(FileReport::Unchanged);
        }

        let parsed = parse_content(&bytes);
        if parsed.is_empty() {
            debug!(path = %path.display(), "File has no lines yet");
        }
        for err in &parsed.errors {
            warn!(
                path = %path.display(),
                line = err.line_number,
                reason = %err.reason,
                stage = "parse",
                "Skipping unparseable line"
            );
        }

        let identity = SessionIdentity::from_path(&self.root, path, observed_at);
        let batch = transform(&parsed.records, &identity)?;

        let write = FileWrite {
            source_path: path.to_path_buf(),
            content_hash,
            byte_len: bytes.len() as u64,
            record_count: parsed.records.len(),
            errors: parsed.errors,
            batch,
        };
        let outcome = self.executor.apply(&write)?;

        Ok(FileReport::Synced {
            records: write.record_count,
            line_errors: write.errors.len(),
            outcome,
        })
    }
}

fn read_source(path: &Path) -> std::io::Result<(Vec<u8>, DateTime<Utc>)> {
    let bytes = std::fs::read(path)?;
    let observed_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((bytes, observed_at))
}
