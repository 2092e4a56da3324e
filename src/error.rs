//! Error types for the sync pipeline
//!
//! Line-level parse problems are not errors at this level: the parser returns
//! them as values (see [`crate::parser::LineError`]). Everything here is a
//! file-level or engine-level failure.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A referential invariant was violated; the file's write is aborted.
    #[error("validation failed for session {session}: {reason}")]
    Validation { session: String, reason: String },

    /// The store stayed busy/locked through every retry attempt.
    #[error("store busy after {attempts} attempts: {source}")]
    StoreBusy {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The watched root disappeared; the engine cannot continue.
    #[error("watch root lost: {root}")]
    WatchLost { root: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Busy/locked conditions are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(e) => is_busy(e),
            _ => false,
        }
    }

    /// Pipeline stage label used in structured logs.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Validation { .. } => "transform",
            SyncError::StoreBusy { .. } | SyncError::Store(_) => "store",
            SyncError::Io { .. } => "read",
            SyncError::WatchLost { .. } => "watch",
            SyncError::Config(_) => "config",
        }
    }
}

/// Whether a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}
