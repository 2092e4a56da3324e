//! Transactional writer for one file's entities
//!
//! Lock order is always per-session scope first, then the global write scope
//! (the writer connection itself). Every insert is `ON CONFLICT DO NOTHING`,
//! so applying the same file twice changes nothing.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::{format_timestamp, open_writer};
use crate::config::{DatabaseConfig, RetryConfig};
use crate::error::{SyncError, SyncResult};
use crate::parser::LineError;
use crate::transform::EntityBatch;

/// Everything the executor needs to persist one file
#[derive(Debug, Clone)]
pub struct FileWrite {
    pub source_path: PathBuf,
    /// Hex SHA-256 of the file content that produced this write
    pub content_hash: String,
    pub byte_len: u64,
    pub record_count: usize,
    pub errors: Vec<LineError>,
    /// `None` when the file yielded no records
    pub batch: Option<EntityBatch>,
}

/// Rows actually inserted (conflicts excluded)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub messages: usize,
    pub invocations: usize,
    pub results: usize,
    pub attachments: usize,
    pub attempts: u32,
}

pub struct StoreExecutor {
    /// Global write scope: only one transaction at a time
    writer: Mutex<Connection>,
    /// Per-session scope, taken before the global one
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    retry: RetryConfig,
}

impl StoreExecutor {
    pub fn open(path: &Path, config: &DatabaseConfig) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let conn = open_writer(path, Duration::from_millis(config.busy_timeout_ms))?;
        Ok(Self::from_connection(conn, config.retry.clone()))
    }

    pub fn from_connection(conn: Connection, retry: RetryConfig) -> Self {
        Self {
            writer: Mutex::new(conn),
            session_locks: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Whether `path` was last synced from content with this hash
    pub fn is_unchanged(&self, path: &Path, content_hash: &str) -> SyncResult<bool> {
        let conn = self.writer();
        let recorded: Option<String> = conn
            .query_row(
                "SELECT content_hash FROM sync_files WHERE source_path = ?",
                params![path_str(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(recorded.as_deref() == Some(content_hash))
    }

    /// Apply one file's write as a single transaction, retrying while the store is busy
    pub fn apply(&self, write: &FileWrite) -> SyncResult<WriteOutcome> {
        let scope = write
            .batch
            .as_ref()
            .map(|b| b.session.id.clone())
            .unwrap_or_else(|| path_str(&write.source_path));

        let session_lock = self.session_lock(&scope);
        let outcome = {
            let _session_guard = session_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.apply_with_retry(write)
        };
        self.release_session_lock(&scope, session_lock);
        outcome
    }

    fn apply_with_retry(&self, write: &FileWrite) -> SyncResult<WriteOutcome> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = {
                let mut conn = self.writer();
                write_once(&mut conn, write)
            };

            match result {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(match e {
                            SyncError::Store(source) => SyncError::StoreBusy {
                                attempts: attempt,
                                source,
                            },
                            other => other,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        path = %write.source_path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Store busy, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn session_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_session_lock(&self, scope: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().unwrap_or_else(|p| p.into_inner());
        // Map entry plus ours: nobody else is waiting on it.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(scope);
        }
    }
}

fn write_once(conn: &mut Connection, write: &FileWrite) -> SyncResult<WriteOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut outcome = WriteOutcome::default();

    if let Some(batch) = &write.batch {
        write_batch(&tx, batch, &mut outcome)?;
    }

    let source = path_str(&write.source_path);
    let now = format_timestamp(&Utc::now());

    tx.execute("DELETE FROM parse_errors WHERE source_path = ?", params![source])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO parse_errors (source_path, line_number, reason, recorded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(source_path, line_number) DO NOTHING",
        )?;
        for error in &write.errors {
            stmt.execute(params![source, error.line_number as i64, error.reason, now])?;
        }
    }

    tx.execute(
        r#"INSERT INTO sync_files
           (source_path, session_id, content_hash, byte_len, record_count, error_count, synced_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(source_path) DO UPDATE SET
               session_id = excluded.session_id,
               content_hash = excluded.content_hash,
               byte_len = excluded.byte_len,
               record_count = excluded.record_count,
               error_count = excluded.error_count,
               synced_at = excluded.synced_at"#,
        params![
            source,
            write.batch.as_ref().map(|b| b.session.id.as_str()),
            write.content_hash,
            write.byte_len as i64,
            write.record_count as i64,
            write.errors.len() as i64,
            now,
        ],
    )?;

    tx.commit()?;
    Ok(outcome)
}

fn write_batch(tx: &Transaction<'_>, batch: &EntityBatch, outcome: &mut WriteOutcome) -> SyncResult<()> {
    let session = &batch.session;

    tx.execute(
        r#"INSERT INTO sessions (id, source_path, project, created_at, last_activity)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
               last_activity = MAX(sessions.last_activity, excluded.last_activity)"#,
        params![
            session.id,
            path_str(&session.source_path),
            session.project,
            format_timestamp(&session.created_at),
            format_timestamp(&session.last_activity),
        ],
    )?;

    for invocation_id in &batch.external_invocations {
        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM tool_invocations WHERE id = ?",
                params![invocation_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(SyncError::Validation {
                session: session.id.clone(),
                reason: format!("tool result references unknown invocation {}", invocation_id),
            });
        }
    }

    {
        let mut stmt = tx.prepare(
            r#"INSERT INTO messages
               (id, session_id, parent_id, kind, timestamp, user_text, agent_text, project, model, line_number)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )?;
        for msg in &batch.messages {
            outcome.messages += stmt.execute(params![
                msg.id,
                msg.session_id,
                msg.parent_id,
                msg.kind.as_str(),
                format_timestamp(&msg.timestamp),
                msg.user_text,
                msg.agent_text,
                msg.project,
                msg.model,
                msg.line_number as i64,
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            r#"INSERT INTO tool_invocations (id, message_id, tool_name, parameters)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )?;
        for invocation in &batch.invocations {
            outcome.invocations += stmt.execute(params![
                invocation.id,
                invocation.message_id,
                invocation.tool_name,
                invocation.parameters,
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            r#"INSERT INTO tool_results (id, invocation_id, message_id, output, error_output)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )?;
        for result in &batch.results {
            outcome.results += stmt.execute(params![
                result.id,
                result.invocation_id,
                result.message_id,
                result.output.success(),
                result.output.error(),
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            r#"INSERT INTO attachments (id, message_id, kind, media_type, byte_len)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )?;
        for attachment in &batch.attachments {
            outcome.attachments += stmt.execute(params![
                attachment.id,
                attachment.message_id,
                attachment.kind,
                attachment.media_type,
                attachment.byte_len,
            ])?;
        }
    }

    if let Some(env) = &batch.environment {
        tx.execute(
            r#"INSERT INTO environments (session_id, cwd, git_branch, tool_version, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(session_id) DO UPDATE SET
                   cwd = COALESCE(excluded.cwd, environments.cwd),
                   git_branch = COALESCE(excluded.git_branch, environments.git_branch),
                   tool_version = COALESCE(excluded.tool_version, environments.tool_version),
                   updated_at = excluded.updated_at"#,
            params![
                session.id,
                env.cwd,
                env.git_branch,
                env.tool_version,
                format_timestamp(&Utc::now()),
            ],
        )?;
    }

    debug!(
        session = %session.id,
        messages = outcome.messages,
        invocations = outcome.invocations,
        results = outcome.results,
        "Batch staged"
    );
    Ok(())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
