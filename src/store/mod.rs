//! Relational mirror store on SQLite
//!
//! Writes go through [`StoreExecutor`], which owns the single writer
//! connection. [`MirrorStore`] is the read side: read-only connections in WAL
//! mode, so readers never wait on a writer for longer than one commit.

mod executor;
mod schema;

pub use executor::{FileWrite, StoreExecutor, WriteOutcome};
pub use schema::{PRAGMAS, SCHEMA, SCHEMA_VERSION};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;

/// Fixed-width RFC 3339 so that text order equals time order
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Open (or create) the store, apply pragmas and create the schema if absent
pub(crate) fn open_writer(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(conn)
}

pub struct MirrorStore {
    conn: Connection,
}

impl MirrorStore {
    /// Open an existing store for reading
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open store {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        Ok(Self { conn })
    }

    // ============================================
    // STATS
    // ============================================

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |table: &str| -> Result<i64> {
            let n = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n)
        };

        Ok(StoreStats {
            sessions: count("sessions")?,
            messages: count("messages")?,
            tool_invocations: count("tool_invocations")?,
            tool_results: count("tool_results")?,
            attachments: count("attachments")?,
            parse_errors: count("parse_errors")?,
            files: count("sync_files")?,
        })
    }

    // ============================================
    // SESSIONS
    // ============================================

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT s.id, s.source_path, s.project, s.created_at, s.last_activity,
                      (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
               FROM sessions s
               ORDER BY s.last_activity DESC"#,
        )?;

        let rows = stmt.query_map([], map_session_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Find a session by exact id, then by id prefix, then by prefix of the
    /// file-name part (`<project>/<name>`)
    pub fn get_session(&self, query: &str) -> Result<Option<SessionRow>> {
        let row = self
            .conn
            .query_row(
                r#"SELECT s.id, s.source_path, s.project, s.created_at, s.last_activity,
                          (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
                   FROM sessions s
                   WHERE s.id = ?1 OR s.id LIKE ?2 OR s.id LIKE ?3
                   ORDER BY CASE WHEN s.id = ?1 THEN 0 WHEN s.id LIKE ?2 THEN 1 ELSE 2 END,
                            s.last_activity DESC
                   LIMIT 1"#,
                params![query, format!("{}%", query), format!("%/{}%", query)],
                map_session_row,
            )
            .optional()?;
        Ok(row)
    }

    // ============================================
    // MESSAGES
    // ============================================

    /// Messages of a session ordered by timestamp, ties broken by id.
    ///
    /// A record without a timestamp inherits its predecessor's, so it ties
    /// with that record and may sort before it.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, kind, timestamp, user_text, agent_text, project, model, line_number
               FROM messages
               WHERE session_id = ?
               ORDER BY timestamp, id"#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                timestamp: row.get(2)?,
                user_text: row.get(3)?,
                agent_text: row.get(4)?,
                project: row.get(5)?,
                model: row.get(6)?,
                line_number: row.get(7)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Tool invocations of a message with their result, if any
    pub fn get_tool_calls(&self, message_id: &str) -> Result<Vec<ToolCallRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT i.id, i.tool_name, i.parameters, r.output, r.error_output
               FROM tool_invocations i
               LEFT JOIN tool_results r ON r.invocation_id = i.id
               WHERE i.message_id = ?
               ORDER BY i.rowid"#,
        )?;

        let rows = stmt.query_map(params![message_id], |row| {
            Ok(ToolCallRow {
                invocation_id: row.get(0)?,
                tool_name: row.get(1)?,
                parameters: row.get(2)?,
                output: row.get(3)?,
                error_output: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ============================================
    // SYNC LEDGER
    // ============================================

    /// Last applied state of a source file, if it was ever synced
    pub fn sync_file(&self, source_path: &Path) -> Result<Option<SyncFileRow>> {
        let row = self
            .conn
            .query_row(
                r#"SELECT session_id, content_hash, byte_len, record_count, error_count, synced_at
                   FROM sync_files
                   WHERE source_path = ?"#,
                params![source_path.to_string_lossy().to_string()],
                |row| {
                    Ok(SyncFileRow {
                        session_id: row.get(0)?,
                        content_hash: row.get(1)?,
                        byte_len: row.get(2)?,
                        record_count: row.get(3)?,
                        error_count: row.get(4)?,
                        synced_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ============================================
    // PARSE ERRORS
    // ============================================

    pub fn parse_errors(&self, source_path: &Path) -> Result<Vec<ParseErrorRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT line_number, reason FROM parse_errors
               WHERE source_path = ?
               ORDER BY line_number"#,
        )?;

        let rows = stmt.query_map(params![source_path.to_string_lossy().to_string()], |row| {
            Ok(ParseErrorRow {
                line_number: row.get(0)?,
                reason: row.get(1)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        source_path: row.get(1)?,
        project: row.get(2)?,
        created_at: row.get(3)?,
        last_activity: row.get(4)?,
        message_count: row.get(5)?,
    })
}

// ============================================
// ROW TYPES
// ============================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub sessions: i64,
    pub messages: i64,
    pub tool_invocations: i64,
    pub tool_results: i64,
    pub attachments: i64,
    pub parse_errors: i64,
    pub files: i64,
}

#[derive(Debug)]
pub struct SessionRow {
    pub id: String,
    pub source_path: String,
    pub project: Option<String>,
    pub created_at: String,
    pub last_activity: String,
    pub message_count: i64,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: String,
    pub kind: String,
    pub timestamp: String,
    pub user_text: Option<String>,
    pub agent_text: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub line_number: i64,
}

#[derive(Debug)]
pub struct ToolCallRow {
    pub invocation_id: String,
    pub tool_name: String,
    pub parameters: String,
    pub output: Option<String>,
    pub error_output: Option<String>,
}

#[derive(Debug)]
pub struct ParseErrorRow {
    pub line_number: i64,
    pub reason: String,
}

#[derive(Debug)]
pub struct SyncFileRow {
    pub session_id: Option<String>,
    pub content_hash: String,
    pub byte_len: i64,
    pub record_count: i64,
    pub error_count: i64,
    pub synced_at: String,
}
