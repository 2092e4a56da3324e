//! SQLite schema definition
//!
//! Core tables: sessions, messages, tool_invocations, tool_results.
//! Auxiliary: environments, attachments, parse_errors, sync_files.

pub const SCHEMA_VERSION: i64 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
"#;

pub const SCHEMA: &str = r#"
-- ============================================
-- META
-- ============================================

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- ============================================
-- SESSIONS
-- ============================================

-- One row per source log file
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,                   -- file stem
    source_path TEXT NOT NULL,
    project TEXT,                          -- project directory under the watch root
    created_at DATETIME NOT NULL,          -- earliest record timestamp
    last_activity DATETIME NOT NULL        -- latest record timestamp
);

-- ============================================
-- MESSAGES
-- ============================================

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    parent_id TEXT,
    kind TEXT NOT NULL,                    -- 'user', 'assistant', 'summary', 'system', 'tool_result'
    timestamp DATETIME NOT NULL,
    user_text TEXT,
    agent_text TEXT,
    project TEXT,                          -- origin context label
    model TEXT,
    line_number INTEGER NOT NULL,
    FOREIGN KEY(session_id) REFERENCES sessions(id)
);

-- ============================================
-- TOOLS
-- ============================================

CREATE TABLE IF NOT EXISTS tool_invocations (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    parameters TEXT NOT NULL,              -- JSON
    FOREIGN KEY(message_id) REFERENCES messages(id)
);

CREATE TABLE IF NOT EXISTS tool_results (
    id TEXT PRIMARY KEY,
    invocation_id TEXT NOT NULL,
    message_id TEXT NOT NULL,              -- message that carried the result
    output TEXT,
    error_output TEXT,
    CHECK ((output IS NULL) <> (error_output IS NULL)),
    FOREIGN KEY(invocation_id) REFERENCES tool_invocations(id),
    FOREIGN KEY(message_id) REFERENCES messages(id)
);

-- ============================================
-- AUXILIARY
-- ============================================

CREATE TABLE IF NOT EXISTS environments (
    session_id TEXT PRIMARY KEY,
    cwd TEXT,
    git_branch TEXT,
    tool_version TEXT,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY(session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    media_type TEXT,
    byte_len INTEGER,
    FOREIGN KEY(message_id) REFERENCES messages(id)
);

-- Latest line-level parse errors per file
CREATE TABLE IF NOT EXISTS parse_errors (
    source_path TEXT NOT NULL,
    line_number INTEGER NOT NULL,
    reason TEXT NOT NULL,
    recorded_at DATETIME NOT NULL,
    PRIMARY KEY(source_path, line_number)
);

-- Processing ledger
CREATE TABLE IF NOT EXISTS sync_files (
    source_path TEXT PRIMARY KEY,
    session_id TEXT,
    content_hash TEXT NOT NULL,
    byte_len INTEGER NOT NULL,
    record_count INTEGER NOT NULL,
    error_count INTEGER NOT NULL,
    synced_at DATETIME NOT NULL
);

-- ============================================
-- INDEXES
-- ============================================

CREATE INDEX IF NOT EXISTS idx_messages_session_order ON messages(session_id, timestamp, id);
CREATE INDEX IF NOT EXISTS idx_messages_kind ON messages(kind);
CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity DESC);
CREATE INDEX IF NOT EXISTS idx_tool_invocations_message ON tool_invocations(message_id);
CREATE INDEX IF NOT EXISTS idx_tool_invocations_name ON tool_invocations(tool_name);
CREATE INDEX IF NOT EXISTS idx_tool_results_invocation ON tool_results(invocation_id);
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
"#;
