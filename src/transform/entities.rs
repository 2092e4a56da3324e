//! Normalized entities written to the store

use chrono::{DateTime, Utc};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntity {
    pub id: String,
    pub source_path: PathBuf,
    pub project: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Message discriminator as stored in `messages.kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    Assistant,
    Summary,
    System,
    /// A user-typed record that turned out to carry tool output
    ToolResult,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Assistant => "assistant",
            MessageKind::Summary => "summary",
            MessageKind::System => "system",
            MessageKind::ToolResult => "tool_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntity {
    pub id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub user_text: Option<String>,
    pub agent_text: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub line_number: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationEntity {
    pub id: String,
    pub message_id: String,
    pub tool_name: String,
    /// JSON-serialized input
    pub parameters: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEntity {
    pub id: String,
    pub invocation_id: String,
    /// Message whose content carried the result
    pub message_id: String,
    pub output: ToolOutput,
}

/// Success and error output are mutually exclusive
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Success(String),
    Error(String),
}

impl ToolOutput {
    pub fn success(&self) -> Option<&str> {
        match self {
            ToolOutput::Success(s) => Some(s),
            ToolOutput::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ToolOutput::Error(s) => Some(s),
            ToolOutput::Success(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentEntity {
    pub id: String,
    pub message_id: String,
    pub kind: String,
    pub media_type: Option<String>,
    pub byte_len: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentEntity {
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub tool_version: Option<String>,
}

impl EnvironmentEntity {
    pub fn is_empty(&self) -> bool {
        self.cwd.is_none() && self.git_branch.is_none() && self.tool_version.is_none()
    }
}

/// Everything one file contributes to the store
#[derive(Debug, Clone)]
pub struct EntityBatch {
    pub session: SessionEntity,
    pub messages: Vec<MessageEntity>,
    pub invocations: Vec<ToolInvocationEntity>,
    pub results: Vec<ToolResultEntity>,
    pub attachments: Vec<AttachmentEntity>,
    pub environment: Option<EnvironmentEntity>,
    /// Invocation ids referenced by results but defined in an earlier write.
    /// The executor checks these against the store inside the transaction.
    pub external_invocations: Vec<String>,
}
