//! Record-to-entity transformation
//!
//! Maps one file's parsed records onto the normalized session / message /
//! tool tables, resolving identifiers and checking referential invariants
//! before anything reaches the store.

mod entities;
mod tools;

pub use entities::{
    AttachmentEntity, EntityBatch, EnvironmentEntity, MessageEntity, MessageKind,
    SessionEntity, ToolInvocationEntity, ToolOutput, ToolResultEntity,
};
pub use tools::{classify_user_content, result_id, UserContentShape};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::parser::{ContentBlock, Record, RecordKind};

/// Identity of the file a batch comes from
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub source_path: PathBuf,
    /// Project directory name under the watch root
    pub project: Option<String>,
    /// Used as the timestamp when no record carries one
    pub observed_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// Derive identity from `<root>/<project>/<session>.jsonl`.
    ///
    /// The session id is the path relative to the root without its extension
    /// (`<project>/<session>`), so equally named files in different project
    /// directories stay separate sessions.
    pub fn from_path(root: &Path, path: &Path, observed_at: DateTime<Utc>) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let session_id = match path.strip_prefix(root).ok().and_then(Path::parent) {
            Some(dir) if dir.as_os_str().is_empty() => stem,
            Some(dir) => {
                let mut parts: Vec<String> = dir
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                parts.push(stem);
                parts.join("/")
            }
            // Outside the root: the full path keeps it unique
            None => path.with_extension("").to_string_lossy().to_string(),
        };

        let project = path
            .strip_prefix(root)
            .ok()
            .and_then(|rel| rel.components().next())
            .filter(|_| path.parent() != Some(root))
            .map(|c| c.as_os_str().to_string_lossy().to_string());

        Self {
            session_id,
            source_path: path.to_path_buf(),
            project,
            observed_at,
        }
    }
}

/// Transform a file's records. Returns `None` when there is nothing to write.
pub fn transform(records: &[Record], identity: &SessionIdentity) -> SyncResult<Option<EntityBatch>> {
    if records.is_empty() {
        return Ok(None);
    }

    let timestamps = resolve_timestamps(records, identity.observed_at);
    let created_at = timestamps.iter().min().copied().unwrap_or(identity.observed_at);
    let last_activity = timestamps.iter().max().copied().unwrap_or(identity.observed_at);

    let mut environment = EnvironmentEntity::default();
    let mut messages = Vec::new();
    let mut invocations = Vec::new();
    let mut results = Vec::new();
    let mut attachments = Vec::new();
    let mut seen_messages = HashSet::new();

    for (record, timestamp) in records.iter().zip(timestamps.iter().copied()) {
        absorb_environment(&mut environment, record);

        let kind = match record.kind {
            RecordKind::User => MessageKind::User,
            RecordKind::Assistant => MessageKind::Assistant,
            RecordKind::Summary => MessageKind::Summary,
            RecordKind::System => MessageKind::System,
            RecordKind::Other(ref other) => {
                debug!(
                    session = %identity.session_id,
                    line = record.line_number,
                    kind = %other,
                    "Pass-through record produces no message"
                );
                continue;
            }
        };

        let id = resolve_message_id(record, &identity.session_id);
        if !seen_messages.insert(id.clone()) {
            debug!(
                session = %identity.session_id,
                message = %id,
                line = record.line_number,
                "Duplicate message id in file, keeping first occurrence"
            );
            continue;
        }

        let blocks = record.content_blocks();
        let mut message = MessageEntity {
            id: id.clone(),
            session_id: identity.session_id.clone(),
            parent_id: record.str_field("parentUuid").map(String::from),
            kind,
            timestamp,
            user_text: None,
            agent_text: None,
            project: record
                .str_field("cwd")
                .and_then(|cwd| Path::new(cwd).file_name())
                .map(|n| n.to_string_lossy().to_string())
                .or_else(|| identity.project.clone()),
            model: record.message_str("model").map(String::from),
            line_number: record.line_number,
        };

        match kind {
            MessageKind::User => {
                let shape = classify_user_content(&blocks, record.body.contains_key("toolUseResult"));
                match shape {
                    UserContentShape::Human => {
                        message.user_text = join_text(&blocks);
                    }
                    UserContentShape::ToolOutput => {
                        message.kind = MessageKind::ToolResult;
                        results.extend(tools::extract_results(&id, &blocks));
                    }
                    UserContentShape::Mixed => {
                        message.user_text = join_text(&blocks);
                        results.extend(tools::extract_results(&id, &blocks));
                    }
                }
            }
            MessageKind::Assistant => {
                message.agent_text = join_text(&blocks);
                invocations.extend(tools::extract_invocations(&id, &blocks));
                results.extend(tools::extract_results(&id, &blocks));
            }
            MessageKind::Summary => {
                message.agent_text = record.str_field("summary").map(String::from);
            }
            MessageKind::System | MessageKind::ToolResult => {
                message.agent_text = join_text(&blocks);
            }
        }

        attachments.extend(extract_attachments(&id, &blocks));
        messages.push(message);
    }

    dedup_by_id(&mut invocations, |i| i.id.as_str());
    dedup_by_id(&mut results, |r| r.id.as_str());

    let mut batch = EntityBatch {
        session: SessionEntity {
            id: identity.session_id.clone(),
            source_path: identity.source_path.clone(),
            project: identity.project.clone(),
            created_at,
            last_activity,
        },
        messages,
        invocations,
        results,
        attachments,
        environment: (!environment.is_empty()).then_some(environment),
        external_invocations: Vec::new(),
    };
    validate(&mut batch)?;

    Ok(Some(batch))
}

/// Check referential invariants. Result references that do not resolve inside
/// the batch are recorded in `external_invocations` for the store to verify.
pub fn validate(batch: &mut EntityBatch) -> SyncResult<()> {
    let session = batch.session.id.clone();
    let fail = |reason: String| SyncError::Validation {
        session: session.clone(),
        reason,
    };

    let mut message_ids = HashSet::new();
    for message in &batch.messages {
        if message.session_id != batch.session.id {
            return Err(fail(format!(
                "message {} references session {}",
                message.id, message.session_id
            )));
        }
        if !message_ids.insert(message.id.as_str()) {
            return Err(fail(format!("duplicate message id {}", message.id)));
        }
    }

    let mut invocation_ids = HashSet::new();
    for invocation in &batch.invocations {
        if !message_ids.contains(invocation.message_id.as_str()) {
            return Err(fail(format!(
                "tool invocation {} references missing message {}",
                invocation.id, invocation.message_id
            )));
        }
        invocation_ids.insert(invocation.id.as_str());
    }

    let mut external = Vec::new();
    for result in &batch.results {
        if !message_ids.contains(result.message_id.as_str()) {
            return Err(fail(format!(
                "tool result {} references missing message {}",
                result.id, result.message_id
            )));
        }
        if !invocation_ids.contains(result.invocation_id.as_str()) {
            external.push(result.invocation_id.clone());
        }
    }

    for attachment in &batch.attachments {
        if !message_ids.contains(attachment.message_id.as_str()) {
            return Err(fail(format!(
                "attachment {} references missing message {}",
                attachment.id, attachment.message_id
            )));
        }
    }

    external.sort();
    external.dedup();
    batch.external_invocations = external;
    Ok(())
}

/// Resolve a message id: `id`, `uuid`, `message.id`, `leafUuid`, then a
/// deterministic hash of the record's position and content.
pub fn resolve_message_id(record: &Record, session_id: &str) -> String {
    if let Some(id) = record
        .str_field("id")
        .or_else(|| record.str_field("uuid"))
        .or_else(|| record.message_str("id"))
    {
        return id.to_string();
    }
    if let Some(leaf) = record.str_field("leafUuid") {
        return format!("summary:{}", leaf);
    }

    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(record.line_number.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(record.raw.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("gen-{}", &digest[..32])
}

/// Per-record timestamps with gaps filled: carry forward the previous one,
/// or before the first, use the first one in the file.
fn resolve_timestamps(records: &[Record], fallback: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let first_known = records
        .iter()
        .find_map(|r| r.timestamp)
        .unwrap_or(fallback);

    let mut current = first_known;
    records
        .iter()
        .map(|r| {
            if let Some(ts) = r.timestamp {
                current = ts;
            }
            current
        })
        .collect()
}

fn absorb_environment(env: &mut EnvironmentEntity, record: &Record) {
    if let Some(cwd) = record.str_field("cwd") {
        env.cwd = Some(cwd.to_string());
    }
    if let Some(branch) = record.str_field("gitBranch") {
        env.git_branch = Some(branch.to_string());
    }
    if let Some(version) = record.str_field("version") {
        env.tool_version = Some(version.to_string());
    }
}

fn join_text(blocks: &[ContentBlock<'_>]) -> Option<String> {
    let parts: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text(t) if !t.trim().is_empty() => Some(*t),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn extract_attachments(message_id: &str, blocks: &[ContentBlock<'_>]) -> Vec<AttachmentEntity> {
    blocks
        .iter()
        .enumerate()
        .filter_map(|(index, block)| match block {
            ContentBlock::Image {
                media_type,
                byte_len,
            } => Some(AttachmentEntity {
                id: format!("{}#{}", message_id, index),
                message_id: message_id.to_string(),
                kind: "image".to_string(),
                media_type: media_type.map(String::from),
                byte_len: byte_len.map(|n| n as i64),
            }),
            _ => None,
        })
        .collect()
}

fn dedup_by_id<T>(items: &mut Vec<T>, key: impl Fn(&T) -> &str) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item).to_string()));
}
