//! Tool invocation/result extraction from content blocks
//!
//! Tool output is logged inside records whose discriminator is `user`, the
//! same one used for text typed by a person. The only way to tell them apart
//! is the shape of the embedded content, so [`classify_user_content`] is a
//! heuristic and can misjudge unusual records.

use serde_json::Value;

use super::entities::{ToolInvocationEntity, ToolOutput, ToolResultEntity};
use crate::parser::ContentBlock;

/// What a `user` record's content looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserContentShape {
    /// Only human text (or nothing recognizable)
    Human,
    /// Only tool result blocks, no text
    ToolOutput,
    /// Text alongside tool results
    Mixed,
}

/// Decide whether a user record is human input or tool output in disguise.
///
/// `has_result_marker` is the record-level `toolUseResult` field, which some
/// log versions add next to result blocks.
pub fn classify_user_content(blocks: &[ContentBlock<'_>], has_result_marker: bool) -> UserContentShape {
    let results = blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
        .count();
    let texts = blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::Text(t) if !t.trim().is_empty()))
        .count();

    match (results, texts) {
        (0, _) => UserContentShape::Human,
        (_, 0) => UserContentShape::ToolOutput,
        // Text next to a result with the marker set is the tool's own text output.
        (_, _) if has_result_marker => UserContentShape::ToolOutput,
        _ => UserContentShape::Mixed,
    }
}

/// Collect `tool_use` blocks as invocations owned by `message_id`.
///
/// Blocks without an id get `<message_id>#<block index>`.
pub fn extract_invocations(message_id: &str, blocks: &[ContentBlock<'_>]) -> Vec<ToolInvocationEntity> {
    blocks
        .iter()
        .enumerate()
        .filter_map(|(index, block)| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolInvocationEntity {
                id: id
                    .map(String::from)
                    .unwrap_or_else(|| format!("{}#{}", message_id, index)),
                message_id: message_id.to_string(),
                tool_name: name.to_string(),
                parameters: input
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            }),
            _ => None,
        })
        .collect()
}

/// Collect result blocks carried by `message_id`
pub fn extract_results(message_id: &str, blocks: &[ContentBlock<'_>]) -> Vec<ToolResultEntity> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = content.map(result_text).unwrap_or_default();
                Some(ToolResultEntity {
                    id: result_id(tool_use_id),
                    invocation_id: tool_use_id.to_string(),
                    message_id: message_id.to_string(),
                    output: if *is_error {
                        ToolOutput::Error(text)
                    } else {
                        ToolOutput::Success(text)
                    },
                })
            }
            _ => None,
        })
        .collect()
}

/// One result per invocation: the id is derived from the invocation id.
pub fn result_id(invocation_id: &str) -> String {
    format!("{}#result", invocation_id)
}

/// Flatten a result payload: strings as-is, text blocks joined, anything else as JSON.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shapes() {
        let content = json!("ok");
        let result = ContentBlock::ToolResult {
            tool_use_id: "t1",
            content: Some(&content),
            is_error: false,
        };

        assert_eq!(
            classify_user_content(&[ContentBlock::Text("hello")], false),
            UserContentShape::Human
        );
        assert_eq!(
            classify_user_content(&[result.clone()], false),
            UserContentShape::ToolOutput
        );
        assert_eq!(
            classify_user_content(&[ContentBlock::Text("see"), result.clone()], false),
            UserContentShape::Mixed
        );
        assert_eq!(
            classify_user_content(&[ContentBlock::Text("see"), result], true),
            UserContentShape::ToolOutput
        );
        assert_eq!(classify_user_content(&[], false), UserContentShape::Human);
    }

    #[test]
    fn test_invocation_without_id_gets_positional_id() {
        let input = json!({"path": "/tmp"});
        let blocks = vec![
            ContentBlock::Text("running"),
            ContentBlock::ToolUse {
                id: None,
                name: "Read",
                input: Some(&input),
            },
        ];
        let invocations = extract_invocations("m1", &blocks);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].id, "m1#1");
        assert_eq!(invocations[0].parameters, r#"{"path":"/tmp"}"#);
    }

    #[test]
    fn test_error_results_are_error_output() {
        let content = json!([{"type": "text", "text": "line1"}, {"type": "text", "text": "line2"}]);
        let blocks = vec![ContentBlock::ToolResult {
            tool_use_id: "t9",
            content: Some(&content),
            is_error: true,
        }];
        let results = extract_results("m2", &blocks);
        assert_eq!(results[0].id, "t9#result");
        assert_eq!(results[0].output, ToolOutput::Error("line1\nline2".to_string()));
        assert!(results[0].output.success().is_none());
    }
}
