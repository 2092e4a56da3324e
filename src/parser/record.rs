//! Typed view over one parsed log line

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Record discriminator, taken from the `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Assistant,
    Summary,
    System,
    /// Anything else, kept as-is so nothing is dropped at parse time
    Other(String),
}

impl RecordKind {
    pub fn classify(value: Option<&str>) -> Self {
        match value {
            Some("user") => RecordKind::User,
            Some("assistant") => RecordKind::Assistant,
            Some("summary") => RecordKind::Summary,
            Some("system") => RecordKind::System,
            Some(other) => RecordKind::Other(other.to_string()),
            None => RecordKind::Other("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordKind::User => "user",
            RecordKind::Assistant => "assistant",
            RecordKind::Summary => "summary",
            RecordKind::System => "system",
            RecordKind::Other(s) => s,
        }
    }
}

/// One successfully parsed line
#[derive(Debug, Clone)]
pub struct Record {
    /// 1-based line number in the source file
    pub line_number: usize,
    pub kind: RecordKind,
    pub timestamp: Option<DateTime<Utc>>,
    /// The full JSON object
    pub body: Map<String, Value>,
    /// Raw line text, used for deterministic id synthesis
    pub raw: String,
}

impl Record {
    pub fn new(line_number: usize, body: Map<String, Value>, raw: &str) -> Self {
        let kind = RecordKind::classify(body.get("type").and_then(|v| v.as_str()));
        let timestamp = body.get("timestamp").and_then(parse_timestamp);
        Self {
            line_number,
            kind,
            timestamp,
            body,
            raw: raw.to_string(),
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// The nested `message` object, if any
    pub fn message(&self) -> Option<&Map<String, Value>> {
        self.body.get("message").and_then(|v| v.as_object())
    }

    pub fn message_str(&self, key: &str) -> Option<&str> {
        self.message()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Content blocks of the message. A plain string content becomes a single text block.
    pub fn content_blocks(&self) -> Vec<ContentBlock<'_>> {
        let content = self
            .message()
            .and_then(|m| m.get("content"))
            .or_else(|| self.body.get("content"));

        match content {
            Some(Value::String(s)) => vec![ContentBlock::Text(s.as_str())],
            Some(Value::Array(items)) => items.iter().map(ContentBlock::from_value).collect(),
            _ => Vec::new(),
        }
    }
}

/// Borrowed view of one content block
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock<'a> {
    Text(&'a str),
    ToolUse {
        id: Option<&'a str>,
        name: &'a str,
        input: Option<&'a Value>,
    },
    ToolResult {
        tool_use_id: &'a str,
        content: Option<&'a Value>,
        is_error: bool,
    },
    Image {
        media_type: Option<&'a str>,
        byte_len: Option<usize>,
    },
    Other(&'a Value),
}

impl<'a> ContentBlock<'a> {
    fn from_value(value: &'a Value) -> Self {
        let Some(obj) = value.as_object() else {
            return match value.as_str() {
                Some(s) => ContentBlock::Text(s),
                None => ContentBlock::Other(value),
            };
        };
        let block_type = obj.get("type").and_then(|v| v.as_str());

        match block_type {
            Some("text") => match obj.get("text").and_then(|v| v.as_str()) {
                Some(text) => ContentBlock::Text(text),
                None => ContentBlock::Other(value),
            },
            Some("tool_use") => ContentBlock::ToolUse {
                id: obj.get("id").and_then(|v| v.as_str()),
                name: obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown"),
                input: obj.get("input"),
            },
            Some("image") => {
                let source = obj.get("source").and_then(|v| v.as_object());
                ContentBlock::Image {
                    media_type: source
                        .and_then(|s| s.get("media_type"))
                        .and_then(|v| v.as_str()),
                    byte_len: source
                        .and_then(|s| s.get("data"))
                        .and_then(|v| v.as_str())
                        .map(str::len),
                }
            }
            // Result blocks are matched on shape, not only on the declared type:
            // anything carrying a `tool_use_id` answers an invocation.
            _ => match obj.get("tool_use_id").and_then(|v| v.as_str()) {
                Some(tool_use_id) if block_type.is_none() || block_type == Some("tool_result") => {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content: obj.get("content"),
                        is_error: obj
                            .get("is_error")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    }
                }
                _ => ContentBlock::Other(value),
            },
        }
    }
}

/// RFC 3339 string, or an integer taken as epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
