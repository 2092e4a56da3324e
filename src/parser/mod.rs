//! Line-delimited JSON parser
//!
//! Turns the full content of one log file into typed records. Parsing never
//! fails as a whole: every bad line becomes a [`LineError`] and the remaining
//! lines are still parsed.

mod record;

pub use record::{parse_timestamp, ContentBlock, Record, RecordKind};

use serde_json::Value;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// A line that could not be turned into a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    /// 1-based line number
    pub line_number: usize,
    pub reason: String,
}

/// Result of parsing one file
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub records: Vec<Record>,
    pub errors: Vec<LineError>,
}

impl ParsedFile {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }
}

/// Parse the full current content of a file
pub fn parse_content(bytes: &[u8]) -> ParsedFile {
    let bytes = bytes.strip_prefix(BOM).unwrap_or(bytes);
    let ends_with_newline = bytes.last() == Some(&b'\n');

    let mut parsed = ParsedFile::default();
    let mut lines = bytes.split(|b| *b == b'\n').enumerate().peekable();

    while let Some((index, raw)) = lines.next() {
        let line_number = index + 1;
        // A line with no terminating newline may still be being written.
        let is_trailing = lines.peek().is_none() && !ends_with_newline;

        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(e) => {
                parsed.errors.push(LineError {
                    line_number,
                    reason: format!("invalid utf-8: {}", e),
                });
                continue;
            }
        };

        if text.trim().is_empty() {
            continue;
        }

        match parse_line(line_number, text) {
            Ok(record) => parsed.records.push(record),
            Err(reason) => {
                let reason = if is_trailing {
                    format!("truncated trailing line: {}", reason)
                } else {
                    reason
                };
                parsed.errors.push(LineError {
                    line_number,
                    reason,
                });
            }
        }
    }

    parsed
}

fn parse_line(line_number: usize, text: &str) -> Result<Record, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    match value {
        Value::Object(body) => Ok(Record::new(line_number, body, text)),
        other => Err(format!("expected a JSON object, found {}", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
