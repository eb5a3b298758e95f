use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lines longer than this are treated as malformed and skipped.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const MODEL_MARKER: &str = "**Model:**";
const STARTED_MARKER: &str = "**Started:**";

#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Token counts reported for a single transcript record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Tokens occupying the context window for this request.
    pub fn context_size(&self) -> u64 {
        self.input
            .saturating_add(self.cache_creation)
            .saturating_add(self.cache_read)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: String,
    pub role: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

impl MessageEvent {
    /// Only the message role counts; a record typed `assistant` without a
    /// role does not move the context peak.
    pub fn is_assistant(&self) -> bool {
        self.role.as_deref() == Some("assistant")
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.map(|usage| usage.total).unwrap_or(0)
    }
}

/// Parses one transcript line. Blank and unrecognized lines yield `Ok(None)`;
/// a line that looks like JSON but does not decode is an error.
pub fn parse_line(line: &str) -> Result<Option<MessageEvent>, LineError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.starts_with('{') {
        let parsed: Value = serde_json::from_str(trimmed)?;
        return Ok(parse_json_record(&parsed));
    }
    Ok(parse_markdown_line(trimmed))
}

fn parse_json_record(record: &Value) -> Option<MessageEvent> {
    let event = MessageEvent {
        timestamp: str_at(record, &["timestamp"]).and_then(|ts| parse_utc_timestamp(&ts)),
        kind: str_at(record, &["type"]).unwrap_or_default(),
        role: str_at(record, &["message", "role"]).filter(|role| !role.is_empty()),
        usage: extract_usage(record),
        model: extract_model(record),
    };

    let meaningful = event.timestamp.is_some() || !event.kind.is_empty() || event.total_tokens() > 0;
    meaningful.then_some(event)
}

fn parse_markdown_line(line: &str) -> Option<MessageEvent> {
    if line.starts_with("### User") {
        return Some(markdown_message("user"));
    }
    if line.starts_with("### Assistant") {
        return Some(markdown_message("assistant"));
    }
    if let Some(value) = marker_value(line, MODEL_MARKER) {
        return Some(MessageEvent {
            kind: "model_info".to_string(),
            model: normalize_model_name(value),
            ..MessageEvent::default()
        });
    }
    if let Some(value) = marker_value(line, STARTED_MARKER)
        && let Some(started) = parse_utc_timestamp(value)
    {
        return Some(MessageEvent {
            timestamp: Some(started),
            kind: "session_start".to_string(),
            ..MessageEvent::default()
        });
    }
    None
}

fn markdown_message(role: &str) -> MessageEvent {
    MessageEvent {
        kind: "message".to_string(),
        role: Some(role.to_string()),
        ..MessageEvent::default()
    }
}

fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let start = line.find(marker)? + marker.len();
    let value = line[start..].trim();
    (!value.is_empty()).then_some(value)
}

fn extract_usage(record: &Value) -> Option<TokenUsage> {
    for path in [
        &["usage"][..],
        &["message", "usage"][..],
        &["response", "usage"][..],
    ] {
        if let Some(usage) = value_at(record, path).and_then(usage_from_object) {
            return Some(usage);
        }
    }

    let total = match record.get("total_tokens")? {
        Value::String(text) => text.trim().parse::<u64>().ok()?,
        other => count_value(other)?,
    };
    Some(TokenUsage {
        total,
        ..TokenUsage::default()
    })
}

fn usage_from_object(usage: &Value) -> Option<TokenUsage> {
    if !usage.is_object() {
        return None;
    }
    let input = count_at(usage, "input_tokens");
    let output = count_at(usage, "output_tokens");
    let cache_creation = count_at(usage, "cache_creation_input_tokens");
    let cache_read = count_at(usage, "cache_read_input_tokens");
    let explicit_total = count_at(usage, "total_tokens");

    if [input, output, cache_creation, cache_read, explicit_total]
        .iter()
        .all(Option::is_none)
    {
        return None;
    }

    let mut parsed = TokenUsage {
        input: input.unwrap_or(0),
        output: output.unwrap_or(0),
        cache_creation: cache_creation.unwrap_or(0),
        cache_read: cache_read.unwrap_or(0),
        total: 0,
    };
    parsed.total = explicit_total.unwrap_or_else(|| {
        parsed
            .input
            .saturating_add(parsed.output)
            .saturating_add(parsed.cache_creation)
            .saturating_add(parsed.cache_read)
    });
    Some(parsed)
}

fn extract_model(record: &Value) -> Option<String> {
    let from_assistant = (str_at(record, &["type"]).as_deref() == Some("assistant"))
        .then(|| str_at(record, &["message", "model"]))
        .flatten();

    let raw = from_assistant
        .or_else(|| str_at(record, &["model"]))
        .or_else(|| str_at(record, &["request", "model"]))
        .or_else(|| str_at(record, &["metadata", "model"]))
        .or_else(|| str_at(record, &["message", "model"]))?;
    normalize_model_name(&raw)
}

/// Maps raw model identifiers onto the short family names used for
/// capacity lookups.
pub fn normalize_model_name(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    match raw {
        "opusplan" => return Some("claude-opus-4-1".to_string()),
        "sonnet" => return Some("claude-sonnet-4".to_string()),
        "haiku" => return Some("claude-haiku-4".to_string()),
        _ => {}
    }

    let stripped = strip_date_suffix(raw);
    let family = if stripped.contains("claude-opus-4-1") {
        "claude-4.1-opus"
    } else if stripped.contains("claude-sonnet-4") {
        "claude-4-sonnet"
    } else if stripped.contains("claude-3.5-sonnet") {
        "claude-3.5-sonnet"
    } else if stripped.contains("claude-3.5-haiku") {
        "claude-3.5-haiku"
    } else {
        stripped
    };
    Some(family.to_string())
}

fn strip_date_suffix(model: &str) -> &str {
    let Some((head, tail)) = model.rsplit_once('-') else {
        return model;
    };
    if tail.len() == 8 && tail.chars().all(|ch| ch.is_ascii_digit()) {
        head
    } else {
        model
    }
}

pub(crate) fn parse_utc_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    Some(cursor)
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    value_at(value, path)?.as_str().map(|s| s.to_string())
}

fn count_at(value: &Value, key: &str) -> Option<u64> {
    count_value(value.get(key)?)
}

fn count_value(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    if let Some(n) = value.as_i64() {
        return Some(n.max(0) as u64);
    }
    let float = value.as_f64()?;
    if !float.is_finite() {
        return None;
    }
    Some(float.max(0.0) as u64)
}
