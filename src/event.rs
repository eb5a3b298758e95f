use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;
pub const MAX_SESSION_ID_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    Notification,
    PreToolUse,
    PostToolUse,
    PreCompact,
    PostCompact,
    Stop,
    SubagentStop,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        Self::SessionStart,
        Self::SessionEnd,
        Self::UserPromptSubmit,
        Self::Notification,
        Self::PreToolUse,
        Self::PostToolUse,
        Self::PreCompact,
        Self::PostCompact,
        Self::Stop,
        Self::SubagentStop,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Notification => "Notification",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PreCompact => "PreCompact",
            Self::PostCompact => "PostCompact",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("failed to decode hook event: {0}")]
    Decode(String),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("invalid session_id {0:?}")]
    InvalidSessionId(String),
    #[error("invalid {field}: {message}")]
    InvalidPath { field: &'static str, message: String },
    #[error("payload size {size} exceeds maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Hook payload as delivered on stdin. String fields tolerate `null` and
/// non-string values, which read as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub hook_event_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub matcher: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub transcript_path: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub permission_mode: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, deserialize_with = "lenient_map", skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HookEvent {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(EventError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        serde_json::from_slice(bytes).map_err(|err| EventError::Decode(err.to_string()))
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_name(&self.hook_event_name)
    }

    pub fn cwd(&self) -> Option<PathBuf> {
        self.field_or_data(&self.cwd, "cwd").map(PathBuf::from)
    }

    pub fn transcript_path(&self) -> Option<PathBuf> {
        self.field_or_data(&self.transcript_path, "transcript_path")
            .map(PathBuf::from)
    }

    pub fn model(&self) -> Option<String> {
        self.field_or_data(&self.model, "model")
    }

    pub fn reason(&self) -> Option<String> {
        self.field_or_data(&self.reason, "reason")
    }

    /// Only legacy payloads carry this, inside `data`.
    pub fn project_name(&self) -> Option<String> {
        self.field_or_data("", "project_name")
    }

    fn field_or_data(&self, direct: &str, key: &str) -> Option<String> {
        if !direct.is_empty() {
            return Some(direct.to_string());
        }
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Strips control characters from every string field, including nested
    /// `data` values.
    pub fn sanitized(mut self) -> Self {
        for field in [
            &mut self.hook_event_name,
            &mut self.session_id,
            &mut self.timestamp,
            &mut self.matcher,
            &mut self.reason,
            &mut self.source,
            &mut self.model,
            &mut self.permission_mode,
        ] {
            *field = sanitize_string(field);
        }
        self.transcript_path = self.transcript_path.replace('\0', "");
        self.cwd = self.cwd.replace('\0', "");
        self.data = sanitize_map(std::mem::take(&mut self.data));
        self
    }

    pub fn validate(&self) -> Result<EventKind, EventError> {
        if self.hook_event_name.is_empty() {
            return Err(EventError::Missing("hook_event_name"));
        }
        if self.session_id.is_empty() {
            return Err(EventError::Missing("session_id"));
        }
        let kind = self
            .kind()
            .ok_or_else(|| EventError::UnknownEvent(self.hook_event_name.clone()))?;
        if !is_valid_session_id(&self.session_id) {
            return Err(EventError::InvalidSessionId(self.session_id.clone()));
        }

        if let Some(path) = self.transcript_path() {
            validate_path(&path).map_err(|message| EventError::InvalidPath {
                field: "transcript_path",
                message,
            })?;
        }
        if let Some(path) = self.cwd() {
            validate_path(&path).map_err(|message| EventError::InvalidPath {
                field: "cwd",
                message,
            })?;
        }

        let size = serde_json::to_vec(self)
            .map_err(|err| EventError::Decode(err.to_string()))?
            .len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(EventError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(kind)
    }
}

pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// Absolute, NUL-free, and without `..` components.
pub fn validate_path(path: &Path) -> Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("path is empty".to_string());
    }
    if path.to_string_lossy().contains('\0') {
        return Err("path contains NUL byte".to_string());
    }
    if !path.is_absolute() {
        return Err(format!("path must be absolute: {}", path.display()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("path traversal not allowed: {}", path.display()));
    }
    Ok(())
}

pub fn sanitize_string(input: &str) -> String {
    input
        .replace(['\0', '\r'], "")
        .replace('\n', " ")
        .trim()
        .to_string()
}

fn sanitize_map(data: Map<String, Value>) -> Map<String, Value> {
    data.into_iter()
        .map(|(key, value)| (sanitize_string(&key), sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_string(&text)),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => other,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => text,
        _ => String::new(),
    })
}

fn lenient_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> HookEvent {
        HookEvent::from_slice(json.as_bytes()).expect("decode event")
    }

    #[test]
    fn decodes_claude_payload() {
        let ev = event(
            r#"{"hook_event_name":"SessionStart","session_id":"abc-123","transcript_path":"/tmp/t.jsonl","cwd":"/work/app","source":"startup","matcher":"startup","unknown_field":1}"#,
        );
        assert_eq!(ev.validate(), Ok(EventKind::SessionStart));
        assert_eq!(ev.cwd(), Some(PathBuf::from("/work/app")));
        assert_eq!(ev.transcript_path(), Some(PathBuf::from("/tmp/t.jsonl")));
        assert_eq!(ev.source, "startup");
        assert_eq!(ev.extra.get("unknown_field"), Some(&Value::from(1)));
    }

    #[test]
    fn null_and_odd_types_read_as_empty() {
        let ev = event(r#"{"hook_event_name":"Stop","session_id":"s1","model":{"id":"x"},"data":null,"cwd":null}"#);
        assert!(ev.model.is_empty());
        assert!(ev.data.is_empty());
        assert_eq!(ev.cwd(), None);
        assert_eq!(ev.validate(), Ok(EventKind::Stop));
    }

    #[test]
    fn data_map_is_a_fallback_for_direct_fields() {
        let ev = event(
            r#"{"hook_event_name":"Stop","session_id":"s1","model":"direct","data":{"model":"nested","cwd":"/from/data","reason":"logout","transcript_path":"/t.jsonl"}}"#,
        );
        assert_eq!(ev.model().as_deref(), Some("direct"));
        assert_eq!(ev.cwd(), Some(PathBuf::from("/from/data")));
        assert_eq!(ev.reason().as_deref(), Some("logout"));
        assert_eq!(ev.transcript_path(), Some(PathBuf::from("/t.jsonl")));
        assert_eq!(ev.project_name(), None);

        let legacy = event(r#"{"hook_event_name":"Stop","session_id":"s1","data":{"project_name":"irrlicht"}}"#);
        assert_eq!(legacy.project_name().as_deref(), Some("irrlicht"));
    }

    #[test]
    fn required_fields_and_known_events() {
        assert_eq!(
            event(r#"{"session_id":"s1"}"#).validate(),
            Err(EventError::Missing("hook_event_name"))
        );
        assert_eq!(
            event(r#"{"hook_event_name":"Stop"}"#).validate(),
            Err(EventError::Missing("session_id"))
        );
        assert_eq!(
            event(r#"{"hook_event_name":"Bogus","session_id":"s1"}"#).validate(),
            Err(EventError::UnknownEvent("Bogus".to_string()))
        );
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn session_id_rules() {
        assert!(is_valid_session_id("a1_B-2"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id("has space"));
        assert!(is_valid_session_id(&"x".repeat(100)));
        assert!(!is_valid_session_id(&"x".repeat(101)));
        assert!(matches!(
            event(r#"{"hook_event_name":"Stop","session_id":"a/b"}"#).validate(),
            Err(EventError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        let relative = event(r#"{"hook_event_name":"Stop","session_id":"s1","cwd":"relative/dir"}"#);
        assert!(matches!(
            relative.validate(),
            Err(EventError::InvalidPath { field: "cwd", .. })
        ));
        let traversal = event(
            r#"{"hook_event_name":"Stop","session_id":"s1","transcript_path":"/tmp/../etc/passwd"}"#,
        );
        assert!(matches!(
            traversal.validate(),
            Err(EventError::InvalidPath {
                field: "transcript_path",
                ..
            })
        ));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let big = vec![b' '; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            HookEvent::from_slice(&big),
            Err(EventError::PayloadTooLarge { .. })
        ));

        let ev = HookEvent {
            hook_event_name: "Stop".to_string(),
            session_id: "s1".to_string(),
            prompt: "p".repeat(MAX_PAYLOAD_BYTES),
            ..HookEvent::default()
        };
        assert!(matches!(ev.validate(), Err(EventError::PayloadTooLarge { .. })));
    }

    #[test]
    fn sanitization_strips_control_characters() {
        assert_eq!(sanitize_string("  a\0b\r\nc  "), "ab c");

        let ev = event(
            r#"{"hook_event_name":" Stop\r\n","session_id":"s1\u0000","data":{"k\n":"v\r","nested":{"x":" y "}}}"#,
        )
        .sanitized();
        assert_eq!(ev.hook_event_name, "Stop");
        assert_eq!(ev.session_id, "s1");
        assert_eq!(ev.data.get("k"), Some(&Value::from("v")));
        assert_eq!(ev.data["nested"]["x"], Value::from("y"));
        assert_eq!(ev.validate(), Ok(EventKind::Stop));
    }
}
