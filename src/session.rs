use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{is_valid_session_id, sanitize_string};
use crate::metrics::{ConsumptionTotals, SessionMetrics};
use crate::processor::ScanSeed;
use crate::state::{CompactionState, SessionState, Transition};
use crate::util::project_name_from_cwd;

pub const SESSION_RECORD_VERSION: u32 = 1;
pub const CONFIDENCE_HIGH: &str = "high";
pub const NEW_SESSION_MODEL: &str = "New Session";
const MAX_TEXT_LEN: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session record: {0}")]
pub struct InvalidSession(pub String);

/// Per-transcript resume point persisted between hook invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProcessingCursor {
    pub last_processed_offset: u64,
    pub cumulative_tokens: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub transcript_checksum: Option<String>,
    pub checksum_bytes: Option<u64>,
    pub consumption: ConsumptionTotals,
    pub session_start_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub model_name: Option<String>,
    pub total_event_count: u64,
    pub recent_event_count: u64,
}

impl ProcessingCursor {
    pub fn seed(&self) -> ScanSeed {
        ScanSeed {
            offset: self.last_processed_offset,
            base_tokens: self.cumulative_tokens,
            consumption: self.consumption,
            session_start_at: self.session_start_at,
            last_message_at: self.last_message_at,
            model_name: self.model_name.clone(),
            total_event_count: self.total_event_count,
            recent_events: self.recent_event_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default = "record_version")]
    pub version: u32,
    pub session_id: String,
    pub state: SessionState,
    #[serde(default)]
    pub compaction_state: CompactionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub first_seen: i64,
    pub updated_at: i64,
    #[serde(default = "default_confidence")]
    pub confidence: String,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub last_event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_matcher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SessionMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transcript_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_state: Option<ProcessingCursor>,
}

fn record_version() -> u32 {
    SESSION_RECORD_VERSION
}

fn default_confidence() -> String {
    CONFIDENCE_HIGH.to_string()
}

impl Session {
    pub fn new(session_id: &str, now: i64) -> Self {
        Self {
            version: SESSION_RECORD_VERSION,
            session_id: session_id.to_string(),
            state: SessionState::Ready,
            compaction_state: CompactionState::NotCompacting,
            model: None,
            cwd: None,
            transcript_path: None,
            git_branch: None,
            project_name: None,
            first_seen: now,
            updated_at: now,
            confidence: default_confidence(),
            event_count: 0,
            last_event: String::new(),
            last_matcher: None,
            metrics: None,
            last_transcript_size: None,
            waiting_start_time: None,
            processing_state: None,
        }
    }

    /// Records one processed hook event.
    pub fn apply_transition(&mut self, transition: &Transition, event_name: &str, matcher: &str, now: i64) {
        self.state = transition.state;
        self.compaction_state = transition.compaction;
        self.last_event = event_name.to_string();
        if !matcher.is_empty() {
            self.last_matcher = Some(matcher.to_string());
        }
        self.event_count += 1;
        self.updated_at = now.max(self.first_seen);
    }

    pub fn set_cwd(&mut self, cwd: PathBuf) {
        if let Some(name) = project_name_from_cwd(&cwd) {
            self.project_name = Some(name);
        }
        self.cwd = Some(cwd);
    }

    /// Starts waiting-state bookkeeping on entry to `waiting` and clears it
    /// when the session goes back to work.
    pub fn track_waiting(&mut self, previous: Option<SessionState>, transcript_size: Option<u64>, now: i64) {
        match (previous, self.state) {
            (prev, SessionState::Waiting) if prev != Some(SessionState::Waiting) => {
                if let Some(size) = transcript_size {
                    self.waiting_start_time = Some(now);
                    self.last_transcript_size = Some(size);
                }
            }
            (Some(SessionState::Waiting), SessionState::Working) => {
                self.waiting_start_time = None;
                self.last_transcript_size = None;
            }
            _ => {}
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.state == SessionState::Waiting && self.waiting_start_time.is_some()
    }

    pub fn sanitize(&mut self) {
        for text in [
            &mut self.model,
            &mut self.git_branch,
            &mut self.project_name,
            &mut self.last_matcher,
        ] {
            if let Some(value) = text.as_mut() {
                *value = bounded(sanitize_string(value));
            }
            if text.as_deref().is_some_and(str::is_empty) {
                *text = None;
            }
        }
        self.last_event = bounded(sanitize_string(&self.last_event));
    }

    pub fn validate(&self) -> Result<(), InvalidSession> {
        if !is_valid_session_id(&self.session_id) {
            return Err(InvalidSession(format!(
                "session id {:?} must be 1-100 characters of [A-Za-z0-9_-]",
                self.session_id
            )));
        }
        if self.first_seen <= 0 {
            return Err(InvalidSession(format!(
                "invalid first_seen timestamp {}",
                self.first_seen
            )));
        }
        if self.updated_at < self.first_seen {
            return Err(InvalidSession(
                "updated_at cannot be before first_seen".to_string(),
            ));
        }
        for (field, path) in [
            ("transcript_path", self.transcript_path.as_deref()),
            ("cwd", self.cwd.as_deref()),
        ] {
            if let Some(path) = path {
                validate_stored_path(field, path)?;
            }
        }
        if let Some(metrics) = &self.metrics
            && !metrics.is_valid()
        {
            return Err(InvalidSession("metrics contain invalid values".to_string()));
        }
        Ok(())
    }
}

fn validate_stored_path(field: &str, path: &Path) -> Result<(), InvalidSession> {
    if path.to_string_lossy().contains('\0') {
        return Err(InvalidSession(format!("{field} contains NUL byte")));
    }
    if !path.is_absolute() {
        return Err(InvalidSession(format!(
            "{field} must be absolute: {}",
            path.display()
        )));
    }
    Ok(())
}

fn bounded(mut text: String) -> String {
    if text.len() > MAX_TEXT_LEN {
        let mut cut = MAX_TEXT_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{TransitionReason, transition};

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn new_session_defaults() {
        let session = Session::new("abc", NOW);
        assert_eq!(session.event_count, 0);
        assert_eq!(session.confidence, "high");
        assert_eq!(session.first_seen, NOW);
        assert_eq!(session.updated_at, NOW);
        assert_eq!(session.compaction_state, CompactionState::NotCompacting);
    }

    #[test]
    fn apply_transition_counts_events_and_keeps_last_matcher() {
        let mut session = Session::new("abc", NOW);
        let next = transition("PreToolUse", "Bash", "", None);
        session.apply_transition(&next, "PreToolUse", "Bash", NOW + 5);
        assert_eq!(session.event_count, 1);
        assert_eq!(session.last_matcher.as_deref(), Some("Bash"));
        assert_eq!(session.updated_at, NOW + 5);

        let stop = transition("Stop", "", "", Some(session.compaction_state));
        session.apply_transition(&stop, "Stop", "", NOW + 6);
        assert_eq!(session.event_count, 2);
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(session.last_event, "Stop");
        assert_eq!(session.last_matcher.as_deref(), Some("Bash"));
        assert_eq!(stop.reason, TransitionReason::SimpleMapping);
    }

    #[test]
    fn cwd_sets_project_name() {
        let mut session = Session::new("abc", NOW);
        session.set_cwd(PathBuf::from("/home/dev/irrlicht"));
        assert_eq!(session.project_name.as_deref(), Some("irrlicht"));
        session.set_cwd(PathBuf::from("/"));
        assert_eq!(session.project_name.as_deref(), Some("irrlicht"));
        assert_eq!(session.cwd.as_deref(), Some(Path::new("/")));
    }

    #[test]
    fn waiting_tracking_starts_and_clears() {
        let mut session = Session::new("abc", NOW);
        session.state = SessionState::Waiting;
        session.track_waiting(Some(SessionState::Working), Some(4096), NOW + 1);
        assert!(session.is_waiting());
        assert_eq!(session.last_transcript_size, Some(4096));

        session.track_waiting(Some(SessionState::Waiting), Some(9999), NOW + 2);
        assert_eq!(session.waiting_start_time, Some(NOW + 1));

        session.state = SessionState::Working;
        session.track_waiting(Some(SessionState::Waiting), None, NOW + 3);
        assert!(!session.is_waiting());
        assert_eq!(session.waiting_start_time, None);
        assert_eq!(session.last_transcript_size, None);
    }

    #[test]
    fn waiting_without_transcript_records_nothing() {
        let mut session = Session::new("abc", NOW);
        session.state = SessionState::Waiting;
        session.track_waiting(None, None, NOW);
        assert_eq!(session.waiting_start_time, None);
    }

    #[test]
    fn validation_rules() {
        let mut session = Session::new("abc", NOW);
        assert_eq!(session.validate(), Ok(()));

        session.transcript_path = Some(PathBuf::from("relative.jsonl"));
        assert!(session.validate().is_err());
        session.transcript_path = Some(PathBuf::from("/abs.jsonl"));

        session.updated_at = NOW - 1;
        assert!(session.validate().is_err());
        session.updated_at = NOW;

        session.metrics = Some(SessionMetrics {
            context_utilization: f64::NAN,
            ..SessionMetrics::default()
        });
        assert!(session.validate().is_err());
        session.metrics = None;

        session.session_id = "bad/id".to_string();
        assert!(session.validate().is_err());
        assert!(Session::new("abc", 0).validate().is_err());
    }

    #[test]
    fn sanitize_cleans_and_bounds_text() {
        let mut session = Session::new("abc", NOW);
        session.model = Some("claude\r\n".to_string());
        session.git_branch = Some("\0".to_string());
        session.project_name = Some("é".repeat(600));
        session.sanitize();
        assert_eq!(session.model.as_deref(), Some("claude"));
        assert_eq!(session.git_branch, None);
        let name = session.project_name.expect("project name");
        assert!(name.len() <= MAX_TEXT_LEN);
        assert!(name.chars().all(|ch| ch == 'é'));
    }

    #[test]
    fn legacy_record_without_optional_fields_loads() {
        let raw = r#"{"session_id":"abc","state":"working","first_seen":1,"updated_at":2}"#;
        let session: Session = serde_json::from_str(raw).expect("decode");
        assert_eq!(session.version, SESSION_RECORD_VERSION);
        assert_eq!(session.compaction_state, CompactionState::NotCompacting);
        assert_eq!(session.confidence, "high");
        assert!(session.processing_state.is_none());
    }

    #[test]
    fn cursor_seed_carries_counters() {
        let cursor = ProcessingCursor {
            last_processed_offset: 10,
            cumulative_tokens: 20,
            total_event_count: 3,
            recent_event_count: 3,
            model_name: Some("claude-4-sonnet".to_string()),
            ..ProcessingCursor::default()
        };
        let seed = cursor.seed();
        assert_eq!(seed.offset, 10);
        assert_eq!(seed.base_tokens, 20);
        assert_eq!(seed.total_event_count, 3);
        assert_eq!(seed.recent_events, 3);
        assert_eq!(seed.model_name.as_deref(), Some("claude-4-sonnet"));
    }
}
