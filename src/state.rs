use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Working,
    Waiting,
    Ready,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompactionState {
    #[default]
    NotCompacting,
    Compacting,
    PostCompact,
}

impl CompactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotCompacting => "not_compacting",
            Self::Compacting => "compacting",
            Self::PostCompact => "post_compact",
        }
    }
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    SimpleMapping,
    SessionAfterClear,
    SessionResumed,
    SessionStartup,
    SessionStartNew,
    CompactionStarted,
    CompactionCompleted,
    CompactionStateResetOnUserInput,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SimpleMapping => "simple_mapping",
            Self::SessionAfterClear => "session_after_clear",
            Self::SessionResumed => "session_resumed",
            Self::SessionStartup => "session_startup",
            Self::SessionStartNew => "session_start_new",
            Self::CompactionStarted => "compaction_started",
            Self::CompactionCompleted => "compaction_completed",
            Self::CompactionStateResetOnUserInput => "compaction_state_reset_on_user_input",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: SessionState,
    pub compaction: CompactionState,
    pub reason: TransitionReason,
}

/// Decides the next session state from a hook event and the prior compaction
/// state. Compaction state carries over unless the event changes it.
pub fn transition(
    event_name: &str,
    matcher: &str,
    source: &str,
    prior_compaction: Option<CompactionState>,
) -> Transition {
    let kind = EventKind::from_name(event_name);
    let mut next = Transition {
        state: baseline_state(kind),
        compaction: prior_compaction.unwrap_or_default(),
        reason: TransitionReason::SimpleMapping,
    };

    match kind {
        Some(EventKind::SessionStart) => return session_start(matcher, source),
        Some(EventKind::PreCompact) => {
            next.state = SessionState::Working;
            next.compaction = CompactionState::Compacting;
            next.reason = TransitionReason::CompactionStarted;
        }
        Some(EventKind::PostCompact) => {
            next.state = SessionState::Working;
            next.compaction = CompactionState::PostCompact;
            next.reason = TransitionReason::CompactionCompleted;
        }
        Some(EventKind::UserPromptSubmit) if next.compaction == CompactionState::PostCompact => {
            next.compaction = CompactionState::NotCompacting;
            next.reason = TransitionReason::CompactionStateResetOnUserInput;
        }
        _ => {}
    }
    next
}

fn baseline_state(kind: Option<EventKind>) -> SessionState {
    match kind {
        Some(EventKind::Notification) => SessionState::Waiting,
        Some(EventKind::Stop | EventKind::SubagentStop | EventKind::SessionEnd) => {
            SessionState::Ready
        }
        _ => SessionState::Working,
    }
}

fn session_start(matcher: &str, source: &str) -> Transition {
    let (state, reason) = if source == "clear" {
        (SessionState::Ready, TransitionReason::SessionAfterClear)
    } else {
        match matcher {
            "resume" => (SessionState::Working, TransitionReason::SessionResumed),
            "startup" => (SessionState::Ready, TransitionReason::SessionStartup),
            _ => (SessionState::Ready, TransitionReason::SessionStartNew),
        }
    };
    Transition {
        state,
        compaction: CompactionState::NotCompacting,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(event: &str, prior: Option<CompactionState>) -> Transition {
        transition(event, "", "", prior)
    }

    #[test]
    fn baseline_mapping() {
        for event in ["UserPromptSubmit", "PreToolUse", "PostToolUse", "SomethingNew"] {
            let next = step(event, None);
            assert_eq!(next.state, SessionState::Working, "{event}");
            assert_eq!(next.reason, TransitionReason::SimpleMapping, "{event}");
        }
        assert_eq!(step("Notification", None).state, SessionState::Waiting);
        for event in ["Stop", "SubagentStop", "SessionEnd"] {
            assert_eq!(step(event, None).state, SessionState::Ready, "{event}");
        }
    }

    #[test]
    fn session_start_variants() {
        let clear = transition("SessionStart", "resume", "clear", Some(CompactionState::Compacting));
        assert_eq!(clear.state, SessionState::Ready);
        assert_eq!(clear.compaction, CompactionState::NotCompacting);
        assert_eq!(clear.reason, TransitionReason::SessionAfterClear);

        let resume = transition("SessionStart", "resume", "", Some(CompactionState::PostCompact));
        assert_eq!(resume.state, SessionState::Working);
        assert_eq!(resume.compaction, CompactionState::NotCompacting);
        assert_eq!(resume.reason, TransitionReason::SessionResumed);

        let startup = transition("SessionStart", "startup", "", None);
        assert_eq!(startup.state, SessionState::Ready);
        assert_eq!(startup.reason, TransitionReason::SessionStartup);

        let plain = transition("SessionStart", "", "", Some(CompactionState::Compacting));
        assert_eq!(plain.state, SessionState::Ready);
        assert_eq!(plain.compaction, CompactionState::NotCompacting);
        assert_eq!(plain.reason, TransitionReason::SessionStartNew);
    }

    #[test]
    fn compaction_lifecycle() {
        let started = step("PreCompact", None);
        assert_eq!(started.state, SessionState::Working);
        assert_eq!(started.compaction, CompactionState::Compacting);
        assert_eq!(started.reason, TransitionReason::CompactionStarted);

        let tool = step("PreToolUse", Some(started.compaction));
        assert_eq!(tool.compaction, CompactionState::Compacting);

        let done = step("PostCompact", Some(tool.compaction));
        assert_eq!(done.state, SessionState::Working);
        assert_eq!(done.compaction, CompactionState::PostCompact);
        assert_eq!(done.reason, TransitionReason::CompactionCompleted);

        let stop = step("Stop", Some(done.compaction));
        assert_eq!(stop.state, SessionState::Ready);
        assert_eq!(stop.compaction, CompactionState::PostCompact);

        let prompt = step("UserPromptSubmit", Some(stop.compaction));
        assert_eq!(prompt.state, SessionState::Working);
        assert_eq!(prompt.compaction, CompactionState::NotCompacting);
        assert_eq!(prompt.reason, TransitionReason::CompactionStateResetOnUserInput);
    }

    #[test]
    fn user_prompt_without_post_compact_is_plain() {
        let next = step("UserPromptSubmit", Some(CompactionState::Compacting));
        assert_eq!(next.compaction, CompactionState::Compacting);
        assert_eq!(next.reason, TransitionReason::SimpleMapping);
    }

    #[test]
    fn serialized_names() {
        assert_eq!(
            serde_json::to_value(CompactionState::PostCompact).expect("serialize"),
            "post_compact"
        );
        assert_eq!(
            serde_json::to_value(SessionState::Waiting).expect("serialize"),
            "waiting"
        );
        assert_eq!(
            TransitionReason::CompactionStateResetOnUserInput.to_string(),
            "compaction_state_reset_on_user_input"
        );
    }
}
