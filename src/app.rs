use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::analyzer::TranscriptAnalyzer;
use crate::config::{self, DisableSource, HookConfig};
use crate::event::{EventKind, HookEvent, MAX_PAYLOAD_BYTES};
use crate::git::{CommandGit, GitProbe};
use crate::metrics::{MetricsCollector, ProcessingStats};
use crate::session::{NEW_SESSION_MODEL, Session};
use crate::state::{SessionState, transition};
use crate::store::{FileSessionStore, SessionStore, StoreError};
use crate::util::{format_tokens, human_duration, truncate, unix_now};

/// What happened to the session record for one hook event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(DisableSource),
    Deleted { removed: bool },
    Updated(Box<Session>),
}

/// Applies hook events to persisted sessions: state machine, metadata merge,
/// transcript analysis and the final save, all under the session's lock.
pub struct EventProcessor<S, G, M> {
    store: S,
    analyzer: TranscriptAnalyzer,
    git: G,
    stats: M,
    disabled: Option<DisableSource>,
}

impl<S, G, M> EventProcessor<S, G, M>
where
    S: SessionStore,
    G: GitProbe,
    M: MetricsCollector,
{
    pub fn new(store: S, analyzer: TranscriptAnalyzer, git: G, stats: M) -> Self {
        Self {
            store,
            analyzer,
            git,
            stats,
            disabled: None,
        }
    }

    pub fn with_disabled(mut self, disabled: Option<DisableSource>) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> &M {
        &self.stats
    }

    pub fn process(&mut self, event: &HookEvent) -> Result<Outcome> {
        let started = Instant::now();
        if let Some(source) = self.disabled {
            info!(
                event = %event.hook_event_name,
                session_id = %event.session_id,
                disabled_by = source.describe(),
                "processing disabled; skipping event"
            );
            return Ok(Outcome::Skipped(source));
        }

        let kind = event.validate().context("invalid hook event")?;
        let name = kind.as_str();
        let session_id = event.session_id.as_str();
        debug!(event = name, session_id, "processing event");

        let _lock = self
            .store
            .lock(session_id)
            .with_context(|| format!("failed to lock session {session_id}"))?;

        let existing = match self.store.load(session_id) {
            Ok(existing) => existing,
            Err(StoreError::Decode { path, source }) => {
                warn!(
                    session_id,
                    path = %path.display(),
                    error = %source,
                    "discarding unreadable session record"
                );
                None
            }
            Err(err) => {
                self.stats.record_error(name, "load");
                return Err(err).with_context(|| format!("failed to load session {session_id}"));
            }
        };

        if kind == EventKind::SessionEnd {
            let reason = event.reason().unwrap_or_default();
            let removed = match self.store.delete(session_id) {
                Ok(removed) => removed,
                Err(err) => {
                    self.stats.record_error(name, "delete");
                    return Err(err)
                        .with_context(|| format!("failed to delete session {session_id}"));
                }
            };
            info!(session_id, reason = %reason, removed, "session ended; record deleted");
            self.stats.record_event(name, started.elapsed());
            return Ok(Outcome::Deleted { removed });
        }

        let now = unix_now();
        let previous_state = existing.as_ref().map(|session| session.state);
        let next = transition(
            name,
            &event.matcher,
            &event.source,
            existing.as_ref().map(|session| session.compaction_state),
        );
        info!(
            session_id,
            event = name,
            from = previous_state.map_or("none", SessionState::as_str),
            to = next.state.as_str(),
            compaction = next.compaction.as_str(),
            reason = next.reason.as_str(),
            "state transition"
        );

        let mut session = existing.unwrap_or_else(|| Session::new(session_id, now));
        session.apply_transition(&next, name, &event.matcher, now);
        self.merge_metadata(&mut session, event, kind);

        if session.transcript_path.is_some() {
            match self.analyzer.compute_incremental(&mut session) {
                Ok(Some(metrics)) => session.metrics = Some(metrics),
                Ok(None) => {}
                Err(err) => {
                    warn!(session_id, error = %err, "transcript analysis failed; keeping previous metrics");
                    self.stats.record_error(name, "transcript");
                }
            }
        }

        let transcript_size = session
            .transcript_path
            .as_deref()
            .and_then(|path| self.analyzer.transcript_size(path));
        session.track_waiting(previous_state, transcript_size, now);
        session.sanitize();

        if let Err(err) = self.store.save(&session) {
            self.stats.record_error(name, "save");
            return Err(err).with_context(|| format!("failed to save session {session_id}"));
        }
        self.stats.record_event(name, started.elapsed());
        Ok(Outcome::Updated(Box::new(session)))
    }

    /// Direct event fields win over the legacy `data` map; absent values
    /// leave the stored metadata untouched.
    fn merge_metadata(&self, session: &mut Session, event: &HookEvent, kind: EventKind) {
        if let Some(model) = event.model() {
            session.model = Some(model);
        }
        if let Some(cwd) = event.cwd() {
            session.set_cwd(cwd);
        }
        if let Some(project) = event.project_name() {
            session.project_name = Some(project);
        }
        if let Some(path) = event.transcript_path() {
            if session.transcript_path.as_ref() != Some(&path) {
                session.processing_state = None;
            }
            session.transcript_path = Some(path);
        }
        if let Some(cwd) = session.cwd.as_deref()
            && let Some(branch) = self.git.current_branch(cwd)
        {
            session.git_branch = Some(branch);
        }
        if kind == EventKind::SessionStart && event.source == "clear" {
            session.model = Some(NEW_SESSION_MODEL.to_string());
        }
    }
}

/// Hook mode: one event from stdin, processed against the configured store.
pub fn run_hook(config: &HookConfig) -> Result<()> {
    if let Some(source) = config.processing_disabled() {
        debug!(disabled_by = source.describe(), "processing disabled; ignoring hook input");
        return Ok(());
    }

    let mut raw = Vec::new();
    io::stdin()
        .lock()
        .take(MAX_PAYLOAD_BYTES as u64 + 1)
        .read_to_end(&mut raw)
        .context("failed to read hook event from stdin")?;
    let event = HookEvent::from_slice(&raw)
        .context("failed to decode hook event")?
        .sanitized();

    let store = FileSessionStore::new(config.instances_dir(), config.lock_timeout());
    let analyzer = TranscriptAnalyzer::new(config.transcript.clone());
    let mut processor = EventProcessor::new(store, analyzer, CommandGit, ProcessingStats::new());
    processor.process(&event)?;
    Ok(())
}

pub fn print_status(config: &HookConfig, session_id: Option<&str>) -> Result<u8> {
    let store = FileSessionStore::new(config.instances_dir(), config.lock_timeout());
    let now = unix_now();

    if let Some(session_id) = session_id {
        let Some(session) = store
            .load(session_id)
            .with_context(|| format!("failed to load session {session_id}"))?
        else {
            println!("session {session_id} not found in {}", store.dir().display());
            return Ok(1);
        };
        print_session(&session, now);
        return Ok(0);
    }

    let sessions = store.list().context("failed to list sessions")?;
    println!("irrlicht-hook status");
    println!("config: {}", config::config_path().display());
    println!("instances_dir: {}", store.dir().display());
    match config.processing_disabled() {
        Some(source) => println!("processing: disabled ({})", source.describe()),
        None => println!("processing: enabled"),
    }
    println!(
        "effective_context_window: {}",
        format_tokens(config.transcript.effective_context_window)
    );
    println!("sessions: {}", sessions.len());
    for session in &sessions {
        print_session(session, now);
    }
    Ok(0)
}

/// Full-scan analysis of a transcript tail, printed as JSON.
pub fn analyze(config: &HookConfig, path: &Path) -> Result<()> {
    let analyzer = TranscriptAnalyzer::new(config.transcript.clone());
    if !analyzer.is_transcript_valid(path) {
        bail!(
            "transcript {} is missing, not a regular file, or larger than {} bytes",
            path.display(),
            config.transcript.max_file_bytes
        );
    }
    let metrics = analyzer
        .analyze_full(path)
        .with_context(|| format!("failed to analyze {}", path.display()))?;
    let rendered = serde_json::to_string_pretty(&metrics)?;
    println!("{rendered}");
    Ok(())
}

pub fn doctor(config: &HookConfig) -> Result<u8> {
    let mut issues = 0u8;
    let config_path = config::config_path();
    let instances_dir = config.instances_dir();

    println!("irrlicht-hook doctor");
    println!("config_path: {}", config_path.display());
    println!("instances_dir: {}", instances_dir.display());

    if config_path.is_file() {
        println!("[OK] Config file present.");
    } else {
        issues += 1;
        println!("[WARN] Config file missing and could not be created.");
    }

    match instances_dir_writable(&instances_dir) {
        Ok(()) => println!("[OK] Instances directory writable."),
        Err(err) => {
            issues += 1;
            println!("[WARN] Instances directory not writable: {err:#}");
        }
    }

    let store = FileSessionStore::new(&instances_dir, config.lock_timeout());
    match store.list() {
        Ok(sessions) => println!("[OK] {} stored session(s) readable.", sessions.len()),
        Err(err) => {
            issues += 1;
            println!("[WARN] Failed to list stored sessions: {err}");
        }
    }

    if command_available("git") {
        println!("[OK] git command available.");
    } else {
        issues += 1;
        println!("[WARN] git command not found in PATH (branch names will be missing).");
    }

    match config.processing_disabled() {
        Some(source) => println!("[INFO] Event processing disabled via {}.", source.describe()),
        None => println!("[OK] Event processing enabled."),
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn print_session(session: &Session, now: i64) {
    println!(
        "- {} [{}] compaction={}",
        session.session_id, session.state, session.compaction_state
    );
    if let Some(project) = &session.project_name {
        println!("  project: {project}");
    }
    if let Some(cwd) = &session.cwd {
        println!("  path: {}", cwd.display());
    }
    println!(
        "  model: {}",
        truncate(session.model.as_deref().unwrap_or("unknown"), 60)
    );
    println!(
        "  branch: {}",
        session.git_branch.as_deref().unwrap_or("n/a")
    );
    println!(
        "  events: {} (last: {})",
        session.event_count,
        if session.last_event.is_empty() {
            "n/a"
        } else {
            session.last_event.as_str()
        }
    );
    if let Some(metrics) = &session.metrics {
        println!(
            "  context: {} tokens ({:.1}%, {})",
            format_tokens(metrics.total_tokens),
            metrics.context_utilization,
            metrics.pressure_level
        );
        println!(
            "  consumed: {} (in {} | out {} | cache write {} | cache read {})",
            format_tokens(metrics.total_consumption_tokens),
            format_tokens(metrics.consumption.input_tokens),
            format_tokens(metrics.consumption.output_tokens),
            format_tokens(metrics.consumption.cache_creation_tokens),
            format_tokens(metrics.consumption.cache_read_tokens),
        );
    } else {
        println!("  context: n/a");
    }
    if session.is_waiting()
        && let Some(since) = session.waiting_start_time
    {
        println!("  waiting for: {}", elapsed_since(since, now));
    }
    println!("  updated: {} ago", elapsed_since(session.updated_at, now));
}

fn elapsed_since(then: i64, now: i64) -> String {
    human_duration(Duration::from_secs(now.saturating_sub(then).max(0) as u64))
}

fn instances_dir_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a file in {}", dir.display()))?;
    Ok(())
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
