use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TranscriptConfig;
use crate::metrics::SessionMetrics;
use crate::processor::{Processor, ScanSeed};
use crate::session::{ProcessingCursor, Session};

/// Leading bytes hashed to tell a rewritten transcript from an appended one.
pub const CHECKSUM_PREFIX_BYTES: u64 = 1024;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to read transcript {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AnalyzerError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixChecksum {
    pub digest: String,
    pub covered_bytes: u64,
}

/// SHA-256 of the first `limit` bytes of the file (or the whole file when it
/// is shorter).
pub fn prefix_checksum(path: &Path, limit: u64) -> io::Result<PrefixChecksum> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(limit.min(CHECKSUM_PREFIX_BYTES * 4) as usize);
    file.take(limit).read_to_end(&mut buf)?;
    Ok(PrefixChecksum {
        digest: hex_digest(&Sha256::digest(&buf)),
        covered_bytes: buf.len() as u64,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

#[derive(Debug, Clone)]
pub struct TranscriptAnalyzer {
    settings: TranscriptConfig,
    processor: Processor,
}

impl TranscriptAnalyzer {
    pub fn new(settings: TranscriptConfig) -> Self {
        let processor = Processor::new(settings.effective_context_window, settings.tail_bytes);
        Self {
            settings,
            processor,
        }
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// A transcript is analyzable when it exists as a regular file within the
    /// configured size ceiling.
    pub fn is_transcript_valid(&self, path: &Path) -> bool {
        let Ok(metadata) = fs::metadata(path) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        self.settings.max_file_bytes == 0 || metadata.len() <= self.settings.max_file_bytes
    }

    pub fn transcript_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|metadata| metadata.len())
    }

    /// One-shot analysis over the tail of a transcript.
    pub fn analyze_full(&self, path: &Path) -> Result<SessionMetrics, AnalyzerError> {
        self.processor.tail(path)
    }

    /// Advances the session's stored cursor over whatever was appended since
    /// the last call. Returns `Ok(None)` when there is nothing analyzable; the
    /// cursor is only written back on success.
    pub fn compute_incremental(
        &self,
        session: &mut Session,
    ) -> Result<Option<SessionMetrics>, AnalyzerError> {
        let Some(path) = session.transcript_path.clone() else {
            return Ok(None);
        };
        if !self.is_transcript_valid(&path) {
            debug!(
                session_id = %session.session_id,
                path = %path.display(),
                "transcript missing or too large; skipping analysis"
            );
            return Ok(None);
        }

        let prior = session.processing_state.clone().unwrap_or_default();
        let rotated = self.detect_rotation(&path, &prior);
        let seed = if rotated {
            info!(
                session_id = %session.session_id,
                path = %path.display(),
                "transcript rotated; resetting incremental state"
            );
            ScanSeed::default()
        } else {
            prior.seed()
        };

        let scan = self.processor.resume(&path, &seed)?;

        let (checksum, covered) = match prefix_checksum(&path, CHECKSUM_PREFIX_BYTES) {
            Ok(fresh) => (Some(fresh.digest), Some(fresh.covered_bytes)),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to checksum transcript");
                (prior.transcript_checksum.clone(), prior.checksum_bytes)
            }
        };

        session.processing_state = Some(ProcessingCursor {
            last_processed_offset: scan.new_offset,
            cumulative_tokens: scan.metrics.total_tokens,
            last_processed_at: Some(Utc::now()),
            transcript_checksum: checksum,
            checksum_bytes: covered,
            consumption: scan.metrics.consumption,
            session_start_at: scan.metrics.session_start_at,
            last_message_at: scan.metrics.last_message_at,
            model_name: scan.metrics.model_name.clone(),
            total_event_count: scan.metrics.total_event_count,
            recent_event_count: scan.recent_events,
        });
        Ok(Some(scan.metrics))
    }

    fn detect_rotation(&self, path: &Path, prior: &ProcessingCursor) -> bool {
        let Some(stored) = prior.transcript_checksum.as_deref().filter(|s| !s.is_empty()) else {
            return false;
        };
        let covered = prior.checksum_bytes.unwrap_or(CHECKSUM_PREFIX_BYTES);
        match prefix_checksum(path, covered) {
            Ok(current) => {
                let shrank = prior
                    .checksum_bytes
                    .is_some_and(|expected| current.covered_bytes < expected);
                shrank || current.digest != stored
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to checksum transcript");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PressureLevel;
    use std::fs::OpenOptions;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn analyzer() -> TranscriptAnalyzer {
        TranscriptAnalyzer::new(TranscriptConfig::default())
    }

    fn assistant(ts: &str, input: u64, output: u64) -> String {
        format!(
            r#"{{"type":"assistant","timestamp":"{ts}","message":{{"role":"assistant","model":"claude-sonnet-4-20250514","usage":{{"input_tokens":{input},"output_tokens":{output}}}}}}}"#
        ) + "\n"
    }

    fn session_for(path: &Path) -> Session {
        let mut session = Session::new("sess-1", 1_700_000_000);
        session.transcript_path = Some(path.to_path_buf());
        session
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().append(true).open(path).expect("open append");
        file.write_all(text.as_bytes()).expect("append");
    }

    #[test]
    fn checksum_is_hex_sha256_of_prefix() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, "abc").expect("write");
        let sum = prefix_checksum(&path, CHECKSUM_PREFIX_BYTES).expect("checksum");
        assert_eq!(
            sum.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sum.covered_bytes, 3);

        fs::write(&path, "x".repeat(4000)).expect("write");
        let sum = prefix_checksum(&path, CHECKSUM_PREFIX_BYTES).expect("checksum");
        assert_eq!(sum.covered_bytes, CHECKSUM_PREFIX_BYTES);
    }

    #[test]
    fn no_transcript_path_yields_nothing() {
        let mut session = Session::new("sess-1", 1_700_000_000);
        assert!(analyzer().compute_incremental(&mut session).expect("analyze").is_none());
        assert!(session.processing_state.is_none());
    }

    #[test]
    fn missing_or_oversized_transcript_yields_nothing() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        let mut session = session_for(&path);
        assert!(analyzer().compute_incremental(&mut session).expect("analyze").is_none());

        fs::write(&path, assistant("2025-01-01T00:00:00Z", 10, 1)).expect("write");
        let tiny = TranscriptAnalyzer::new(TranscriptConfig {
            max_file_bytes: 8,
            ..TranscriptConfig::default()
        });
        assert!(!tiny.is_transcript_valid(&path));
        assert!(tiny.compute_incremental(&mut session).expect("analyze").is_none());
        assert!(analyzer().is_transcript_valid(&path));
        assert!(!analyzer().is_transcript_valid(tmp.path()));
    }

    #[test]
    fn message_rate_survives_idle_and_growing_calls() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        let body: String = (0..11)
            .map(|minute| assistant(&format!("2025-01-01T00:{minute:02}:00Z"), 10, 1))
            .collect();
        fs::write(&path, body).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        let first = analyzer
            .compute_incremental(&mut session)
            .expect("first")
            .expect("metrics");
        assert!((first.messages_per_minute - 1.1).abs() < 1e-9);
        let cursor = session.processing_state.clone().expect("cursor");
        assert_eq!(cursor.recent_event_count, 11);

        let idle = analyzer
            .compute_incremental(&mut session)
            .expect("idle")
            .expect("metrics");
        assert_eq!(idle.messages_per_minute, first.messages_per_minute);

        append(&path, &assistant("2025-01-01T00:11:00Z", 10, 1));
        let grown = analyzer
            .compute_incremental(&mut session)
            .expect("grown")
            .expect("metrics");
        assert!((grown.messages_per_minute - 12.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn incremental_calls_accumulate_across_invocations() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, assistant("2025-01-01T00:00:00Z", 100, 10)).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        let first = analyzer
            .compute_incremental(&mut session)
            .expect("first")
            .expect("metrics");
        assert_eq!(first.total_tokens, 100);
        let cursor = session.processing_state.clone().expect("cursor");
        assert_eq!(cursor.last_processed_offset, fs::metadata(&path).expect("meta").len());
        assert_eq!(cursor.cumulative_tokens, 100);
        assert!(cursor.transcript_checksum.is_some());

        append(&path, &assistant("2025-01-01T00:00:30Z", 80, 20));
        let second = analyzer
            .compute_incremental(&mut session)
            .expect("second")
            .expect("metrics");
        assert_eq!(second.total_tokens, 100);
        assert_eq!(second.consumption.input_tokens, 180);
        assert_eq!(second.consumption.output_tokens, 30);
        assert_eq!(second.elapsed_seconds, 30);
        assert_eq!(second.model_name.as_deref(), Some("claude-4-sonnet"));
        assert_eq!(second.pressure_level, PressureLevel::Low);
    }

    #[test]
    fn idle_call_returns_same_snapshot() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, assistant("2025-01-01T00:00:00Z", 500, 10)).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        let first = analyzer.compute_incremental(&mut session).expect("first").expect("m");
        let offset = session.processing_state.as_ref().expect("cursor").last_processed_offset;
        let second = analyzer.compute_incremental(&mut session).expect("second").expect("m");
        assert_eq!(second.total_tokens, first.total_tokens);
        assert_eq!(second.consumption, first.consumption);
        assert_eq!(
            session.processing_state.as_ref().expect("cursor").last_processed_offset,
            offset
        );
    }

    #[test]
    fn rewritten_transcript_resets_counters() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        let mut body = String::new();
        for idx in 0..20 {
            body.push_str(&assistant("2025-01-01T00:00:00Z", 50_000 + idx, 1));
        }
        fs::write(&path, &body).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        let first = analyzer.compute_incremental(&mut session).expect("first").expect("m");
        assert_eq!(first.total_tokens, 50_019);

        fs::write(&path, assistant("2025-02-01T00:00:00Z", 10, 1)).expect("rewrite");
        let second = analyzer.compute_incremental(&mut session).expect("second").expect("m");
        assert_eq!(second.total_tokens, 10);
        assert_eq!(second.consumption.input_tokens, 10);
        assert_eq!(second.total_event_count, 1);
    }

    #[test]
    fn rotation_with_same_length_prefix_is_detected() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        let original = assistant("2025-01-01T00:00:00Z", 900, 1).repeat(20);
        fs::write(&path, &original).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        analyzer.compute_incremental(&mut session).expect("first");

        let replacement = assistant("2025-03-01T00:00:00Z", 700, 1).repeat(30);
        fs::write(&path, &replacement).expect("rewrite");
        let metrics = analyzer.compute_incremental(&mut session).expect("second").expect("m");
        assert_eq!(metrics.total_tokens, 700);
        assert_eq!(metrics.total_event_count, 30);
    }

    #[test]
    fn growing_small_transcript_is_not_a_rotation() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, assistant("2025-01-01T00:00:00Z", 10, 1)).expect("write");

        let analyzer = analyzer();
        let mut session = session_for(&path);
        analyzer.compute_incremental(&mut session).expect("first");
        let covered = session
            .processing_state
            .as_ref()
            .and_then(|cursor| cursor.checksum_bytes)
            .expect("covered bytes");
        assert!(covered < CHECKSUM_PREFIX_BYTES);

        append(&path, &assistant("2025-01-01T00:00:05Z", 20, 1));
        let metrics = analyzer.compute_incremental(&mut session).expect("second").expect("m");
        assert_eq!(metrics.total_event_count, 2);
        assert_eq!(metrics.consumption.input_tokens, 30);
    }

    #[test]
    fn analyze_full_uses_fresh_counters() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, assistant("2025-01-01T00:00:00Z", 1234, 5)).expect("write");
        let metrics = analyzer().analyze_full(&path).expect("analyze");
        assert_eq!(metrics.total_tokens, 1234);
        assert_eq!(metrics.total_consumption_tokens, 1239);
    }
}
