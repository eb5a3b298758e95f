use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::analyzer::AnalyzerError;
use crate::metrics::{ConsumptionTotals, SessionMetrics, context_usage};
use crate::parser::{MAX_LINE_BYTES, MessageEvent, parse_line};

/// Sliding window of recent events kept for rate calculations.
pub const MAX_MESSAGE_HISTORY: usize = 100;
pub const DEFAULT_TAIL_BYTES: u64 = 64 * 1024;

/// State carried over from the previous pass over the same transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSeed {
    pub offset: u64,
    pub base_tokens: u64,
    pub consumption: ConsumptionTotals,
    pub session_start_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub model_name: Option<String>,
    pub total_event_count: u64,
    /// Events already in the rate window, up to `MAX_MESSAGE_HISTORY`.
    pub recent_events: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalScan {
    pub metrics: SessionMetrics,
    pub new_offset: u64,
    pub recent_events: u64,
}

#[derive(Debug, Clone)]
pub struct Processor {
    effective_window: u64,
    tail_bytes: u64,
}

impl Processor {
    pub fn new(effective_window: u64, tail_bytes: u64) -> Self {
        Self {
            effective_window,
            tail_bytes,
        }
    }

    /// Reads everything appended after `last_offset`, starting from a peak of
    /// `base_tokens`.
    pub fn process_incremental(
        &self,
        path: &Path,
        last_offset: u64,
        base_tokens: u64,
    ) -> Result<IncrementalScan, AnalyzerError> {
        let seed = ScanSeed {
            offset: last_offset,
            base_tokens,
            ..ScanSeed::default()
        };
        self.resume(path, &seed)
    }

    pub fn resume(&self, path: &Path, seed: &ScanSeed) -> Result<IncrementalScan, AnalyzerError> {
        let mut file = File::open(path).map_err(|source| AnalyzerError::io(path, source))?;
        let file_len = file
            .metadata()
            .map_err(|source| AnalyzerError::io(path, source))?
            .len();

        let reset;
        let seed = if seed.offset > file_len {
            debug!(
                path = %path.display(),
                offset = seed.offset,
                file_len,
                "transcript shrank below stored offset; rescanning from start"
            );
            reset = ScanSeed::default();
            &reset
        } else {
            seed
        };

        file.seek(SeekFrom::Start(seed.offset))
            .map_err(|source| AnalyzerError::io(path, source))?;
        let mut reader = BufReader::new(file);
        let mut accumulator = ScanAccumulator::from_seed(seed);
        let consumed = scan_lines(&mut reader, &mut accumulator)
            .map_err(|source| AnalyzerError::io(path, source))?;
        let recent_events = accumulator.window_len() as u64;

        Ok(IncrementalScan {
            metrics: accumulator.finish(seed.base_tokens, self.effective_window),
            new_offset: seed.offset + consumed,
            recent_events,
        })
    }

    /// Processes only the tail of a transcript with fresh counters.
    pub fn tail(&self, path: &Path) -> Result<SessionMetrics, AnalyzerError> {
        let mut file = File::open(path).map_err(|source| AnalyzerError::io(path, source))?;
        let file_len = file
            .metadata()
            .map_err(|source| AnalyzerError::io(path, source))?
            .len();
        let start = file_len.saturating_sub(self.tail_bytes);
        file.seek(SeekFrom::Start(start))
            .map_err(|source| AnalyzerError::io(path, source))?;

        let mut reader = BufReader::new(file);
        if start > 0 {
            skip_rest_of_line(&mut reader).map_err(|source| AnalyzerError::io(path, source))?;
        }
        let mut accumulator = ScanAccumulator::default();
        scan_lines(&mut reader, &mut accumulator)
            .map_err(|source| AnalyzerError::io(path, source))?;
        Ok(accumulator.finish(0, self.effective_window))
    }
}

#[derive(Debug, Default)]
struct ScanAccumulator {
    history: VecDeque<MessageEvent>,
    carried_history: usize,
    consumption: ConsumptionTotals,
    peak_context: u64,
    new_tokens: u64,
    session_start_at: Option<DateTime<Utc>>,
    last_message_at: Option<DateTime<Utc>>,
    model_name: Option<String>,
    total_events: u64,
}

impl ScanAccumulator {
    fn from_seed(seed: &ScanSeed) -> Self {
        Self {
            consumption: seed.consumption,
            peak_context: seed.base_tokens,
            session_start_at: seed.session_start_at,
            last_message_at: seed.last_message_at,
            model_name: seed.model_name.clone(),
            total_events: seed.total_event_count,
            carried_history: (seed.recent_events as usize).min(MAX_MESSAGE_HISTORY),
            ..Self::default()
        }
    }

    fn apply(&mut self, event: MessageEvent) {
        if let Some(ts) = event.timestamp {
            if self.session_start_at.is_none_or(|start| ts < start) {
                self.session_start_at = Some(ts);
            }
            if self.last_message_at.is_none_or(|last| ts > last) {
                self.last_message_at = Some(ts);
            }
        }

        if let Some(usage) = event.usage {
            self.new_tokens = self.new_tokens.saturating_add(usage.total);
            self.consumption.add(&usage);
            if event.is_assistant() {
                self.peak_context = self.peak_context.max(usage.context_size());
            }
        }

        if let Some(model) = event.model.as_ref() {
            self.model_name = Some(model.clone());
        }

        self.total_events += 1;
        self.history.push_back(event);
        while self.window_len() > MAX_MESSAGE_HISTORY {
            if self.carried_history > 0 {
                self.carried_history -= 1;
            } else {
                self.history.pop_front();
            }
        }
    }

    /// Events from earlier passes still count toward the rate window.
    fn window_len(&self) -> usize {
        self.carried_history + self.history.len()
    }

    fn finish(self, base_tokens: u64, window: u64) -> SessionMetrics {
        let total_tokens = if self.peak_context > 0 {
            self.peak_context
        } else {
            base_tokens.saturating_add(self.new_tokens)
        };

        let elapsed_seconds = match (self.session_start_at, self.last_message_at) {
            (Some(start), Some(last)) => (last - start).num_seconds().max(0) as u64,
            _ => 0,
        };
        let messages_per_minute = if elapsed_seconds > 0 {
            self.window_len() as f64 / (elapsed_seconds as f64 / 60.0)
        } else {
            0.0
        };

        let context_tokens = if self.peak_context > 0 {
            self.peak_context
        } else {
            total_tokens
        };
        let (context_utilization, pressure_level) =
            context_usage(context_tokens, self.model_name.as_deref(), window);

        SessionMetrics {
            total_tokens,
            max_context_size: self.peak_context,
            model_name: self.model_name,
            context_utilization,
            pressure_level,
            elapsed_seconds,
            messages_per_minute,
            total_event_count: self.total_events,
            session_start_at: self.session_start_at,
            last_message_at: self.last_message_at,
            total_consumption_tokens: self.consumption.total(),
            consumption: self.consumption,
        }
    }
}

/// Feeds complete lines to the accumulator and returns the number of bytes
/// consumed. An unterminated trailing line is only consumed when it decodes
/// to an event; otherwise it is re-read once the writer finishes it.
fn scan_lines<R: BufRead>(reader: &mut R, accumulator: &mut ScanAccumulator) -> io::Result<u64> {
    let mut consumed = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .by_ref()
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }

        let terminated = buf.last() == Some(&b'\n');
        if !terminated && read > MAX_LINE_BYTES {
            let line_bytes = read as u64 + skip_rest_of_line(reader)?;
            debug!(bytes = line_bytes, "skipping oversized transcript line");
            consumed += line_bytes;
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        match parse_line(&line) {
            Ok(Some(event)) => accumulator.apply(event),
            Ok(None) if !terminated => {
                debug!("leaving unterminated trailing line for the next pass");
                break;
            }
            Ok(None) => {}
            Err(err) if !terminated => {
                debug!(error = %err, "leaving incomplete trailing record for the next pass");
                break;
            }
            Err(err) => debug!(error = %err, "skipping malformed transcript line"),
        }
        consumed += read as u64;
    }
    Ok(consumed)
}

fn skip_rest_of_line<R: BufRead>(reader: &mut R) -> io::Result<u64> {
    let mut skipped = 0u64;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(skipped);
        }
        if let Some(pos) = available.iter().position(|byte| *byte == b'\n') {
            reader.consume(pos + 1);
            return Ok(skipped + pos as u64 + 1);
        }
        let len = available.len();
        reader.consume(len);
        skipped += len as u64;
    }
}
