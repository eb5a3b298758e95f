use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parser::TokenUsage;

/// Autocompaction in Claude Code kicks in around this many context tokens.
pub const DEFAULT_EFFECTIVE_CONTEXT_WINDOW: u64 = 155_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl PressureLevel {
    pub fn from_utilization(percent: f64) -> Self {
        if !percent.is_finite() || percent < 0.0 {
            return Self::Unknown;
        }
        if percent >= 90.0 {
            Self::Critical
        } else if percent >= 80.0 {
            Self::High
        } else if percent >= 60.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the utilization percentage and band for a context size. Without a
/// context size or a known model the band is unknown.
pub fn context_usage(context_tokens: u64, model: Option<&str>, window: u64) -> (f64, PressureLevel) {
    let has_model = model.is_some_and(|name| !name.trim().is_empty());
    if context_tokens == 0 || !has_model || window == 0 {
        return (0.0, PressureLevel::Unknown);
    }
    let percent = context_tokens as f64 / window as f64 * 100.0;
    (percent, PressureLevel::from_utilization(percent))
}

/// Running ccusage-style consumption totals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ConsumptionTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl ConsumptionTotals {
    pub fn add(&mut self, usage: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.input);
        self.output_tokens = self.output_tokens.saturating_add(usage.output);
        self.cache_creation_tokens = self.cache_creation_tokens.saturating_add(usage.cache_creation);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(usage.cache_read);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_tokens)
            .saturating_add(self.cache_read_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SessionMetrics {
    /// Peak context size when known, otherwise accumulated token totals.
    pub total_tokens: u64,
    pub max_context_size: u64,
    pub model_name: Option<String>,
    #[serde(rename = "context_utilization_percentage")]
    pub context_utilization: f64,
    pub pressure_level: PressureLevel,
    pub elapsed_seconds: u64,
    pub messages_per_minute: f64,
    pub total_event_count: u64,
    pub session_start_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub consumption: ConsumptionTotals,
    pub total_consumption_tokens: u64,
}

impl SessionMetrics {
    pub fn is_valid(&self) -> bool {
        self.context_utilization.is_finite()
            && self.context_utilization >= 0.0
            && self.messages_per_minute.is_finite()
            && self.messages_per_minute >= 0.0
    }
}

/// Collects per-invocation processing figures for the event pipeline.
pub trait MetricsCollector {
    fn record_event(&mut self, event_name: &str, elapsed: Duration);
    fn record_error(&mut self, event_name: &str, kind: &str);
}

#[derive(Debug, Default)]
pub struct ProcessingStats {
    events_processed: u64,
    total_latency: Duration,
    errors: BTreeMap<String, u64>,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors.get(kind).copied().unwrap_or(0)
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.events_processed == 0 {
            return 0.0;
        }
        self.total_latency.as_secs_f64() * 1000.0 / self.events_processed as f64
    }
}

impl MetricsCollector for ProcessingStats {
    fn record_event(&mut self, event_name: &str, elapsed: Duration) {
        self.events_processed += 1;
        self.total_latency += elapsed;
        debug!(
            event = event_name,
            elapsed_ms = elapsed.as_millis() as u64,
            average_ms = self.average_latency_ms(),
            "event processed"
        );
    }

    fn record_error(&mut self, event_name: &str, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
        debug!(event = event_name, kind, "event processing error recorded");
    }
}
