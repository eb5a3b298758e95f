use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "IRRLICHT_LOG";
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Installs the global subscriber. Hooks share stderr with Claude Code, so the
/// default level is quiet and a log file can be configured instead.
pub fn setup_tracing(logging: &LoggingConfig) {
    let default_level = logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_file = logging.file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });

    match log_file {
        Some(file) => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .without_time()
                .try_init();
        }
    }
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Last path component of a working directory, ignoring roots and `.`.
pub fn project_name_from_cwd(cwd: &Path) -> Option<String> {
    let name = cwd.file_name()?.to_string_lossy().trim().to_string();
    (!name.is_empty() && name != "." && name != "/").then_some(name)
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let head: String = input.chars().take(max_chars - 3).collect();
    format!("{head}...")
}
