use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics::DEFAULT_EFFECTIVE_CONTEXT_WINDOW;
use crate::processor::DEFAULT_TAIL_BYTES;

const CONFIG_SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_MAX_TRANSCRIPT_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;
const MIN_LOCK_TIMEOUT_MS: u64 = 50;
const MIN_TAIL_BYTES: u64 = 1024;

pub const HOME_ENV: &str = "IRRLICHT_HOME";
pub const TEST_DIR_ENV: &str = "IRRLICHT_TEST_DIR";
pub const DISABLED_ENV: &str = "IRRLICHT_DISABLED";
pub const CONTEXT_WINDOW_ENV: &str = "IRRLICHT_CONTEXT_WINDOW";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HookConfig {
    pub schema_version: u32,
    pub disabled: bool,
    pub transcript: TranscriptConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptConfig {
    pub effective_context_window: u64,
    /// Transcripts above this size are not analyzed. Zero disables the limit.
    pub max_file_bytes: u64,
    pub tail_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub instances_dir: Option<PathBuf>,
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableSource {
    Environment,
    Config,
    ClaudeSettings,
}

impl DisableSource {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Environment => "IRRLICHT_DISABLED=1",
            Self::Config => "config disabled flag",
            Self::ClaudeSettings => "hooks.irrlicht.disabled in Claude settings",
        }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            disabled: false,
            transcript: TranscriptConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            effective_context_window: DEFAULT_EFFECTIVE_CONTEXT_WINDOW,
            max_file_bytes: DEFAULT_MAX_TRANSCRIPT_BYTES,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            instances_dir: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl HookConfig {
    pub fn load_or_init() -> Result<Self> {
        let mut cfg = Self::load_from(&config_path())?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Reads the config at `path`, writing defaults when it does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: HookConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let cfg = HookConfig::default();
            cfg.save_to(path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        let window = env_u64(CONTEXT_WINDOW_ENV, 0);
        if window > 0 {
            self.transcript.effective_context_window = window;
        }
    }

    /// Reports why event processing is switched off, if it is.
    pub fn processing_disabled(&self) -> Option<DisableSource> {
        if env::var(DISABLED_ENV).is_ok_and(|value| value.trim() == "1") {
            return Some(DisableSource::Environment);
        }
        if self.disabled {
            return Some(DisableSource::Config);
        }
        if let Some(settings) = claude_settings_path()
            && disabled_in_claude_settings(&settings)
        {
            return Some(DisableSource::ClaudeSettings);
        }
        None
    }

    pub fn instances_dir(&self) -> PathBuf {
        if let Some(test_dir) = env_path(TEST_DIR_ENV) {
            return test_dir.join("instances");
        }
        if let Some(dir) = &self.storage.instances_dir {
            return dir.clone();
        }
        app_dir().join("instances")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.lock_timeout_ms)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self.transcript.effective_context_window == 0 {
            self.transcript.effective_context_window = DEFAULT_EFFECTIVE_CONTEXT_WINDOW;
            changed = true;
        }
        if self.transcript.tail_bytes < MIN_TAIL_BYTES {
            self.transcript.tail_bytes = DEFAULT_TAIL_BYTES;
            changed = true;
        }
        if self.storage.lock_timeout_ms < MIN_LOCK_TIMEOUT_MS {
            self.storage.lock_timeout_ms = MIN_LOCK_TIMEOUT_MS;
            changed = true;
        }
        if self
            .storage
            .instances_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            self.storage.instances_dir = None;
            changed = true;
        }
        if normalize_optional_string(&mut self.logging.level) {
            changed = true;
        }
        if self
            .logging
            .file
            .as_ref()
            .is_some_and(|file| file.as_os_str().is_empty())
        {
            self.logging.file = None;
            changed = true;
        }

        changed
    }
}

pub fn app_dir() -> PathBuf {
    if let Some(custom) = env_path(HOME_ENV) {
        return custom;
    }
    dirs::data_dir()
        .map(|dir| dir.join("Irrlicht"))
        .unwrap_or_else(|| PathBuf::from(".irrlicht"))
}

pub fn config_path() -> PathBuf {
    app_dir().join("config.json")
}

pub fn claude_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

/// True when the Claude settings file carries `hooks.irrlicht.disabled: true`.
/// Missing or unreadable settings never disable processing.
pub fn disabled_in_claude_settings(path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(settings) = serde_json::from_str::<Value>(&raw) else {
        return false;
    };
    settings
        .get("hooks")
        .and_then(|hooks| hooks.get("irrlicht"))
        .and_then(|irrlicht| irrlicht.get("disabled"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}

#[cfg(test)]
pub(crate) fn env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
