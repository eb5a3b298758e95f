use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::event::is_valid_session_id;
use crate::session::{InvalidSession, Session};

const LOCK_DIR: &str = ".locks";
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(15);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode session record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode session record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("timed out after {timeout:?} waiting for the lock on session {session_id}")]
    LockTimeout {
        session_id: String,
        timeout: Duration,
    },
    #[error(transparent)]
    Invalid(#[from] InvalidSession),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persistence for session records, one record per session id.
pub trait SessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    fn save(&self, session: &Session) -> Result<(), StoreError>;
    /// Returns whether a record was removed.
    fn delete(&self, session_id: &str) -> Result<bool, StoreError>;
    fn list(&self) -> Result<Vec<Session>, StoreError>;
    /// Serializes read-modify-write cycles on one session across processes.
    fn lock(&self, session_id: &str) -> Result<SessionLock, StoreError>;
}

/// Exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        ensure_session_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::io(dir, source))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.record_path(session_id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        let session = serde_json::from_str(&raw)
            .map_err(|source| StoreError::Decode { path, source })?;
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.record_path(&session.session_id)?;
        session.validate()?;
        self.ensure_dir(&self.dir)?;

        let payload = serde_json::to_vec_pretty(session).map_err(StoreError::Encode)?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|source| StoreError::io(&self.dir, source))?;
        tmp.write_all(&payload)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|source| StoreError::io(tmp.path(), source))?;
        tmp.persist(&path)
            .map_err(|err| StoreError::io(&path, err.error))?;
        debug!(session_id = %session.session_id, path = %path.display(), "session saved");
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    fn list(&self) -> Result<Vec<Session>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some("json")
            {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.load(session_id) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => warn!(error = %err, path = %path.display(), "skipping unreadable session record"),
            }
        }

        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    fn lock(&self, session_id: &str) -> Result<SessionLock, StoreError> {
        ensure_session_id(session_id)?;
        let lock_dir = self.dir.join(LOCK_DIR);
        self.ensure_dir(&lock_dir)?;
        let lock_path = lock_dir.join(format!("{session_id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StoreError::io(&lock_path, source))?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(SessionLock { file }),
                Err(_) if Instant::now() < deadline => thread::sleep(LOCK_RETRY_INTERVAL),
                Err(_) => {
                    return Err(StoreError::LockTimeout {
                        session_id: session_id.to_string(),
                        timeout: self.lock_timeout,
                    });
                }
            }
        }
    }
}

fn ensure_session_id(session_id: &str) -> Result<(), StoreError> {
    if is_valid_session_id(session_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}
