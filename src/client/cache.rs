//! The client's single slot for the current access token.
//!
//! `set` is the only mutation and completes before it returns, so every read
//! that follows it sees the new value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Key-value slot holding the current access token. `None` means no session.
pub trait TokenCache: Send + Sync {
    fn get(&self) -> Option<String>;

    /// Replace the slot. The in-process value is always updated; the error
    /// only reports that persisting it failed.
    fn set(&self, token: Option<&str>) -> std::io::Result<()>;
}

fn normalize(token: Option<&str>) -> Option<String> {
    token.filter(|t| !t.is_empty()).map(str::to_string)
}

/// Token cache living for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    slot: Mutex<Option<String>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            slot: Mutex::new(normalize(Some(token))),
        }
    }
}

impl TokenCache for MemoryTokenCache {
    fn get(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, token: Option<&str>) -> std::io::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = normalize(token);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct CacheFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
}

/// Token cache persisted as a small JSON file, surviving restarts.
#[derive(Debug)]
pub struct FileTokenCache {
    path: PathBuf,
    slot: Mutex<Option<String>>,
}

impl FileTokenCache {
    /// Open the cache at `path`. A missing or unreadable file means no session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let token = Self::load(&path);
        Self {
            path,
            slot: Mutex::new(token),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Option<String> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read token cache");
                return None;
            }
        };

        match serde_json::from_slice::<CacheFile>(&content) {
            Ok(file) => normalize(file.access_token.as_deref()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt token cache");
                None
            }
        }
    }

    fn persist(&self, token: Option<&str>) -> std::io::Result<()> {
        let file = CacheFile {
            access_token: token.map(str::to_string),
        };
        let json = serde_json::to_vec(&file)?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl TokenCache for FileTokenCache {
    fn get(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, token: Option<&str>) -> std::io::Result<()> {
        let token = normalize(token);
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = token.clone();
        self.persist(token.as_deref())
    }
}
