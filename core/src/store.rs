use crate::session::ChatSession;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const STORAGE_BLOB: &str = "chat-storage.json";

/// Local persistence for the session list.
///
/// Everything lives in one named blob holding only `{ "sessions": [...] }`;
/// the active session, errors and connection state are never written.
#[derive(Clone, Debug)]
pub struct SessionStorage {
    path: Option<PathBuf>,
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    sessions: &'a [ChatSession],
}

#[derive(Deserialize)]
struct Persisted {
    #[serde(default)]
    sessions: Vec<ChatSession>,
}

impl SessionStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn in_directory(dir: &Path) -> Self {
        Self::new(dir.join(STORAGE_BLOB))
    }

    /// Storage that keeps nothing between runs.
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<Vec<ChatSession>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read session storage at {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let persisted: Persisted = serde_json::from_str(&contents)
            .with_context(|| format!("invalid session storage at {}", path.display()))?;
        Ok(persisted.sessions)
    }

    pub fn save(&self, sessions: &[ChatSession]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create storage directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_vec_pretty(&PersistedRef { sessions })?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serialized)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}
