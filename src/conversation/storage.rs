use std::collections::HashMap;
use std::path::PathBuf;

use log::debug;

use crate::conversation::error::ConversationError;

/// Keyed string store holding one JSON blob per key.
pub trait StateStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConversationError>;
    fn set(&mut self, key: &str, value: String) -> Result<(), ConversationError>;
}

/// In-process store. The engine's default.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConversationError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), ConversationError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Directory-backed store: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ConversationError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(ConversationError::Storage(format!("invalid storage key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConversationError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        debug!("Reading saved state from {}", path.display());
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), ConversationError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        debug!("Writing saved state to {}", path.display());
        std::fs::write(path, value)?;
        Ok(())
    }
}
