//! Code persistence keyed by runtime id.
//!
//! Stored values are opaque strings; the only contract is that whatever was
//! last saved under an id comes back from `load`.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::error::StoreError;

pub trait CodeStore: Send + Sync {
    fn load(&self, id: &str) -> Option<String>;
    fn save(&self, id: &str, code: &str) -> Result<(), StoreError>;
}

/// In-process store; survives controller rebuilds but not process restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeStore for MemoryStore {
    fn load(&self, id: &str) -> Option<String> {
        self.entries.read().get(id).cloned()
    }

    fn save(&self, id: &str, code: &str) -> Result<(), StoreError> {
        self.entries.write().insert(id.to_string(), code.to_string());
        Ok(())
    }
}

/// One `<id>.glicol` file per runtime inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Ids are runtime names, but never let one escape the directory
        let file: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.glicol"))
    }
}

impl CodeStore for FileStore {
    fn load(&self, id: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(id)).ok()
    }

    fn save(&self, id: &str, code: &str) -> Result<(), StoreError> {
        let io = |source| StoreError::Io {
            id: id.to_string(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io)?;
        std::fs::write(self.path_for(id), code).map_err(io)
    }
}
