//! Persistence layer (§4.11)
//!
//! Owns a single JSON document containing registered stations, meters, the
//! site constraints topology, shedding thresholds, and per-station
//! fail-safe configuration. Loaded once at startup (missing file is not
//! fatal); saved after every mutation that touches persisted fields and on
//! graceful shutdown.

use crate::error::Result;
use crate::logging::get_logger;
use crate::types::PersistedDocument;
use std::path::{Path, PathBuf};

pub struct PersistenceManager {
    file_path: PathBuf,
    document: PersistedDocument,
    logger: crate::logging::StructuredLogger,
}

impl PersistenceManager {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            document: PersistedDocument::default(),
            logger: get_logger("persistence"),
        }
    }

    /// Load the document from disk. A missing file is not an error — it
    /// means a fresh deployment starting from defaults.
    pub fn load(&mut self) -> Result<()> {
        let path: &Path = self.file_path.as_path();
        if !path.exists() {
            self.logger
                .info("no persistent state file found, starting from defaults");
            return Ok(());
        }
        let contents = std::fs::read_to_string(path)?;
        self.document = serde_json::from_str(&contents)?;
        self.logger.info("loaded persistent state from disk");
        Ok(())
    }

    /// Serialize the current document to disk (append-and-replace).
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.document)?;
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.file_path, contents)?;
        self.logger.debug("saved persistent state to disk");
        Ok(())
    }

    pub fn document(&self) -> &PersistedDocument {
        &self.document
    }

    /// Replace the document, typically with a fresh export from the State
    /// Store, ahead of a `save()` call.
    pub fn set_document(&mut self, document: PersistedDocument) {
        self.document = document;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_fatal() {
        let mut manager = PersistenceManager::new("/tmp/dlm_test_nonexistent_12345.json");
        assert!(manager.load().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut manager = PersistenceManager::new(path.clone());
        manager.document.shedding.level = 2;
        manager.save().unwrap();

        let mut reloaded = PersistenceManager::new(path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.document().shedding.level, 2);
    }
}
