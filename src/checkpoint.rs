//! Ingestion checkpoint store.
//!
//! A single JSON file at `{db_root}/.checkpoint.json` recording which
//! document hashes finished, the last stage reached, and the failure list.
//! The checkpoint is advisory: the stage cache is authoritative for LLM
//! cost avoidance, and a hash present here without a cache entry is
//! re-processed.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const CHECKPOINT_FILE: &str = ".checkpoint.json";
const CHECKPOINT_VERSION: u32 = 1;

/// Coarse pipeline phase recorded in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Documents,
    Concepts,
    Summaries,
    Complete,
}

impl Default for IngestStage {
    fn default() -> Self {
        IngestStage::Documents
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "processedHashes")]
    pub processed_hashes: Vec<String>,
    pub stage: IngestStage,
    #[serde(rename = "lastFile")]
    pub last_file: Option<String>,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(rename = "totalProcessed")]
    pub total_processed: u64,
    #[serde(rename = "totalFailed")]
    pub total_failed: u64,
    #[serde(rename = "failedFiles")]
    pub failed_files: Vec<String>,
    pub version: u32,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            processed_hashes: Vec::new(),
            stage: IngestStage::Documents,
            last_file: None,
            last_updated_at: Utc::now(),
            total_processed: 0,
            total_failed: 0,
            failed_files: Vec::new(),
            version: CHECKPOINT_VERSION,
        }
    }
}

impl Checkpoint {
    pub fn contains(&self, hash: &str) -> bool {
        self.processed_hashes.iter().any(|h| h == hash)
    }

    pub fn record_processed(&mut self, hash: &str, file: &str) {
        if !self.contains(hash) {
            self.processed_hashes.push(hash.to_string());
        }
        self.last_file = Some(file.to_string());
        self.last_updated_at = Utc::now();
        self.total_processed += 1;
    }

    pub fn record_failed(&mut self, file: &str) {
        if !self.failed_files.iter().any(|f| f == file) {
            self.failed_files.push(file.to_string());
        }
        self.last_updated_at = Utc::now();
        self.total_failed += 1;
    }
}

/// File-backed checkpoint with atomic writes.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn open(db_root: &Path) -> Self {
        Self {
            path: db_root.join(CHECKPOINT_FILE),
        }
    }

    /// Load the checkpoint, or a fresh one when the file is missing or
    /// unreadable.
    pub fn load(&self) -> Checkpoint {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Checkpoint::default(),
        }
    }

    /// Persist via temp file + rename.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| EngineError::Fatal("checkpoint path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;

        let tmp = parent.join(".checkpoint.json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| EngineError::Dependency(format!("checkpoint rename: {}", e)))?;
        Ok(())
    }

    /// Remove the checkpoint file entirely.
    pub fn clean(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_returns_default() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path());
        let cp = store.load();
        assert!(cp.processed_hashes.is_empty());
        assert_eq!(cp.stage, IngestStage::Documents);
        assert_eq!(cp.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn save_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path());
        let mut cp = Checkpoint::default();
        cp.record_processed("hash1", "/docs/a.pdf");
        cp.record_processed("hash2", "/docs/b.pdf");
        cp.record_failed("/docs/broken.pdf");
        cp.stage = IngestStage::Complete;
        store.save(&cp).unwrap();

        let loaded = store.load();
        assert!(loaded.contains("hash1"));
        assert!(loaded.contains("hash2"));
        assert!(!loaded.contains("hash3"));
        assert_eq!(loaded.stage, IngestStage::Complete);
        assert_eq!(loaded.total_processed, 2);
        assert_eq!(loaded.total_failed, 1);
        assert_eq!(loaded.failed_files, vec!["/docs/broken.pdf"]);
    }

    #[test]
    fn record_processed_is_idempotent_on_hashes() {
        let mut cp = Checkpoint::default();
        cp.record_processed("h", "/a");
        cp.record_processed("h", "/a");
        assert_eq!(cp.processed_hashes.len(), 1);
    }

    #[test]
    fn clean_removes_file() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path());
        store.save(&Checkpoint::default()).unwrap();
        store.clean().unwrap();
        // Second clean on a missing file is fine.
        store.clean().unwrap();
        assert!(store.load().processed_hashes.is_empty());
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CHECKPOINT_FILE), "not json").unwrap();
        let store = CheckpointStore::open(tmp.path());
        assert!(store.load().processed_hashes.is_empty());
    }
}
