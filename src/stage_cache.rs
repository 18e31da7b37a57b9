//! Content-addressed stage cache.
//!
//! One JSON file per document under `{db_root}/.stage-cache/{hash}.json`,
//! holding the LLM outputs (concepts + content overview) and the metadata
//! captured at extraction time. The document hash covers the file bytes, so
//! a renamed or re-ingested identical file reuses its entry and costs zero
//! LLM calls.
//!
//! Writes go through a temp file in the same directory, fsync, then rename,
//! so readers never observe a half-written entry; a torn write from a
//! killed process fails JSON parsing and counts as a miss.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::llm::ExtractedConcepts;
use crate::loader::DocMetadata;

const STAGE_CACHE_DIR: &str = ".stage-cache";

/// Per-document cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCacheEntry {
    /// SHA-256 of the file bytes.
    pub hash: String,
    /// Source path at the time of processing.
    pub source: String,
    #[serde(rename = "processedAt")]
    pub processed_at: DateTime<Utc>,
    pub concepts: ExtractedConcepts,
    #[serde(rename = "contentOverview")]
    pub content_overview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocMetadata>,
}

/// Hit/miss counters for one pipeline invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageCacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl StageCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct StageCache {
    dir: PathBuf,
    ttl: Option<Duration>,
    stats: Mutex<StageCacheStats>,
}

impl StageCache {
    /// Open (and create) the cache directory under `db_root`. A zero
    /// `ttl_days` disables expiry.
    pub fn open(db_root: &Path, ttl_days: u64) -> Result<Self> {
        let dir = db_root.join(STAGE_CACHE_DIR);
        std::fs::create_dir_all(&dir)?;
        let ttl = if ttl_days == 0 {
            None
        } else {
            Some(Duration::from_secs(ttl_days * 24 * 60 * 60))
        };
        Ok(Self {
            dir,
            ttl,
            stats: Mutex::new(StageCacheStats::default()),
        })
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hash))
    }

    /// Whether an intact, unexpired entry exists without counting a lookup.
    pub fn probe(&self, hash: &str) -> bool {
        self.read_entry(hash).is_some()
    }

    /// Fetch the entry for `hash`. Expired and unreadable entries count as
    /// misses.
    pub fn lookup(&self, hash: &str) -> Option<StageCacheEntry> {
        let entry = self.read_entry(hash);
        let mut stats = self.stats.lock().unwrap();
        match entry.is_some() {
            true => stats.hits += 1,
            false => stats.misses += 1,
        }
        entry
    }

    fn read_entry(&self, hash: &str) -> Option<StageCacheEntry> {
        let path = self.entry_path(hash);
        let content = std::fs::read_to_string(&path).ok()?;
        let entry: StageCacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                // Torn write or schema drift; treat as absent.
                warn!(path = %path.display(), error = %e, "discarding unreadable stage-cache entry");
                return None;
            }
        };
        if let Some(ttl) = self.ttl {
            let age = Utc::now().signed_duration_since(entry.processed_at);
            if age.num_seconds() > ttl.as_secs() as i64 {
                debug!(hash, "stage-cache entry expired");
                return None;
            }
        }
        Some(entry)
    }

    /// Atomically persist `entry` under its hash.
    pub fn store(&self, entry: &StageCacheEntry) -> Result<()> {
        let final_path = self.entry_path(&entry.hash);
        let tmp_path = self.dir.join(format!(".{}.tmp", entry.hash));

        let json = serde_json::to_string_pretty(entry)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            EngineError::Dependency(format!("stage-cache rename: {}", e))
        })?;
        Ok(())
    }

    pub fn stats(&self) -> StageCacheStats {
        *self.stats.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::parse_concepts_json;
    use tempfile::TempDir;

    fn entry(hash: &str) -> StageCacheEntry {
        StageCacheEntry {
            hash: hash.to_string(),
            source: "/docs/a.pdf".to_string(),
            processed_at: Utc::now(),
            concepts: parse_concepts_json(
                r#"{"primary_concepts": ["innovation"], "categories": ["Business"]}"#,
            )
            .unwrap(),
            content_overview: "A study of innovation.".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 7).unwrap();
        cache.store(&entry("abc123")).unwrap();

        let found = cache.lookup("abc123").unwrap();
        assert_eq!(found.content_overview, "A study of innovation.");
        assert_eq!(found.concepts.primary_concepts[0].name, "innovation");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 7).unwrap();
        assert!(cache.lookup("nope").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn torn_write_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 7).unwrap();
        std::fs::write(
            tmp.path().join(STAGE_CACHE_DIR).join("bad.json"),
            "{\"hash\": \"bad\", \"trunc",
        )
        .unwrap();
        assert!(cache.lookup("bad").is_none());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 7).unwrap();
        let mut old = entry("old1");
        old.processed_at = Utc::now() - chrono::Duration::days(30);
        cache.store(&old).unwrap();
        assert!(cache.lookup("old1").is_none());
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 0).unwrap();
        let mut old = entry("old2");
        old.processed_at = Utc::now() - chrono::Duration::days(3650);
        cache.store(&old).unwrap();
        assert!(cache.lookup("old2").is_some());
    }

    #[test]
    fn probe_does_not_touch_stats() {
        let tmp = TempDir::new().unwrap();
        let cache = StageCache::open(tmp.path(), 7).unwrap();
        cache.store(&entry("p1")).unwrap();
        assert!(cache.probe("p1"));
        assert!(!cache.probe("p2"));
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }
}
