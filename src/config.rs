//! Configuration parsing and validation.
//!
//! Concept-RAG is configured via a TOML file (default: `config/crag.toml`).
//! The config defines the database root, embedding and LLM provider
//! settings, pipeline parallelism, cache capacities, and resilience tuning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub caches: CachesConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Database root directory. Holds the table snapshot, the stage cache,
    /// and the checkpoint file.
    pub url: PathBuf,
    #[serde(default)]
    pub tables: TableNames,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: PathBuf::from("./data/db"),
            tables: TableNames::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableNames {
    #[serde(default = "default_catalog_table")]
    pub catalog: String,
    #[serde(default = "default_chunks_table")]
    pub chunks: String,
    #[serde(default = "default_concepts_table")]
    pub concepts: String,
    #[serde(default = "default_categories_table")]
    pub categories: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            catalog: default_catalog_table(),
            chunks: default_chunks_table(),
            concepts: default_concepts_table(),
            categories: default_categories_table(),
        }
    }
}

fn default_catalog_table() -> String {
    "catalog".to_string()
}
fn default_chunks_table() -> String {
    "chunks".to_string()
}
fn default_concepts_table() -> String {
    "concepts".to_string()
}
fn default_categories_table() -> String {
    "categories".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of `simple`, `openai`, `openrouter`, `huggingface`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Prefer a locally-running endpoint when the provider supports one.
    #[serde(default)]
    pub use_local: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            model: default_embedding_model(),
            base_url: None,
            use_local: false,
        }
    }
}

fn default_embedding_provider() -> String {
    "simple".to_string()
}
fn default_embedding_model() -> String {
    "hashed-384".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    #[serde(default = "default_concept_model")]
    pub concept_model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            summary_model: default_summary_model(),
            concept_model: default_concept_model(),
            base_url: default_llm_base_url(),
            api_key: None,
        }
    }
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_concept_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Worker pool size. Defaults to the CPU count.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Cap on the number of documents processed per run.
    #[serde(default)]
    pub max_docs: Option<usize>,
    /// Reuse stage-cache entries instead of re-calling the LLM.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Rebuild tables from scratch, ignoring the existing snapshot.
    #[serde(default)]
    pub overwrite: bool,
    /// Discard the checkpoint before running.
    #[serde(default)]
    pub clean_checkpoint: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            max_docs: None,
            use_cache: true,
            overwrite: false,
            clean_checkpoint: false,
        }
    }
}

fn default_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CachesConfig {
    #[serde(default = "default_embedding_capacity")]
    pub embedding_capacity: usize,
    #[serde(default = "default_search_capacity")]
    pub search_capacity: usize,
    #[serde(default = "default_search_ttl_ms")]
    pub search_ttl_ms: u64,
    #[serde(default = "default_stage_ttl_days")]
    pub stage_ttl_days: u64,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            embedding_capacity: default_embedding_capacity(),
            search_capacity: default_search_capacity(),
            search_ttl_ms: default_search_ttl_ms(),
            stage_ttl_days: default_stage_ttl_days(),
        }
    }
}

fn default_embedding_capacity() -> usize {
    10_000
}
fn default_search_capacity() -> usize {
    1_000
}
fn default_search_ttl_ms() -> u64 {
    5 * 60 * 1000
}
fn default_stage_ttl_days() -> u64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cool_down_ms")]
    pub circuit_breaker_cool_down_ms: u64,
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,
    #[serde(default = "default_embedding_timeout_ms")]
    pub embedding_timeout_ms: u64,
    /// Minimum interval between requests on the shared rate limiter.
    /// Zero disables pacing.
    #[serde(default)]
    pub rate_limit_min_interval_ms: u64,
    #[serde(default = "default_bulkhead")]
    pub bulkhead_max_in_flight: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cool_down_ms: default_breaker_cool_down_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            embedding_timeout_ms: default_embedding_timeout_ms(),
            rate_limit_min_interval_ms: 0,
            bulkhead_max_in_flight: default_bulkhead(),
        }
    }
}

fn default_retries() -> u32 {
    3
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cool_down_ms() -> u64 {
    30_000
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}
fn default_embedding_timeout_ms() -> u64 {
    30_000
}
fn default_bulkhead() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Hybrid score below which `find_by_source` treats the best hit as a
    /// miss and returns `None`.
    #[serde(default = "default_source_match_threshold")]
    pub source_match_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            source_match_threshold: default_source_match_threshold(),
        }
    }
}

fn default_source_match_threshold() -> f64 {
    0.35
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.parallel == 0 {
        anyhow::bail!("pipeline.parallel must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "simple" | "openai" | "openrouter" | "huggingface" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be simple, openai, openrouter, or huggingface.",
            other
        ),
    }

    if config.embedding.provider != "simple" && config.embedding.api_key.is_none() {
        anyhow::bail!(
            "embedding.api_key must be set when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.caches.search_capacity == 0 || config.caches.embedding_capacity == 0 {
        anyhow::bail!("cache capacities must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.source_match_threshold) {
        anyhow::bail!("retrieval.source_match_threshold must be in [0.0, 1.0]");
    }

    Ok(())
}
