//! Embedding providers and the caching embedding service.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`SimpleEmbedder`]** — deterministic hashed embedding; the default
//!   and the test workhorse. No network, stable across runs.
//! - **[`OpenAiEmbedder`]** — OpenAI-compatible `/embeddings` endpoint
//!   (also covers OpenRouter via `base_url`).
//! - **[`HuggingFaceEmbedder`]** — HF inference API feature-extraction.
//!
//! Whatever the provider's native dimensionality, vectors are projected to
//! 384 dimensions by truncation (or zero-padding) and re-normalized, so
//! every stored vector is unit length.
//!
//! [`EmbeddingService`] wraps a provider with the LRU embedding cache keyed
//! on `(model_id, SHA-256(text))`. Embeddings are immutable per
//! `(model, text)`, so the cache carries no TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::{CacheMetrics, LruCache};
use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// Fixed store dimensionality.
pub const EMBEDDING_DIM: usize = 384;

/// An embedding backend. Implementations may return any dimensionality;
/// the service projects to [`EMBEDDING_DIM`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable model identifier, part of the cache key.
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============ Vector utilities ============

/// L2-normalize in place. A zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Project to [`EMBEDDING_DIM`] by truncation or zero-padding, then
/// re-normalize.
pub fn project_to_dim(mut v: Vec<f32>) -> Vec<f32> {
    v.truncate(EMBEDDING_DIM);
    v.resize(EMBEDDING_DIM, 0.0);
    l2_normalize(&mut v);
    v
}

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Simple provider ============

/// Deterministic hashed embedding.
///
/// Each whitespace token is hashed with SHA-256; the digest selects
/// dimensions and signed contributions, which are accumulated and
/// L2-normalized. Tokens sharing a prefix also contribute a stem signal so
/// related words land near each other. Pure per `(model, text)`.
pub struct SimpleEmbedder;

impl SimpleEmbedder {
    fn token_contribution(v: &mut [f32], token: &str, scale: f32) {
        let digest = Sha256::digest(token.as_bytes());
        // Eight (dimension, sign) pairs per token.
        for pair in digest.chunks_exact(4) {
            let dim = u16::from_be_bytes([pair[0], pair[1]]) as usize % EMBEDDING_DIM;
            let magnitude = (pair[2] as f32 + 1.0) / 256.0;
            let sign = if pair[3] & 1 == 0 { 1.0 } else { -1.0 };
            v[dim] += sign * magnitude * scale;
        }
    }
}

#[async_trait]
impl Embedder for SimpleEmbedder {
    fn model_id(&self) -> &str {
        "hashed-384"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for raw in text.split_whitespace() {
            let token: String = raw
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            Self::token_contribution(&mut v, &token, 1.0);
            // Stem signal: first six characters.
            if token.len() > 6 {
                let stem: String = token.chars().take(6).collect();
                Self::token_contribution(&mut v, &stem, 0.5);
            }
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

// ============ OpenAI-compatible provider ============

/// Calls an OpenAI-compatible `POST {base_url}/embeddings` endpoint.
/// OpenRouter uses the same wire shape with a different `base_url`.
pub struct OpenAiEmbedder {
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| EngineError::Validation("embedding.api_key required".to_string()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Dependency(e.to_string()))?;
        Ok(Self {
            model: config.model.clone(),
            base_url,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        let embedding = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| EngineError::Parse("embeddings response missing data".to_string()))?;

        let v: Vec<f32> = embedding
            .iter()
            .map(|x| x.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(project_to_dim(v))
    }
}

// ============ HuggingFace provider ============

/// Calls the HuggingFace inference API's feature-extraction pipeline, or a
/// local TEI endpoint when `use_local` and `base_url` are set.
pub struct HuggingFaceEmbedder {
    model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HuggingFaceEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| EngineError::Validation("embedding.api_key required".to_string()))?;
        let base_url = match (&config.base_url, config.use_local) {
            (Some(url), _) => url.clone(),
            (None, true) => "http://localhost:8080".to_string(),
            (None, false) => {
                "https://api-inference.huggingface.co/pipeline/feature-extraction".to_string()
            }
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Dependency(e.to_string()))?;
        Ok(Self {
            model: config.model.clone(),
            base_url,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "inputs": [text] });

        let response = self
            .client
            .post(format!("{}/{}", self.base_url, self.model))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        // Either [[f32]] (sentence pooled) or [[[f32]]] (token-level).
        let first = json
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| EngineError::Parse("feature-extraction response empty".to_string()))?;

        let v: Vec<f32> = match first.as_array() {
            Some(inner) if inner.first().map(|x| x.is_array()).unwrap_or(false) => {
                // Token-level: mean-pool.
                let tokens: Vec<Vec<f32>> = inner
                    .iter()
                    .filter_map(|t| t.as_array())
                    .map(|t| t.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
                    .collect();
                mean_pool(&tokens)
            }
            Some(inner) => inner
                .iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect(),
            None => return Err(EngineError::Parse("feature-extraction shape".to_string())),
        };
        Ok(project_to_dim(v))
    }
}

fn mean_pool(tokens: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = tokens.first() else {
        return Vec::new();
    };
    let mut out = vec![0.0f32; first.len()];
    for t in tokens {
        for (o, x) in out.iter_mut().zip(t.iter()) {
            *o += x;
        }
    }
    let n = tokens.len() as f32;
    for o in out.iter_mut() {
        *o /= n;
    }
    out
}

// ============ Error classification ============

fn classify_transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout(0)
    } else {
        EngineError::Dependency(format!("embedding transport: {}", e))
    }
}

async fn classify_status(status: reqwest::StatusCode, response: reqwest::Response) -> EngineError {
    let retry_after_ms = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let body = response.text().await.unwrap_or_default();

    if status.as_u16() == 429 {
        EngineError::RateLimited {
            message: format!("embedding API 429: {}", body),
            retry_after_ms,
        }
    } else if status.is_server_error() {
        EngineError::Dependency(format!("embedding API {}: {}", status, body))
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        EngineError::Validation(format!("embedding API auth {}: {}", status, body))
    } else {
        EngineError::Validation(format!("embedding API {}: {}", status, body))
    }
}

// ============ Factory ============

/// Instantiate the configured provider.
pub fn create_embedder(config: &EmbeddingConfig, timeout: Duration) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "simple" => Ok(Arc::new(SimpleEmbedder)),
        "openai" | "openrouter" => Ok(Arc::new(OpenAiEmbedder::new(config, timeout)?)),
        "huggingface" => Ok(Arc::new(HuggingFaceEmbedder::new(config, timeout)?)),
        other => Err(EngineError::Validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Caching service ============

/// Provider plus the process-wide embedding cache.
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    cache: Mutex<LruCache<(String, String), Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, cache_capacity: usize) -> Self {
        Self {
            embedder,
            cache: Mutex::new(LruCache::new(cache_capacity, None)),
        }
    }

    pub fn model_id(&self) -> String {
        self.embedder.model_id().to_string()
    }

    /// Embed `text`, consulting the cache first. Returned vectors are unit
    /// length and [`EMBEDDING_DIM`]-dimensional.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = (
            self.embedder.model_id().to_string(),
            format!("{:x}", Sha256::digest(text.as_bytes())),
        );

        if let Some(hit) = self.cache.lock().await.get(&key) {
            return Ok(hit);
        }

        let mut v = self.embedder.embed(text).await?;
        if v.len() != EMBEDDING_DIM {
            v = project_to_dim(v);
        } else {
            l2_normalize(&mut v);
        }
        self.cache.lock().await.put(key, v.clone());
        Ok(v)
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        self.cache.lock().await.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simple_embedder_is_deterministic() {
        let e = SimpleEmbedder;
        let a = e.embed("distributed systems design").await.unwrap();
        let b = e.embed("distributed systems design").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn simple_embedder_is_unit_length() {
        let e = SimpleEmbedder;
        let v = e.embed("innovation in organizations").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_unrelated() {
        let e = SimpleEmbedder;
        let a = e.embed("machine learning models").await.unwrap();
        let b = e.embed("machine learning systems").await.unwrap();
        let c = e.embed("medieval cooking recipes").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn vec_blob_round_trip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn projection_truncates_and_pads() {
        let long = vec![1.0f32; 1536];
        let projected = project_to_dim(long);
        assert_eq!(projected.len(), EMBEDDING_DIM);
        let norm: f32 = projected.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let short = vec![3.0f32; 10];
        let projected = project_to_dim(short);
        assert_eq!(projected.len(), EMBEDDING_DIM);
        assert_eq!(projected[10], 0.0);
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &a) > 0.999);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }

    #[tokio::test]
    async fn service_caches_by_model_and_text() {
        let service = EmbeddingService::new(Arc::new(SimpleEmbedder), 16);
        let a = service.embed("caching test").await.unwrap();
        let b = service.embed("caching test").await.unwrap();
        assert_eq!(a, b);
        let m = service.cache_metrics().await;
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
    }
}
