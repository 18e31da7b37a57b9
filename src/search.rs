//! Multi-signal hybrid search.
//!
//! Scoring runs over the vector-nearest candidates (3× the requested
//! limit), combining five signals with collection-specific weights:
//!
//! - catalog:  `0.30·vector + 0.25·bm25 + 0.20·title + 0.15·concept + 0.10·wordnet`
//! - chunks:   `0.35·vector + 0.35·bm25 + 0.15·concept + 0.15·wordnet`
//! - concepts: `0.40·vector + 0.30·bm25 + 0.30·name_exact`
//!
//! BM25 document frequencies are computed over the candidate pool, which
//! keeps scoring deterministic and snapshot-consistent without a global
//! statistics table. Results sort by hybrid score, then lower distance,
//! then ID, so equal inputs always produce equal orderings.
//!
//! A query/options-keyed LRU cache fronts the service (5 minute TTL,
//! cleared on index build). Debug mode bypasses the cache and emits a
//! per-component score trace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{CacheMetrics, LruCache};
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{EngineError, Result};
use crate::expand::{QueryExpander, QueryExpansion};
use crate::ids::Id;
use crate::models::{Scores, SearchHit};
use crate::store::TableStore;

/// How many vector-nearest rows are scored per query, as a multiple of the
/// requested limit.
const CANDIDATE_MULTIPLIER: usize = 3;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

// ============ Text utilities ============

/// Lower-case, split on whitespace, strip edge punctuation, drop tokens of
/// length <= 2. Duplicates are removed, order preserved.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for raw in text.to_lowercase().split_whitespace() {
        let token = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if token.len() <= 2 {
            continue;
        }
        if !terms.iter().any(|t| t == token) {
            terms.push(token.to_string());
        }
    }
    terms
}

/// BM25 over `texts` for `query_terms`, document frequencies taken from the
/// given pool, normalized into `[0, 1]` by the pool maximum.
pub fn bm25_scores(query_terms: &[String], texts: &[String]) -> Vec<f64> {
    if texts.is_empty() || query_terms.is_empty() {
        return vec![0.0; texts.len()];
    }

    let docs: Vec<Vec<String>> = texts.iter().map(|t| tokenize_all(t)).collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(|d| d.len() as f64).sum::<f64>() / n;

    let mut df: HashMap<&str, f64> = HashMap::new();
    for term in query_terms {
        let count = docs
            .iter()
            .filter(|d| d.iter().any(|t| t == term))
            .count() as f64;
        df.insert(term.as_str(), count);
    }

    let mut scores: Vec<f64> = docs
        .iter()
        .map(|doc| {
            let len = doc.len() as f64;
            query_terms
                .iter()
                .map(|term| {
                    let tf = doc.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let d = df[term.as_str()];
                    let idf = ((n - d + 0.5) / (d + 0.5) + 1.0).ln();
                    let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                    idf * tf * (BM25_K1 + 1.0) / denom
                })
                .sum()
        })
        .collect();

    let max = scores.iter().cloned().fold(0.0f64, f64::max);
    if max > 0.0 {
        for s in scores.iter_mut() {
            *s /= max;
        }
    }
    scores
}

/// Like [`tokenize`] but keeps duplicates (term frequencies matter here).
fn tokenize_all(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|raw| raw.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| t.len() > 2)
        .collect()
}

// ============ Service ============

/// Searchable collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Catalog,
    Chunks,
    Concepts,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Catalog => "catalog",
            Collection::Chunks => "chunks",
            Collection::Concepts => "concepts",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub limit: usize,
    /// Bypass the result cache and emit a score trace.
    pub debug: bool,
    /// Restrict chunk search to one document.
    pub catalog_filter: Option<Id>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            debug: false,
            catalog_filter: None,
        }
    }
}

/// A row pulled into scoring.
struct Candidate {
    id: Id,
    title: String,
    source: String,
    text: String,
    page_number: Option<u32>,
    concept_names: Vec<String>,
    similarity: f64,
    name_norm: String,
}

pub struct HybridSearchService {
    store: Arc<TableStore>,
    embeddings: Arc<EmbeddingService>,
    expander: Arc<QueryExpander>,
    cache: Mutex<LruCache<String, Vec<SearchHit>>>,
}

impl HybridSearchService {
    pub fn new(
        store: Arc<TableStore>,
        embeddings: Arc<EmbeddingService>,
        expander: Arc<QueryExpander>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            embeddings,
            expander,
            cache: Mutex::new(LruCache::new(cache_capacity, Some(cache_ttl))),
        }
    }

    /// Search `collection` for `query`. Empty queries are a validation
    /// error; queries matching nothing return an empty list.
    pub async fn search(
        &self,
        collection: Collection,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(EngineError::Validation("empty query".to_string()));
        }

        let cache_key = self.cache_key(collection, query, options);
        if !options.debug {
            if let Some(hit) = self.cache.lock().await.get(&cache_key) {
                return Ok(hit);
            }
        }

        let expansion = self.expander.expand(query).await?;
        let query_vector = self.embeddings.embed(query).await?;

        let candidate_k = options.limit.max(1) * CANDIDATE_MULTIPLIER;
        let mut candidates = self
            .fetch_candidates(collection, &query_vector, candidate_k, options)
            .await?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = crate::ids::normalize_name(query);
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let bm25 = bm25_scores(&expansion.original_terms, &texts);

        let mut hits: Vec<SearchHit> = Vec::with_capacity(candidates.len());
        for (i, cand) in candidates.drain(..).enumerate() {
            let vector_score = cand.similarity.clamp(0.0, 1.0);
            let title_score = match collection {
                Collection::Catalog => term_coverage(&expansion.all_terms, &cand.title),
                _ => 0.0,
            };
            let (concept_score, matched_concepts) =
                concept_overlap(&expansion, &cand.concept_names);
            let wordnet_score = wordnet_overlap(&expansion, &cand.text, &cand.title);
            let name_exact = if cand.name_norm == query_norm { 1.0 } else { 0.0 };

            let hybrid = match collection {
                Collection::Catalog => {
                    0.30 * vector_score
                        + 0.25 * bm25[i]
                        + 0.20 * title_score
                        + 0.15 * concept_score
                        + 0.10 * wordnet_score
                }
                Collection::Chunks => {
                    0.35 * vector_score
                        + 0.35 * bm25[i]
                        + 0.15 * concept_score
                        + 0.15 * wordnet_score
                }
                Collection::Concepts => {
                    0.40 * vector_score + 0.30 * bm25[i] + 0.30 * name_exact
                }
            };

            if options.debug {
                debug!(
                    collection = collection.as_str(),
                    id = cand.id,
                    vector = vector_score,
                    bm25 = bm25[i],
                    title = title_score,
                    concept = concept_score,
                    wordnet = wordnet_score,
                    hybrid,
                    "score trace"
                );
            }

            hits.push(SearchHit {
                id: cand.id,
                title: cand.title,
                source: cand.source,
                text: cand.text,
                page_number: cand.page_number,
                distance: 1.0 - cand.similarity,
                scores: Scores {
                    vector: vector_score,
                    bm25: bm25[i],
                    title: title_score,
                    concept: concept_score,
                    wordnet: wordnet_score,
                    hybrid: hybrid.clamp(0.0, 1.0),
                },
                matched_concepts,
                expanded_terms: expansion.all_terms.clone(),
            });
        }

        // Deterministic ordering: score desc, distance asc, id asc.
        hits.sort_by(|a, b| {
            b.scores
                .hybrid
                .partial_cmp(&a.scores.hybrid)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(options.limit);

        if !options.debug {
            self.cache.lock().await.put(cache_key, hits.clone());
        }
        Ok(hits)
    }

    /// Drop all cached results. Called after an index build swap.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        self.cache.lock().await.metrics()
    }

    fn cache_key(&self, collection: Collection, query: &str, options: &SearchOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(collection.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(query.as_bytes());
        hasher.update(b"|");
        hasher.update(options.limit.to_le_bytes());
        if let Some(filter) = options.catalog_filter {
            hasher.update(filter.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    async fn fetch_candidates(
        &self,
        collection: Collection,
        query_vector: &[f32],
        candidate_k: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = match collection {
            Collection::Catalog => {
                let rows = self.store.all_catalog().await?;
                rows.into_iter()
                    .map(|entry| Candidate {
                        similarity: cosine_similarity(query_vector, &entry.vector) as f64,
                        name_norm: String::new(),
                        id: entry.id,
                        title: entry.title,
                        source: entry.source,
                        text: entry.summary,
                        page_number: None,
                        concept_names: entry.concept_names,
                    })
                    .collect::<Vec<_>>()
            }
            Collection::Chunks => {
                let rows = self.store.all_chunks().await?;
                let catalog = self.store.all_catalog().await?;
                let doc_info: HashMap<Id, (String, String)> = catalog
                    .into_iter()
                    .map(|c| (c.id, (c.title, c.source)))
                    .collect();
                let concept_names = self.concept_name_map().await?;
                rows.into_iter()
                    .filter(|chunk| match options.catalog_filter {
                        Some(filter) => chunk.catalog_id == filter,
                        None => true,
                    })
                    .map(|chunk| {
                        let (title, source) = doc_info
                            .get(&chunk.catalog_id)
                            .cloned()
                            .unwrap_or_default();
                        Candidate {
                            similarity: cosine_similarity(query_vector, &chunk.vector) as f64,
                            name_norm: String::new(),
                            id: chunk.id,
                            title,
                            source,
                            text: chunk.text,
                            page_number: chunk.page_number,
                            concept_names: chunk
                                .concept_ids
                                .iter()
                                .filter_map(|id| concept_names.get(id).cloned())
                                .collect(),
                        }
                    })
                    .collect()
            }
            Collection::Concepts => {
                let rows = self.store.all_concepts().await?;
                rows.into_iter()
                    .map(|concept| Candidate {
                        similarity: cosine_similarity(query_vector, &concept.vector) as f64,
                        name_norm: crate::ids::normalize_name(&concept.name),
                        id: concept.id,
                        text: format!(
                            "{} {} {}",
                            concept.name,
                            concept.summary,
                            concept.synonyms.join(" ")
                        ),
                        title: concept.name,
                        source: String::new(),
                        page_number: None,
                        concept_names: Vec::new(),
                    })
                    .collect()
            }
        };

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(candidate_k);
        Ok(candidates)
    }

    async fn concept_name_map(&self) -> Result<HashMap<Id, String>> {
        Ok(self
            .store
            .all_concepts()
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect())
    }
}

/// Fraction of `terms` present as whole tokens in `text`.
fn term_coverage(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(text);
    let matched = terms.iter().filter(|t| tokens.contains(*t)).count();
    matched as f64 / terms.len() as f64
}

/// Weighted overlap of concept-derived expansion terms with the row's
/// concept names. Returns the score and the matched names.
fn concept_overlap(expansion: &QueryExpansion, concept_names: &[String]) -> (f64, Vec<String>) {
    let mut concept_terms: Vec<&String> = expansion.concept_terms.iter().collect();
    for t in &expansion.corpus_terms {
        if !concept_terms.iter().any(|x| *x == t) {
            concept_terms.push(t);
        }
    }
    for t in &expansion.original_terms {
        if !concept_terms.iter().any(|x| *x == t) {
            concept_terms.push(t);
        }
    }
    if concept_terms.is_empty() || concept_names.is_empty() {
        return (0.0, Vec::new());
    }

    let name_tokens: Vec<(String, Vec<String>)> = concept_names
        .iter()
        .map(|n| (n.clone(), tokenize(n)))
        .collect();

    let total: f64 = concept_terms
        .iter()
        .map(|t| expansion.weight(t) as f64)
        .sum();
    if total <= 0.0 {
        return (0.0, Vec::new());
    }

    let mut matched_weight = 0.0f64;
    let mut matched_names: Vec<String> = Vec::new();
    for term in &concept_terms {
        let hit = name_tokens
            .iter()
            .filter(|(_, tokens)| tokens.contains(*term))
            .collect::<Vec<_>>();
        if !hit.is_empty() {
            matched_weight += expansion.weight(term) as f64;
            for (name, _) in hit {
                if !matched_names.contains(name) {
                    matched_names.push(name.clone());
                }
            }
        }
    }
    ((matched_weight / total).clamp(0.0, 1.0), matched_names)
}

/// Weighted overlap of WordNet-derived terms with the row's textual fields.
fn wordnet_overlap(expansion: &QueryExpansion, text: &str, title: &str) -> f64 {
    if expansion.wordnet_terms.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(&format!("{} {}", title, text));
    let total: f64 = expansion
        .wordnet_terms
        .iter()
        .map(|t| expansion.weight(t) as f64)
        .sum();
    if total <= 0.0 {
        return 0.0;
    }
    let matched: f64 = expansion
        .wordnet_terms
        .iter()
        .filter(|t| tokens.contains(*t))
        .map(|t| expansion.weight(t) as f64)
        .sum();
    (matched / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_short_and_punct() {
        assert_eq!(
            tokenize("The quick, brown fox is on it!"),
            vec!["the", "quick", "brown", "fox"]
        );
        assert_eq!(tokenize("a of it"), Vec::<String>::new());
    }

    #[test]
    fn tokenize_dedups_preserving_order() {
        assert_eq!(
            tokenize("data data systems data"),
            vec!["data", "systems"]
        );
    }

    #[test]
    fn bm25_ranks_matching_doc_higher() {
        let terms = vec!["innovation".to_string()];
        let texts = vec![
            "innovation drives growth and innovation".to_string(),
            "cooking with gas".to_string(),
            "some innovation here".to_string(),
        ];
        let scores = bm25_scores(&terms, &texts);
        assert!(scores[0] > scores[2]);
        assert_eq!(scores[1], 0.0);
        assert!((scores[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bm25_empty_inputs() {
        assert!(bm25_scores(&[], &["x".to_string()])
            .iter()
            .all(|s| *s == 0.0));
        assert!(bm25_scores(&["x".to_string()], &[]).is_empty());
    }

    #[test]
    fn term_coverage_fraction() {
        let terms = vec!["clean".to_string(), "architecture".to_string()];
        assert!((term_coverage(&terms, "Clean Architecture") - 1.0).abs() < 1e-9);
        assert!((term_coverage(&terms, "clean code") - 0.5).abs() < 1e-9);
        assert_eq!(term_coverage(&terms, "cooking"), 0.0);
    }

    #[test]
    fn concept_overlap_weighted() {
        let mut expansion = QueryExpansion::default();
        expansion.original_terms = vec!["innovation".to_string()];
        expansion.concept_terms = vec!["disruption".to_string()];
        expansion
            .weights
            .insert("innovation".to_string(), 1.0);
        expansion.weights.insert("disruption".to_string(), 0.7);

        let names = vec!["innovation theory".to_string(), "markets".to_string()];
        let (score, matched) = concept_overlap(&expansion, &names);
        // innovation (1.0) matches, disruption (0.7) does not.
        assert!((score - 1.0 / 1.7).abs() < 1e-9);
        assert_eq!(matched, vec!["innovation theory"]);
    }

    #[test]
    fn wordnet_overlap_weighted() {
        let mut expansion = QueryExpansion::default();
        expansion.wordnet_terms = vec!["novelty".to_string(), "invention".to_string()];
        expansion.weights.insert("novelty".to_string(), 0.54);
        expansion.weights.insert("invention".to_string(), 0.48);

        let score = wordnet_overlap(&expansion, "a tale of novelty and progress", "");
        assert!((score - 0.54 / (0.54 + 0.48)).abs() < 1e-9);
    }
}
