//! Multi-source query expansion.
//!
//! A query is expanded from three sources in addition to its own terms:
//! a WordNet-style lexical database, the concept index (vector search plus
//! lexical relations), and the raw concept corpus with a type-aware policy
//! (thematic concepts expand aggressively, terminology only on strong
//! vector similarity and without transitive expansion).
//!
//! Sources are merged with a max rule:
//! `weight[term] = max(original·1.0, corpus·0.8, concept·0.7, wordnet·0.6)`.
//! Expansion never mutates the query; the scorer consumes the result.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::repo_concepts::ConceptRepository;
use crate::search::tokenize;

/// Merge factors per source.
const FACTOR_CORPUS: f32 = 0.8;
const FACTOR_CONCEPT: f32 = 0.7;
const FACTOR_WORDNET: f32 = 0.6;

/// Source weights inside the corpus expansion.
const CORPUS_THEMATIC_WEIGHT: f32 = 0.85;
const CORPUS_RELATED_WEIGHT: f32 = 0.6;
const CORPUS_MAX_RELATED: usize = 4;
/// Terminology concepts only expand above this vector similarity.
const TERMINOLOGY_MIN_SIMILARITY: f32 = 0.6;
/// Concept-index candidates consulted per query.
const CONCEPT_CANDIDATES: usize = 8;

/// External lexical database collaborator.
pub trait WordNetProvider: Send + Sync {
    /// Expand `terms` into related terms with confidences in `[0, 1]`,
    /// bounded per input term by `max_synonyms` and `max_broader`.
    fn expand(
        &self,
        terms: &[String],
        max_synonyms: usize,
        max_broader: usize,
    ) -> HashMap<String, f32>;
}

/// No lexical database wired in.
pub struct NoWordNet;

impl WordNetProvider for NoWordNet {
    fn expand(&self, _: &[String], _: usize, _: usize) -> HashMap<String, f32> {
        HashMap::new()
    }
}

/// Table-driven provider, used in tests and for small curated synonym sets.
pub struct StaticWordNet {
    entries: HashMap<String, Vec<(String, f32)>>,
}

impl StaticWordNet {
    pub fn from_pairs(pairs: &[(&str, &str, f32)]) -> Self {
        let mut entries: HashMap<String, Vec<(String, f32)>> = HashMap::new();
        for (term, related, weight) in pairs {
            entries
                .entry(term.to_string())
                .or_default()
                .push((related.to_string(), *weight));
        }
        Self { entries }
    }
}

impl WordNetProvider for StaticWordNet {
    fn expand(
        &self,
        terms: &[String],
        max_synonyms: usize,
        _max_broader: usize,
    ) -> HashMap<String, f32> {
        let mut out = HashMap::new();
        for term in terms {
            if let Some(related) = self.entries.get(term) {
                for (word, weight) in related.iter().take(max_synonyms) {
                    let entry = out.entry(word.clone()).or_insert(0.0f32);
                    *entry = entry.max(*weight);
                }
            }
        }
        out
    }
}

/// Expansion result consumed by the hybrid scorer.
#[derive(Debug, Clone, Default)]
pub struct QueryExpansion {
    pub original_terms: Vec<String>,
    pub corpus_terms: Vec<String>,
    pub concept_terms: Vec<String>,
    pub wordnet_terms: Vec<String>,
    pub all_terms: Vec<String>,
    pub weights: HashMap<String, f32>,
}

impl QueryExpansion {
    pub fn weight(&self, term: &str) -> f32 {
        self.weights.get(term).copied().unwrap_or(0.0)
    }
}

pub struct QueryExpander {
    wordnet: Arc<dyn WordNetProvider>,
    concepts: Arc<ConceptRepository>,
    embeddings: Arc<EmbeddingService>,
}

impl QueryExpander {
    pub fn new(
        wordnet: Arc<dyn WordNetProvider>,
        concepts: Arc<ConceptRepository>,
        embeddings: Arc<EmbeddingService>,
    ) -> Self {
        Self {
            wordnet,
            concepts,
            embeddings,
        }
    }

    pub async fn expand(&self, query: &str) -> Result<QueryExpansion> {
        let original_terms = tokenize(query);
        if original_terms.is_empty() {
            return Ok(QueryExpansion::default());
        }

        let wordnet_map = self.wordnet.expand(&original_terms, 5, 2);

        let query_vector = self.embeddings.embed(query).await?;
        let hits = self
            .concepts
            .search_by_vector(&query_vector, CONCEPT_CANDIDATES)
            .await?;

        // Concept-store expansion: returned names plus lexically-related
        // names, kept only when a whole word overlaps the query. The filter
        // blocks substring noise (`software` must not pull in `war`).
        let mut concept_map: HashMap<String, f32> = HashMap::new();
        for (concept, _sim) in &hits {
            if whole_word_overlap(&concept.name, &original_terms) {
                bump(&mut concept_map, &concept.name, 1.0);
            }
            for related_id in &concept.related_ids {
                if let Some(related) = self.concepts.find_by_id(*related_id).await? {
                    if whole_word_overlap(&related.name, &original_terms) {
                        bump(&mut concept_map, &related.name, 0.8);
                    }
                }
            }
        }

        // Corpus expansion: type-aware. Thematic concepts expand
        // aggressively with their relations; terminology only on strong
        // similarity and never transitively.
        let mut corpus_map: HashMap<String, f32> = HashMap::new();
        for (concept, sim) in &hits {
            match concept.concept_type {
                crate::models::ConceptType::Thematic => {
                    bump(&mut corpus_map, &concept.name, CORPUS_THEMATIC_WEIGHT);
                    for related_id in concept.related_ids.iter().take(CORPUS_MAX_RELATED) {
                        if let Some(related) = self.concepts.find_by_id(*related_id).await? {
                            bump(&mut corpus_map, &related.name, CORPUS_RELATED_WEIGHT);
                        }
                    }
                }
                crate::models::ConceptType::Terminology => {
                    if *sim > TERMINOLOGY_MIN_SIMILARITY {
                        bump(&mut corpus_map, &concept.name, CORPUS_THEMATIC_WEIGHT);
                    }
                }
            }
        }

        let mut expansion = QueryExpansion::default();
        for term in &original_terms {
            set_max(&mut expansion.weights, term, 1.0);
        }
        expansion.original_terms = original_terms.clone();

        for (term, weight) in &corpus_map {
            for token in expansion_tokens(term) {
                set_max(&mut expansion.weights, &token, weight * FACTOR_CORPUS);
                push_unique(&mut expansion.corpus_terms, &token);
            }
        }
        for (term, weight) in &concept_map {
            for token in expansion_tokens(term) {
                set_max(&mut expansion.weights, &token, weight * FACTOR_CONCEPT);
                push_unique(&mut expansion.concept_terms, &token);
            }
        }
        for (term, weight) in &wordnet_map {
            for token in expansion_tokens(term) {
                set_max(&mut expansion.weights, &token, weight * FACTOR_WORDNET);
                push_unique(&mut expansion.wordnet_terms, &token);
            }
        }

        expansion.corpus_terms.sort();
        expansion.concept_terms.sort();
        expansion.wordnet_terms.sort();

        let mut all = original_terms;
        for list in [
            &expansion.corpus_terms,
            &expansion.concept_terms,
            &expansion.wordnet_terms,
        ] {
            for term in list {
                push_unique(&mut all, term);
            }
        }
        expansion.all_terms = all;

        debug!(
            original = expansion.original_terms.len(),
            corpus = expansion.corpus_terms.len(),
            concept = expansion.concept_terms.len(),
            wordnet = expansion.wordnet_terms.len(),
            "query expanded"
        );
        Ok(expansion)
    }
}

/// Multi-word expansion sources contribute their individual tokens.
fn expansion_tokens(term: &str) -> Vec<String> {
    tokenize(term)
}

fn bump(map: &mut HashMap<String, f32>, term: &str, weight: f32) {
    let entry = map.entry(term.to_string()).or_insert(0.0);
    *entry = entry.max(weight);
}

fn set_max(weights: &mut HashMap<String, f32>, term: &str, weight: f32) {
    let entry = weights.entry(term.to_string()).or_insert(0.0);
    *entry = entry.max(weight);
}

fn push_unique(list: &mut Vec<String>, term: &str) {
    if !list.iter().any(|t| t == term) {
        list.push(term.to_string());
    }
}

/// True when `name` shares at least one whole token with `terms`.
fn whole_word_overlap(name: &str, terms: &[String]) -> bool {
    let name_tokens = tokenize(name);
    name_tokens.iter().any(|t| terms.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::SimpleEmbedder;
    use crate::models::{Concept, ConceptType};
    use crate::store::TableStore;
    use tempfile::TempDir;

    fn concept(id: u32, name: &str, concept_type: ConceptType, related: Vec<u32>) -> Concept {
        Concept {
            id,
            name: name.to_string(),
            summary: format!("About {}.", name),
            concept_type,
            catalog_ids: vec![1],
            chunk_ids: vec![],
            adjacent_ids: vec![],
            related_ids: related,
            synonyms: vec![],
            broader_terms: vec![],
            narrower_terms: vec![],
            weight: 0.5,
            vector: vec![],
            catalog_titles: vec![],
        }
    }

    async fn expander_over(concepts: Vec<Concept>) -> (TempDir, QueryExpander) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(TableStore::open(tmp.path()).await.unwrap());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(SimpleEmbedder), 64));
        for mut c in concepts {
            c.vector = embeddings.embed(&format!("{} {}", c.name, c.summary)).await.unwrap();
            store.put_concept(&c).await.unwrap();
        }
        let repo = Arc::new(ConceptRepository::new(store));
        let wordnet = Arc::new(StaticWordNet::from_pairs(&[
            ("innovation", "novelty", 0.9),
            ("innovation", "invention", 0.8),
        ]));
        (tmp, QueryExpander::new(wordnet, repo, embeddings))
    }

    #[test]
    fn overlap_blocks_substring_noise() {
        let terms = vec!["software".to_string()];
        assert!(whole_word_overlap("software architecture", &terms));
        assert!(!whole_word_overlap("war stories", &terms));
    }

    #[tokio::test]
    async fn empty_query_expands_to_nothing() {
        let (_tmp, expander) = expander_over(vec![]).await;
        let exp = expander.expand("a an of").await.unwrap();
        assert!(exp.original_terms.is_empty());
        assert!(exp.all_terms.is_empty());
    }

    #[tokio::test]
    async fn original_terms_have_full_weight() {
        let (_tmp, expander) = expander_over(vec![concept(
            1,
            "software innovation",
            ConceptType::Thematic,
            vec![],
        )])
        .await;
        let exp = expander.expand("software innovation patterns").await.unwrap();
        assert_eq!(
            exp.original_terms,
            vec!["software", "innovation", "patterns"]
        );
        assert!((exp.weight("software") - 1.0).abs() < 1e-6);
        assert!((exp.weight("patterns") - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn wordnet_terms_merge_at_point_six() {
        let (_tmp, expander) = expander_over(vec![]).await;
        let exp = expander.expand("innovation").await.unwrap();
        assert!(exp.wordnet_terms.contains(&"novelty".to_string()));
        assert!((exp.weight("novelty") - 0.9 * 0.6).abs() < 1e-6);
        assert!(exp.all_terms.contains(&"novelty".to_string()));
    }

    #[tokio::test]
    async fn thematic_concepts_expand_into_corpus_terms() {
        let (_tmp, expander) = expander_over(vec![
            concept(1, "innovation strategy", ConceptType::Thematic, vec![2]),
            concept(2, "product roadmaps", ConceptType::Thematic, vec![]),
        ])
        .await;
        let exp = expander.expand("innovation").await.unwrap();
        assert!(exp.corpus_terms.contains(&"strategy".to_string()));
        // Related concept pulled in transitively; it is also a direct hit
        // in this small fixture, so the max rule keeps the direct weight.
        assert!(exp.corpus_terms.contains(&"roadmaps".to_string()));
        assert!((exp.weight("roadmaps") - 0.85 * 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn max_rule_prefers_strongest_source() {
        // "innovation" is an original term and also appears via corpus;
        // original weight 1.0 must win.
        let (_tmp, expander) = expander_over(vec![concept(
            1,
            "innovation",
            ConceptType::Thematic,
            vec![],
        )])
        .await;
        let exp = expander.expand("innovation").await.unwrap();
        assert!((exp.weight("innovation") - 1.0).abs() < 1e-6);
    }
}
