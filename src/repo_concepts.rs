//! Concept repository.
//!
//! Name lookups are case-insensitive exact matches. `search_by_hybrid`
//! ranks concepts by a simplified three-signal score: exact name match,
//! vector similarity, and BM25 over name + summary + synonyms.

use std::sync::Arc;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::ids::Id;
use crate::models::Concept;
use crate::search::{bm25_scores, tokenize};
use crate::store::TableStore;

/// Weights for the simplified concept ranking.
const W_VECTOR: f64 = 0.40;
const W_BM25: f64 = 0.30;
const W_NAME: f64 = 0.30;

pub struct ConceptRepository {
    store: Arc<TableStore>,
}

impl ConceptRepository {
    pub fn new(store: Arc<TableStore>) -> Self {
        Self { store }
    }

    pub async fn find_by_id(&self, id: Id) -> Result<Option<Concept>> {
        self.store.get_concept(id).await
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Concept>> {
        self.store.concept_by_name(name).await
    }

    pub async fn all(&self) -> Result<Vec<Concept>> {
        self.store.all_concepts().await
    }

    /// Nearest concepts to `query_vector` with their cosine similarity,
    /// best first.
    pub async fn search_by_vector(
        &self,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(Concept, f32)>> {
        let mut scored: Vec<(Concept, f32)> = self
            .store
            .all_concepts()
            .await?
            .into_iter()
            .map(|c| {
                let sim = cosine_similarity(query_vector, &c.vector);
                (c, sim)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Rank concepts for `query_text` by name match, vector similarity, and
    /// BM25 over name + summary + synonyms.
    pub async fn search_by_hybrid(
        &self,
        query_text: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<Concept>> {
        let concepts = self.store.all_concepts().await?;
        if concepts.is_empty() {
            return Ok(Vec::new());
        }

        let query_terms = tokenize(query_text);
        let query_norm = crate::ids::normalize_name(query_text);

        let texts: Vec<String> = concepts
            .iter()
            .map(|c| format!("{} {} {}", c.name, c.summary, c.synonyms.join(" ")))
            .collect();
        let bm25 = bm25_scores(&query_terms, &texts);

        let mut scored: Vec<(usize, f64)> = concepts
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let vector = cosine_similarity(query_vector, &c.vector).clamp(0.0, 1.0) as f64;
                let name_exact = if crate::ids::normalize_name(&c.name) == query_norm {
                    1.0
                } else {
                    0.0
                };
                let score = W_VECTOR * vector + W_BM25 * bm25[i] + W_NAME * name_exact;
                (i, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(concepts[a.0].id.cmp(&concepts[b.0].id))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(i, _)| concepts[i].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingService, SimpleEmbedder};
    use crate::models::ConceptType;
    use tempfile::TempDir;

    async fn seed_store(tmp: &TempDir) -> Arc<TableStore> {
        let store = Arc::new(TableStore::open(tmp.path()).await.unwrap());
        let embeddings = EmbeddingService::new(Arc::new(SimpleEmbedder), 64);
        for (id, name, summary) in [
            (1u32, "innovation", "Introducing new ideas and products."),
            (2u32, "disruption", "Market shifts that unseat incumbents."),
            (3u32, "cooking", "Preparing food with heat."),
        ] {
            let vector = embeddings.embed(&format!("{} {}", name, summary)).await.unwrap();
            store
                .put_concept(&Concept {
                    id,
                    name: name.to_string(),
                    summary: summary.to_string(),
                    concept_type: ConceptType::Thematic,
                    catalog_ids: vec![1],
                    chunk_ids: vec![],
                    adjacent_ids: vec![],
                    related_ids: vec![],
                    synonyms: vec![],
                    broader_terms: vec![],
                    narrower_terms: vec![],
                    weight: 0.5,
                    vector,
                    catalog_titles: vec![],
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn find_by_name_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let repo = ConceptRepository::new(seed_store(&tmp).await);
        assert!(repo.find_by_name("Innovation").await.unwrap().is_some());
        assert!(repo.find_by_name("INNOVATION").await.unwrap().is_some());
        assert!(repo.find_by_name("unknown thing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hybrid_ranks_exact_name_first() {
        let tmp = TempDir::new().unwrap();
        let repo = ConceptRepository::new(seed_store(&tmp).await);
        let embeddings = EmbeddingService::new(Arc::new(SimpleEmbedder), 64);
        let qv = embeddings.embed("innovation").await.unwrap();
        let results = repo.search_by_hybrid("innovation", &qv, 3).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].name, "innovation");
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let repo = ConceptRepository::new(seed_store(&tmp).await);
        let embeddings = EmbeddingService::new(Arc::new(SimpleEmbedder), 64);
        let qv = embeddings.embed("innovation new ideas").await.unwrap();
        let results = repo.search_by_vector(&qv, 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].1 >= results[1].1);
        assert_eq!(results[0].0.name, "innovation");
    }
}
