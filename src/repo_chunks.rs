//! Chunk repository.
//!
//! Broad chunk search goes through the hybrid service; scoped search
//! resolves the document first and filters candidates to it. Chunk listing
//! can exclude reference-section chunks, which dominate keyword matches in
//! academic PDFs without carrying content.

use std::sync::Arc;

use crate::error::Result;
use crate::ids::Id;
use crate::models::{Chunk, SearchHit};
use crate::repo_catalog::CatalogRepository;
use crate::search::{Collection, HybridSearchService, SearchOptions};
use crate::store::TableStore;

/// Listing fetch headroom when reference filtering is on.
const FILTER_FETCH_FACTOR: usize = 3;

pub struct ChunkRepository {
    store: Arc<TableStore>,
    search: Arc<HybridSearchService>,
    catalog: Arc<CatalogRepository>,
}

impl ChunkRepository {
    pub fn new(
        store: Arc<TableStore>,
        search: Arc<HybridSearchService>,
        catalog: Arc<CatalogRepository>,
    ) -> Self {
        Self {
            store,
            search,
            catalog,
        }
    }

    pub async fn find_by_id(&self, id: Id) -> Result<Option<Chunk>> {
        self.store.get_chunk(id).await
    }

    /// Chunks of one document in reading order.
    pub async fn find_by_catalog(
        &self,
        catalog_id: Id,
        limit: usize,
        exclude_references: bool,
    ) -> Result<Vec<Chunk>> {
        let fetch = if exclude_references {
            limit.saturating_mul(FILTER_FETCH_FACTOR)
        } else {
            limit
        };
        let mut chunks = self.store.chunks_by_catalog(catalog_id, fetch).await?;
        if exclude_references {
            chunks.retain(|c| !looks_like_references(&c.text));
        }
        chunks.truncate(limit);
        Ok(chunks)
    }

    /// Broad hybrid search over all chunks.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.search.search(Collection::Chunks, query, options).await
    }

    /// Hybrid search scoped to one document, resolved loosely by source.
    pub async fn search_in_source(
        &self,
        source: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let Some(entry) = self.catalog.find_by_source(source).await? else {
            return Ok(Vec::new());
        };
        let scoped = SearchOptions {
            catalog_filter: Some(entry.id),
            ..*options
        };
        self.search.search(Collection::Chunks, query, &scoped).await
    }

    /// Fan out from a concept name to its chunks via `concept.chunk_ids`.
    pub async fn find_by_concept(&self, concept_name: &str, limit: usize) -> Result<Vec<Chunk>> {
        let Some(concept) = self.store.concept_by_name(concept_name).await? else {
            return Ok(Vec::new());
        };

        let mut chunks = Vec::new();
        for id in concept.chunk_ids.iter().take(limit) {
            if let Some(chunk) = self.store.get_chunk(*id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }
}

/// Heuristic for bibliography/reference-section chunks: a section heading
/// up front, or a majority of bracket-cited lines.
fn looks_like_references(text: &str) -> bool {
    let head: String = text
        .trim_start()
        .chars()
        .take(24)
        .collect::<String>()
        .to_lowercase();
    if head.starts_with("references") || head.starts_with("bibliography") {
        return true;
    }

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() >= 4 {
        let cited = lines
            .iter()
            .filter(|l| l.trim_start().starts_with('['))
            .count();
        return cited * 2 >= lines.len();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_heading_detected() {
        assert!(looks_like_references("References\n[1] A. Author, Title."));
        assert!(looks_like_references("BIBLIOGRAPHY\nSmith, J. (2001)"));
        assert!(!looks_like_references(
            "The architecture references several prior systems in passing."
        ));
    }

    #[test]
    fn citation_dense_text_detected() {
        let text = "[1] First citation\n[2] Second one\n[3] Third one\n[4] Fourth one";
        assert!(looks_like_references(text));
        let prose = "One line.\nAnother line.\nMore prose.\nStill prose here.";
        assert!(!looks_like_references(prose));
    }
}
