//! Catalog repository.
//!
//! `find_by_source` resolves loosely: an exact path match wins, otherwise
//! the hybrid search service ranks catalog entries for the query and the
//! best hit is returned only when it clears the configured match
//! threshold. Structural misses are `None`, never errors.

use std::sync::Arc;

use crate::error::Result;
use crate::ids::Id;
use crate::models::{CatalogEntry, SearchHit};
use crate::search::{Collection, HybridSearchService, SearchOptions};
use crate::store::TableStore;

pub struct CatalogRepository {
    store: Arc<TableStore>,
    search: Arc<HybridSearchService>,
    source_match_threshold: f64,
}

impl CatalogRepository {
    pub fn new(
        store: Arc<TableStore>,
        search: Arc<HybridSearchService>,
        source_match_threshold: f64,
    ) -> Self {
        Self {
            store,
            search,
            source_match_threshold,
        }
    }

    pub async fn find_by_id(&self, id: Id) -> Result<Option<CatalogEntry>> {
        self.store.get_catalog(id).await
    }

    /// Resolve a source path or free-form document reference to a catalog
    /// entry. Returns `None` when the best hybrid hit scores below the
    /// match threshold.
    pub async fn find_by_source(&self, source: &str) -> Result<Option<CatalogEntry>> {
        if let Some(exact) = self.store.catalog_by_source(source).await? {
            return Ok(Some(exact));
        }

        let query = source_query(source);
        if query.trim().is_empty() {
            return Ok(None);
        }

        let options = SearchOptions {
            limit: 1,
            ..Default::default()
        };
        let hits = self.search.search(Collection::Catalog, &query, &options).await?;
        match hits.first() {
            Some(best) if best.scores.hybrid >= self.source_match_threshold => {
                self.store.get_catalog(best.id).await
            }
            _ => Ok(None),
        }
    }

    /// Hybrid search over catalog summaries.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.search.search(Collection::Catalog, query, options).await
    }

    /// All documents that carry the named concept, sorted by title.
    pub async fn find_bibliography_for_concept(
        &self,
        concept_name: &str,
        include_metadata: bool,
    ) -> Result<Vec<CatalogEntry>> {
        let Some(concept) = self.store.concept_by_name(concept_name).await? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(concept.catalog_ids.len());
        for id in &concept.catalog_ids {
            if let Some(mut entry) = self.store.get_catalog(*id).await? {
                if !include_metadata {
                    entry.abstract_text = None;
                    entry.keywords.clear();
                    entry.authors.clear();
                }
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    pub async fn all(&self) -> Result<Vec<CatalogEntry>> {
        self.store.all_catalog().await
    }
}

/// Turn a path-like reference into search terms: strip directories and
/// extension, break on separators.
fn source_query(source: &str) -> String {
    let name = source.rsplit(['/', '\\']).next().unwrap_or(source);
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    stem.replace(['_', '-', '.'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_query_strips_path_and_extension() {
        assert_eq!(
            source_query("/books/designing_data-intensive.pdf"),
            "designing data intensive"
        );
        assert_eq!(source_query("innovators-dilemma.epub"), "innovators dilemma");
        assert_eq!(source_query("plain title"), "plain title");
    }
}
