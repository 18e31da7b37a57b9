//! Named operation surface.
//!
//! Each operation takes a typed request against an [`Engine`] and returns
//! a typed response, or an [`OpError`] envelope
//! (`{error_kind, message, details?}` with `is_error: true`). No raw
//! internal errors cross this boundary; repository misses surface as
//! `not_found`, bad input as `validation`.

use serde::Serialize;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::ids::Id;
use crate::models::{CatalogEntry, Scores};
use crate::repo_categories::{CategorySort, ConceptSort};
use crate::search::{Collection, SearchOptions};

/// Fixed result size for the chunk search operations.
const CHUNK_SEARCH_LIMIT: usize = 20;
/// Default result size for catalog search.
const CATALOG_SEARCH_LIMIT: usize = 10;
/// Default chunk fan-out for concept search.
const CONCEPT_CHUNK_LIMIT: usize = 10;

// ============ Failure envelope ============

#[derive(Debug, Clone, Serialize)]
pub struct OpError {
    pub error_kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub is_error: bool,
}

impl OpError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            error_kind: "validation".to_string(),
            message: message.into(),
            details: None,
            is_error: true,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            error_kind: "not_found".to_string(),
            message: message.into(),
            details: None,
            is_error: true,
        }
    }
}

impl From<EngineError> for OpError {
    fn from(e: EngineError) -> Self {
        Self {
            error_kind: e.kind().to_string(),
            message: e.to_string(),
            details: None,
            is_error: true,
        }
    }
}

pub type OpResult<T> = std::result::Result<T, OpError>;

// ============ Search operations ============

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSearchItem {
    pub source: String,
    pub title: String,
    pub summary: String,
    pub scores: Scores,
    pub expanded_terms: Vec<String>,
}

/// Hybrid search over catalog summaries.
pub async fn catalog_search(
    engine: &Engine,
    text: &str,
    debug: bool,
) -> OpResult<Vec<CatalogSearchItem>> {
    require_query(text)?;
    let options = SearchOptions {
        limit: CATALOG_SEARCH_LIMIT,
        debug,
        catalog_filter: None,
    };
    let hits = engine.catalog.search(text, &options).await?;
    Ok(hits
        .into_iter()
        .map(|hit| CatalogSearchItem {
            source: hit.source,
            title: hit.title,
            summary: hit.text,
            scores: hit.scores,
            expanded_terms: hit.expanded_terms,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSearchItem {
    pub text: String,
    pub source: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub scores: Scores,
    pub expanded_terms: Vec<String>,
}

/// Broad hybrid search over all chunks, top 20.
pub async fn broad_chunks_search(
    engine: &Engine,
    text: &str,
    debug: bool,
) -> OpResult<Vec<ChunkSearchItem>> {
    require_query(text)?;
    let options = SearchOptions {
        limit: CHUNK_SEARCH_LIMIT,
        debug,
        catalog_filter: None,
    };
    let hits = engine.chunks.search(text, &options).await?;
    Ok(hits.into_iter().map(chunk_item).collect())
}

/// Chunk search scoped to one document, top 20.
pub async fn chunks_search(
    engine: &Engine,
    text: &str,
    source: &str,
    debug: bool,
) -> OpResult<Vec<ChunkSearchItem>> {
    require_query(text)?;
    if source.trim().is_empty() {
        return Err(OpError::validation("source must not be empty"));
    }
    let Some(entry) = engine.catalog.find_by_source(source).await? else {
        return Err(OpError::not_found(format!("no document matches: {}", source)));
    };
    let options = SearchOptions {
        limit: CHUNK_SEARCH_LIMIT,
        debug,
        catalog_filter: Some(entry.id),
    };
    let hits = engine
        .search
        .search(Collection::Chunks, text, &options)
        .await?;
    Ok(hits.into_iter().map(chunk_item).collect())
}

fn chunk_item(hit: crate::models::SearchHit) -> ChunkSearchItem {
    ChunkSearchItem {
        text: hit.text,
        source: hit.source,
        title: hit.title,
        page: hit.page_number,
        scores: hit.scores,
        expanded_terms: hit.expanded_terms,
    }
}

// ============ Concept search ============

#[derive(Debug, Clone, Default)]
pub struct ConceptSearchRequest {
    pub concept: String,
    pub limit: Option<usize>,
    pub source_filter: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptSource {
    pub title: String,
    pub pages: Vec<u32>,
    pub match_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_concept: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptChunk {
    pub text: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub concept_density: f32,
    pub concepts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptStats {
    pub total_sources: usize,
    pub total_chunks: usize,
    pub related_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptSearchResponse {
    pub concept: String,
    pub concept_id: Id,
    pub summary: String,
    pub related_concepts: Vec<String>,
    pub synonyms: Vec<String>,
    pub broader_terms: Vec<String>,
    pub narrower_terms: Vec<String>,
    pub sources: Vec<ConceptSource>,
    pub chunks: Vec<ConceptChunk>,
    pub stats: ConceptStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<Scores>,
}

/// Resolve a concept (exact name first, hybrid fallback) and fan out to
/// its sources and chunks.
pub async fn concept_search(
    engine: &Engine,
    request: &ConceptSearchRequest,
) -> OpResult<ConceptSearchResponse> {
    require_query(&request.concept)?;
    let limit = request.limit.unwrap_or(CONCEPT_CHUNK_LIMIT);

    let concept = match engine.concepts.find_by_name(&request.concept).await? {
        Some(concept) => concept,
        None => {
            // Loose fallback through the hybrid ranking.
            let query_vector = engine.embeddings.embed(&request.concept).await?;
            let mut ranked = engine
                .concepts
                .search_by_hybrid(&request.concept, &query_vector, 1)
                .await?;
            match ranked.pop() {
                Some(concept) => concept,
                None => {
                    return Err(OpError::not_found(format!(
                        "no concept matches: {}",
                        request.concept
                    )))
                }
            }
        }
    };

    let source_filter_id = match &request.source_filter {
        Some(source) => match engine.catalog.find_by_source(source).await? {
            Some(entry) => Some(entry.id),
            None => {
                return Err(OpError::not_found(format!("no document matches: {}", source)))
            }
        },
        None => None,
    };

    // Primary sources with page fan-out through the page table.
    let mut sources: Vec<ConceptSource> = Vec::new();
    for catalog_id in &concept.catalog_ids {
        if let Some(filter) = source_filter_id {
            if *catalog_id != filter {
                continue;
            }
        }
        let Some(entry) = engine.catalog.find_by_id(*catalog_id).await? else {
            continue;
        };
        let pages = engine
            .store()
            .pages_by_catalog(*catalog_id)
            .await?
            .into_iter()
            .filter(|p| p.concept_ids.contains(&concept.id))
            .map(|p| p.page_number)
            .collect();
        sources.push(ConceptSource {
            title: entry.title,
            pages,
            match_type: "primary".to_string(),
            via_concept: None,
        });
    }

    // Related sources reached through adjacent concepts.
    let mut related_names: Vec<String> = Vec::new();
    for related_id in concept.adjacent_ids.iter().chain(concept.related_ids.iter()) {
        let Some(related) = engine.concepts.find_by_id(*related_id).await? else {
            continue;
        };
        if !related_names.contains(&related.name) {
            related_names.push(related.name.clone());
        }
        for catalog_id in &related.catalog_ids {
            if concept.catalog_ids.contains(catalog_id) {
                continue;
            }
            if let Some(filter) = source_filter_id {
                if *catalog_id != filter {
                    continue;
                }
            }
            let Some(entry) = engine.catalog.find_by_id(*catalog_id).await? else {
                continue;
            };
            if sources.iter().any(|s| s.title == entry.title) {
                continue;
            }
            sources.push(ConceptSource {
                title: entry.title,
                pages: Vec::new(),
                match_type: "related".to_string(),
                via_concept: Some(related.name.clone()),
            });
        }
    }

    // Chunk fan-out via concept.chunk_ids.
    let mut chunks: Vec<ConceptChunk> = Vec::new();
    for chunk_id in &concept.chunk_ids {
        if chunks.len() >= limit {
            break;
        }
        let Some(chunk) = engine.chunks.find_by_id(*chunk_id).await? else {
            continue;
        };
        if let Some(filter) = source_filter_id {
            if chunk.catalog_id != filter {
                continue;
            }
        }
        let title = engine
            .catalog
            .find_by_id(chunk.catalog_id)
            .await?
            .map(|e| e.title)
            .unwrap_or_default();
        let concept_names = {
            let mut names = Vec::new();
            for id in &chunk.concept_ids {
                if let Some(c) = engine.concepts.find_by_id(*id).await? {
                    names.push(c.name);
                }
            }
            names
        };
        chunks.push(ConceptChunk {
            text: chunk.text,
            title,
            page: chunk.page_number,
            concept_density: chunk.concept_density,
            concepts: concept_names,
        });
    }

    let stats = ConceptStats {
        total_sources: sources.len(),
        total_chunks: concept.chunk_ids.len(),
        related_count: related_names.len(),
    };

    // Score trace for the resolved concept, debug mode only.
    let scores = if request.debug {
        let options = SearchOptions {
            limit: 1,
            debug: true,
            catalog_filter: None,
        };
        engine
            .search
            .search(Collection::Concepts, &concept.name, &options)
            .await?
            .into_iter()
            .find(|hit| hit.id == concept.id)
            .map(|hit| hit.scores)
    } else {
        None
    };

    Ok(ConceptSearchResponse {
        concept: concept.name.clone(),
        concept_id: concept.id,
        summary: concept.summary.clone(),
        related_concepts: related_names,
        synonyms: concept.synonyms.clone(),
        broader_terms: concept.broader_terms.clone(),
        narrower_terms: concept.narrower_terms.clone(),
        sources,
        chunks,
        stats,
        scores,
    })
}

// ============ Concept extraction views ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFormat {
    Json,
    Markdown,
}

impl ExtractFormat {
    pub fn parse(s: &str) -> Self {
        match s {
            "markdown" => ExtractFormat::Markdown,
            _ => ExtractFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractConceptsResponse {
    pub source: String,
    pub title: String,
    pub format: String,
    pub content: String,
}

/// Render a document's indexed concepts as JSON or Markdown.
pub async fn extract_concepts(
    engine: &Engine,
    document_query: &str,
    format: ExtractFormat,
    include_summary: bool,
) -> OpResult<ExtractConceptsResponse> {
    require_query(document_query)?;
    let Some(entry) = engine.catalog.find_by_source(document_query).await? else {
        return Err(OpError::not_found(format!(
            "no document matches: {}",
            document_query
        )));
    };

    let mut concepts = Vec::new();
    for id in &entry.concept_ids {
        if let Some(concept) = engine.concepts.find_by_id(*id).await? {
            concepts.push(concept);
        }
    }

    let content = match format {
        ExtractFormat::Json => {
            let items: Vec<Value> = concepts
                .iter()
                .map(|c| {
                    if include_summary {
                        serde_json::json!({"name": c.name, "summary": c.summary, "type": c.concept_type.as_str()})
                    } else {
                        serde_json::json!(c.name)
                    }
                })
                .collect();
            serde_json::to_string_pretty(&serde_json::json!({
                "source": entry.source,
                "concepts": items,
                "categories": entry.category_names,
            }))
            .map_err(|e| OpError::from(EngineError::from(e)))?
        }
        ExtractFormat::Markdown => {
            let mut out = format!("# {}\n\n## Concepts\n\n", entry.title);
            for c in &concepts {
                if include_summary && !c.summary.is_empty() {
                    out.push_str(&format!("- **{}** — {}\n", c.name, c.summary));
                } else {
                    out.push_str(&format!("- {}\n", c.name));
                }
            }
            if !entry.category_names.is_empty() {
                out.push_str("\n## Categories\n\n");
                for name in &entry.category_names {
                    out.push_str(&format!("- {}\n", name));
                }
            }
            out
        }
    };

    Ok(ExtractConceptsResponse {
        source: entry.source,
        title: entry.title,
        format: match format {
            ExtractFormat::Json => "json".to_string(),
            ExtractFormat::Markdown => "markdown".to_string(),
        },
        content,
    })
}

// ============ Concept <-> source fan-out ============

#[derive(Debug, Clone, Serialize)]
pub struct SourceWithConcepts {
    pub source: String,
    pub title: String,
    /// Input positions of the concepts this source carries.
    pub concept_indices: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Deduplicated union of sources across the input concepts, each tagged
/// with the indices of the concepts it carries.
pub async fn source_concepts(
    engine: &Engine,
    concepts: &[String],
    include_metadata: bool,
) -> OpResult<Vec<SourceWithConcepts>> {
    if concepts.is_empty() {
        return Err(OpError::validation("at least one concept required"));
    }

    let mut out: Vec<SourceWithConcepts> = Vec::new();
    for (index, name) in concepts.iter().enumerate() {
        let entries = engine
            .catalog
            .find_bibliography_for_concept(name, include_metadata)
            .await?;
        for entry in entries {
            match out.iter_mut().find(|s| s.source == entry.source) {
                Some(existing) => {
                    if !existing.concept_indices.contains(&index) {
                        existing.concept_indices.push(index);
                    }
                }
                None => out.push(SourceWithConcepts {
                    metadata: include_metadata.then(|| metadata_json(&entry)),
                    source: entry.source,
                    title: entry.title,
                    concept_indices: vec![index],
                }),
            }
        }
    }
    out.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub source: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Position-preserving source lists, one per input concept, not
/// deduplicated across positions.
pub async fn concept_sources(
    engine: &Engine,
    concepts: &[String],
    include_metadata: bool,
) -> OpResult<Vec<Vec<SourceRef>>> {
    if concepts.is_empty() {
        return Err(OpError::validation("at least one concept required"));
    }

    let mut out = Vec::with_capacity(concepts.len());
    for name in concepts {
        let entries = engine
            .catalog
            .find_bibliography_for_concept(name, include_metadata)
            .await?;
        out.push(
            entries
                .into_iter()
                .map(|entry| SourceRef {
                    metadata: include_metadata.then(|| metadata_json(&entry)),
                    source: entry.source,
                    title: entry.title,
                })
                .collect(),
        );
    }
    Ok(out)
}

fn metadata_json(entry: &CatalogEntry) -> Value {
    serde_json::json!({
        "author": entry.author,
        "authors": entry.authors,
        "year": entry.year,
        "publisher": entry.publisher,
        "isbn": entry.isbn,
        "doi": entry.doi,
        "document_type": entry.document_type.as_str(),
    })
}

// ============ Category operations ============

#[derive(Debug, Clone, Serialize)]
pub struct CategoryInfo {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
    pub document_count: u32,
    pub chunk_count: u32,
    pub concept_count: u32,
}

impl From<crate::models::Category> for CategoryInfo {
    fn from(c: crate::models::Category) -> Self {
        Self {
            id: c.id,
            name: c.name,
            description: c.description,
            aliases: c.aliases,
            document_count: c.document_count,
            chunk_count: c.chunk_count,
            concept_count: c.concept_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef {
    pub source: String,
    pub title: String,
    pub document_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatistics {
    pub total_documents: u32,
    pub total_chunks: u32,
    pub total_concepts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategorySearchResponse {
    pub category: CategoryInfo,
    pub documents: Vec<DocumentRef>,
    pub statistics: CategoryStatistics,
}

/// Resolve a category by name or alias and list its documents.
pub async fn category_search(
    engine: &Engine,
    category: &str,
    include_children: bool,
    limit: usize,
) -> OpResult<CategorySearchResponse> {
    require_query(category)?;
    let Some(resolved) = engine.categories.resolve(category).await? else {
        return Err(OpError::not_found(format!("no category matches: {}", category)));
    };

    let documents = engine
        .categories
        .documents_in(category, include_children, limit)
        .await?
        .into_iter()
        .map(|entry| DocumentRef {
            source: entry.source,
            title: entry.title,
            document_type: entry.document_type.as_str().to_string(),
        })
        .collect();

    Ok(CategorySearchResponse {
        statistics: CategoryStatistics {
            total_documents: resolved.document_count,
            total_chunks: resolved.chunk_count,
            total_concepts: resolved.concept_count,
        },
        category: resolved.into(),
        documents,
    })
}

/// List categories with sorting and optional substring filter.
pub async fn list_categories(
    engine: &Engine,
    sort_by: &str,
    limit: usize,
    search: Option<&str>,
) -> OpResult<Vec<CategoryInfo>> {
    let categories = engine
        .categories
        .list(CategorySort::parse(sort_by), limit, search)
        .await?;
    Ok(categories.into_iter().map(CategoryInfo::from).collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptInCategory {
    pub name: String,
    pub summary: String,
    pub document_count: u32,
}

/// Concepts present in a category's documents.
pub async fn list_concepts_in_category(
    engine: &Engine,
    category: &str,
    sort_by: &str,
    limit: usize,
) -> OpResult<Vec<ConceptInCategory>> {
    require_query(category)?;
    if engine.categories.resolve(category).await?.is_none() {
        return Err(OpError::not_found(format!("no category matches: {}", category)));
    }
    let concepts = engine
        .categories
        .concepts_in(category, ConceptSort::parse(sort_by), limit)
        .await?;
    Ok(concepts
        .into_iter()
        .map(|(concept, document_count)| ConceptInCategory {
            name: concept.name,
            summary: concept.summary,
            document_count,
        })
        .collect())
}

fn require_query(text: &str) -> OpResult<()> {
    if text.trim().is_empty() {
        return Err(OpError::validation("query must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_is_validation_error() {
        let err = require_query("   ").unwrap_err();
        assert_eq!(err.error_kind, "validation");
        assert!(err.is_error);
    }

    #[test]
    fn engine_error_maps_to_envelope() {
        let err: OpError = EngineError::RateLimited {
            message: "slow down".to_string(),
            retry_after_ms: Some(5000),
        }
        .into();
        assert_eq!(err.error_kind, "rate_limited");
        assert!(err.is_error);
    }

    #[test]
    fn extract_format_parse() {
        assert_eq!(ExtractFormat::parse("markdown"), ExtractFormat::Markdown);
        assert_eq!(ExtractFormat::parse("json"), ExtractFormat::Json);
        assert_eq!(ExtractFormat::parse("anything"), ExtractFormat::Json);
    }
}
