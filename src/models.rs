//! Core data models for the four tables and search results.
//!
//! Relationships between entities are expressed as arrays of hash IDs,
//! never as owning pointers; reverse edges and name arrays are derived by
//! the index build. Name arrays (`concept_names`, `category_names`,
//! `catalog_titles`) exist for display and keyword matching only and are
//! recomputed on every build.

use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// Coarse document classification inferred from format and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Book,
    Paper,
    Article,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Book => "book",
            DocumentType::Paper => "paper",
            DocumentType::Article => "article",
            DocumentType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "book" => DocumentType::Book,
            "paper" => DocumentType::Paper,
            "article" => DocumentType::Article,
            _ => DocumentType::Unknown,
        }
    }
}

/// Whether a concept names a theme or a term of art. Thematic concepts
/// expand aggressively at query time; terminology expands conservatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConceptType {
    Thematic,
    Terminology,
}

impl ConceptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Thematic => "thematic",
            ConceptType::Terminology => "terminology",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "terminology" => ConceptType::Terminology,
            _ => ConceptType::Thematic,
        }
    }
}

/// One ingested document: bibliographic metadata, LLM summary, and the
/// forward edges into the concept and category tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Id,
    /// Absolute filesystem path the document was loaded from.
    pub source: String,
    pub title: String,
    pub author: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub publisher: Option<String>,
    pub isbn: Option<String>,
    pub doi: Option<String>,
    pub arxiv_id: Option<String>,
    pub venue: Option<String>,
    pub keywords: Vec<String>,
    pub abstract_text: Option<String>,
    pub document_type: DocumentType,
    /// LLM content overview.
    pub summary: String,
    pub vector: Vec<f32>,
    pub concept_ids: Vec<Id>,
    pub category_ids: Vec<Id>,
    /// Derived. Rebuilt on every index build.
    pub concept_names: Vec<String>,
    /// Derived. Rebuilt on every index build.
    pub category_names: Vec<String>,
}

impl Default for DocumentType {
    fn default() -> Self {
        DocumentType::Unknown
    }
}

/// A contiguous text span of a document, ~1000 characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Id,
    pub catalog_id: Id,
    pub chunk_index: usize,
    pub text: String,
    /// SHA-256 of `text`; stable under re-ingestion of the same bytes.
    pub hash: String,
    /// 1-indexed. `None` for EPUB spine text.
    pub page_number: Option<u32>,
    pub concept_ids: Vec<Id>,
    /// Share of the parent catalog's concepts present in this chunk.
    pub concept_density: f32,
    pub vector: Vec<f32>,
}

/// An LLM-extracted, name-normalized concept with its reverse edges and
/// relation graphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: Id,
    pub name: String,
    /// One-sentence LLM summary, empty when the extractor returned a bare name.
    pub summary: String,
    pub concept_type: ConceptType,
    pub catalog_ids: Vec<Id>,
    pub chunk_ids: Vec<Id>,
    /// Top co-occurring concepts, by shared-catalog count.
    pub adjacent_ids: Vec<Id>,
    /// Lexically related concepts (shared word tokens).
    pub related_ids: Vec<Id>,
    pub synonyms: Vec<String>,
    pub broader_terms: Vec<String>,
    pub narrower_terms: Vec<String>,
    /// Prevalence weight in [0, 1], saturating at the 95th percentile of
    /// documents-per-concept.
    pub weight: f32,
    pub vector: Vec<f32>,
    /// Derived. Rebuilt on every index build.
    pub catalog_titles: Vec<String>,
}

/// A curated or emergent high-level topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub parent_id: Option<Id>,
    pub aliases: Vec<String>,
    pub related_ids: Vec<Id>,
    pub document_count: u32,
    pub chunk_count: u32,
    pub concept_count: u32,
    pub vector: Vec<f32>,
}

/// Intermediate per-page record, kept for page-level concept lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Id,
    pub catalog_id: Id,
    pub page_number: u32,
    pub concept_ids: Vec<Id>,
    /// At most 500 characters.
    pub text_preview: String,
    pub vector: Vec<f32>,
}

/// Per-signal score breakdown attached to every search hit.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Scores {
    pub vector: f64,
    pub bm25: f64,
    pub title: f64,
    pub concept: f64,
    pub wordnet: f64,
    pub hybrid: f64,
}

/// A scored row from the hybrid search service.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Id,
    /// Display title: catalog title, concept name, or the parent document
    /// title for chunk hits.
    pub title: String,
    /// Source path for catalog and chunk hits; empty for concepts.
    pub source: String,
    /// The scored text field (summary, chunk text, or name + summary).
    pub text: String,
    pub page_number: Option<u32>,
    /// Vector distance (`1 - cosine`) to the query.
    pub distance: f64,
    pub scores: Scores,
    pub matched_concepts: Vec<String>,
    pub expanded_terms: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_round_trips() {
        for t in [
            DocumentType::Book,
            DocumentType::Paper,
            DocumentType::Article,
            DocumentType::Unknown,
        ] {
            assert_eq!(DocumentType::parse(t.as_str()), t);
        }
        assert_eq!(DocumentType::parse("pamphlet"), DocumentType::Unknown);
    }

    #[test]
    fn concept_type_defaults_to_thematic() {
        assert_eq!(ConceptType::parse("thematic"), ConceptType::Thematic);
        assert_eq!(ConceptType::parse("terminology"), ConceptType::Terminology);
        assert_eq!(ConceptType::parse("other"), ConceptType::Thematic);
    }
}
