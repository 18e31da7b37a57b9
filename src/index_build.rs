//! Index build: per-document LLM outputs → the four-table snapshot.
//!
//! The build is deterministic over its inputs. Concept names are
//! normalized and merged across documents (thematic type wins on conflict,
//! the first summary is kept, relation arrays are unioned). Reverse edges
//! (`concept.catalog_ids`, `concept.chunk_ids`), the co-occurrence graph,
//! the lexical relation graph, prevalence weights, category counts, and
//! every denormalized name array are recomputed from scratch.
//!
//! Everything is written to a staging database which is then renamed onto
//! the live snapshot, so concurrent readers see either the full old state
//! or the full new one. A referential-integrity sweep runs before the
//! swap; a dangling ID aborts the build as fatal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::embedding::EmbeddingService;
use crate::error::{EngineError, Result};
use crate::ids::{self, normalize_name, Id};
use crate::llm::{ChatClient, ChatMessage, ChatRequest, ExtractedConcepts};
use crate::loader::{DocMetadata, DocPage};
use crate::models::{
    Category, CatalogEntry, Chunk, Concept, ConceptType, DocumentType, Page,
};
use crate::store::TableStore;

/// Neighbours kept per concept in the co-occurrence and lexical graphs.
const TOP_K_NEIGHBOURS: usize = 16;
/// Minimum token length counted by the lexical relation graph.
const LEXICAL_MIN_TOKEN: usize = 4;
/// Page preview cap.
const PAGE_PREVIEW_CHARS: usize = 500;

/// Curated alias seed applied on top of LLM category output.
const CURATED_ALIASES: &[(&str, &[&str])] = &[
    ("software engineering", &["SWE"]),
    ("machine learning", &["ML"]),
    ("artificial intelligence", &["AI"]),
    ("natural language processing", &["NLP"]),
    ("user experience", &["UX"]),
    ("operations research", &["OR"]),
];

/// Everything the pipeline produced for one document.
#[derive(Debug, Clone)]
pub struct DocumentBundle {
    pub source: String,
    pub document_hash: String,
    pub title: String,
    pub document_type: DocumentType,
    pub metadata: DocMetadata,
    pub pages: Vec<DocPage>,
    pub chunks: Vec<Chunk>,
    pub extracted: ExtractedConcepts,
    pub overview: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSummary {
    pub documents: usize,
    pub chunks: usize,
    pub concepts: usize,
    pub categories: usize,
    pub pages: usize,
}

struct MergedConcept {
    id: Id,
    name: String,
    summary: String,
    concept_type: ConceptType,
    catalog_ids: BTreeSet<Id>,
    chunk_ids: BTreeSet<Id>,
    synonyms: BTreeSet<String>,
    broader_terms: BTreeSet<String>,
    narrower_terms: BTreeSet<String>,
}

struct MergedCategory {
    id: Id,
    name: String,
    aliases: BTreeSet<String>,
    catalog_ids: BTreeSet<Id>,
}

/// Build the snapshot from `bundles` and swap it in.
pub async fn build_index(
    db_root: &Path,
    bundles: &[DocumentBundle],
    embeddings: &EmbeddingService,
    describer: Option<(Arc<dyn ChatClient>, String)>,
) -> Result<BuildSummary> {
    info!(documents = bundles.len(), "index build started");

    // ---- Merge concepts across documents (normalized name keyed).
    let mut concepts: BTreeMap<String, MergedConcept> = BTreeMap::new();
    // Per document: concept ids in first-seen order.
    let mut doc_concepts: HashMap<Id, Vec<Id>> = HashMap::new();

    for bundle in bundles {
        let catalog_id = ids::catalog_id(&bundle.source);
        let mut ordered: Vec<Id> = Vec::new();
        for seed in &bundle.extracted.primary_concepts {
            let norm = normalize_name(&seed.name);
            if norm.is_empty() {
                continue;
            }
            let concept_id = ids::concept_id(&seed.name);
            let entry = concepts.entry(norm.clone()).or_insert_with(|| MergedConcept {
                id: concept_id,
                name: norm.clone(),
                summary: String::new(),
                concept_type: ConceptType::Terminology,
                catalog_ids: BTreeSet::new(),
                chunk_ids: BTreeSet::new(),
                synonyms: BTreeSet::new(),
                broader_terms: BTreeSet::new(),
                narrower_terms: BTreeSet::new(),
            });
            if entry.summary.is_empty() {
                if let Some(summary) = &seed.summary {
                    entry.summary = summary.clone();
                }
            }
            // Thematic wins when a concept appears with both types.
            if seed.concept_type.as_deref() != Some("terminology") {
                entry.concept_type = ConceptType::Thematic;
            }
            entry.catalog_ids.insert(catalog_id);
            entry.synonyms.extend(seed.synonyms.iter().cloned());
            entry.broader_terms.extend(seed.broader_terms.iter().cloned());
            entry
                .narrower_terms
                .extend(seed.narrower_terms.iter().cloned());
            if !ordered.contains(&concept_id) {
                ordered.push(concept_id);
            }
        }
        doc_concepts.insert(catalog_id, ordered);
    }

    let concept_names_by_id: HashMap<Id, String> = concepts
        .values()
        .map(|c| (c.id, c.name.clone()))
        .collect();

    // ---- Chunk and page concept attribution by whole-phrase match.
    let mut all_chunks: Vec<Chunk> = Vec::new();
    let mut all_pages: Vec<Page> = Vec::new();

    for bundle in bundles {
        let catalog_id = ids::catalog_id(&bundle.source);
        let doc_concept_ids = doc_concepts.get(&catalog_id).cloned().unwrap_or_default();
        let doc_names: Vec<(Id, String)> = doc_concept_ids
            .iter()
            .filter_map(|id| concept_names_by_id.get(id).map(|n| (*id, n.clone())))
            .collect();

        for chunk in &bundle.chunks {
            let mut chunk = chunk.clone();
            let text_norm = normalize_name(&chunk.text);
            chunk.concept_ids = doc_names
                .iter()
                .filter(|(_, name)| contains_phrase(&text_norm, name))
                .map(|(id, _)| *id)
                .collect();
            chunk.concept_density = if doc_concept_ids.is_empty() {
                0.0
            } else {
                chunk.concept_ids.len() as f32 / doc_concept_ids.len() as f32
            };
            for id in &chunk.concept_ids {
                if let Some(name) = concept_names_by_id.get(id) {
                    if let Some(merged) = concepts.get_mut(name) {
                        merged.chunk_ids.insert(chunk.id);
                    }
                }
            }
            all_chunks.push(chunk);
        }

        for page in &bundle.pages {
            let Some(page_number) = page.page_number else {
                continue;
            };
            let text_norm = normalize_name(&page.text);
            let concept_ids: Vec<Id> = doc_names
                .iter()
                .filter(|(_, name)| contains_phrase(&text_norm, name))
                .map(|(id, _)| *id)
                .collect();
            all_pages.push(Page {
                id: ids::page_id(catalog_id, page_number),
                catalog_id,
                page_number,
                concept_ids,
                text_preview: truncate_chars(&page.text, PAGE_PREVIEW_CHARS),
                vector: Vec::new(),
            });
        }
    }

    // ---- Co-occurrence graph over per-document concept sets.
    let mut pair_counts: HashMap<(Id, Id), u32> = HashMap::new();
    for ordered in doc_concepts.values() {
        for i in 0..ordered.len() {
            for j in (i + 1)..ordered.len() {
                // Canonical ordering to avoid double-counting.
                let (a, b) = if ordered[i] <= ordered[j] {
                    (ordered[i], ordered[j])
                } else {
                    (ordered[j], ordered[i])
                };
                *pair_counts.entry((a, b)).or_insert(0) += 1;
            }
        }
    }
    let mut neighbours: HashMap<Id, Vec<(Id, u32)>> = HashMap::new();
    for ((a, b), count) in &pair_counts {
        neighbours.entry(*a).or_default().push((*b, *count));
        neighbours.entry(*b).or_default().push((*a, *count));
    }
    let adjacent: HashMap<Id, Vec<Id>> = neighbours
        .into_iter()
        .map(|(id, mut edges)| {
            edges.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
            edges.truncate(TOP_K_NEIGHBOURS);
            (id, edges.into_iter().map(|(n, _)| n).collect())
        })
        .collect();

    // ---- Lexical relation graph over name tokens.
    let related = lexical_relations(&concepts);

    // ---- Prevalence weights saturating at the 95th percentile.
    let mut doc_counts: Vec<usize> = concepts.values().map(|c| c.catalog_ids.len()).collect();
    doc_counts.sort_unstable();
    let p95 = percentile(&doc_counts, 0.95).max(1) as f32;

    // ---- Categories: LLM output union, curated alias seed, counts.
    let mut categories: BTreeMap<String, MergedCategory> = BTreeMap::new();
    for bundle in bundles {
        let catalog_id = ids::catalog_id(&bundle.source);
        for name in &bundle.extracted.categories {
            let norm = normalize_name(name);
            if norm.is_empty() {
                continue;
            }
            let entry = categories.entry(norm.clone()).or_insert_with(|| MergedCategory {
                id: ids::category_id(name),
                name: norm.clone(),
                aliases: BTreeSet::new(),
                catalog_ids: BTreeSet::new(),
            });
            entry.catalog_ids.insert(catalog_id);
        }
    }
    for (name, aliases) in CURATED_ALIASES {
        if let Some(entry) = categories.get_mut(*name) {
            entry.aliases.extend(aliases.iter().map(|a| a.to_string()));
        }
    }

    let descriptions = describe_categories(db_root, &categories, describer).await?;

    // ---- Assemble catalog rows with derived name arrays.
    let category_ids_by_doc: HashMap<Id, Vec<Id>> = {
        let mut map: HashMap<Id, Vec<Id>> = HashMap::new();
        for category in categories.values() {
            for doc in &category.catalog_ids {
                map.entry(*doc).or_default().push(category.id);
            }
        }
        for ids in map.values_mut() {
            ids.sort_unstable();
        }
        map
    };
    let category_names_by_id: HashMap<Id, String> = categories
        .values()
        .map(|c| (c.id, c.name.clone()))
        .collect();

    let mut catalog_rows: Vec<CatalogEntry> = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let catalog_id = ids::catalog_id(&bundle.source);
        let concept_ids = doc_concepts.get(&catalog_id).cloned().unwrap_or_default();
        let category_ids = category_ids_by_doc
            .get(&catalog_id)
            .cloned()
            .unwrap_or_default();
        let concept_names: Vec<String> = concept_ids
            .iter()
            .filter_map(|id| concept_names_by_id.get(id).cloned())
            .collect();
        let category_names: Vec<String> = category_ids
            .iter()
            .filter_map(|id| category_names_by_id.get(id).cloned())
            .collect();

        catalog_rows.push(CatalogEntry {
            id: catalog_id,
            source: bundle.source.clone(),
            title: bundle.title.clone(),
            author: bundle.metadata.author.clone(),
            authors: bundle.metadata.authors.clone(),
            year: bundle.metadata.year,
            publisher: bundle.metadata.publisher.clone(),
            isbn: bundle.metadata.isbn.clone(),
            doi: bundle.metadata.doi.clone(),
            arxiv_id: bundle.metadata.arxiv_id.clone(),
            venue: bundle.metadata.venue.clone(),
            keywords: bundle.metadata.keywords.clone(),
            abstract_text: bundle.metadata.abstract_text.clone(),
            document_type: bundle.document_type,
            summary: bundle.overview.clone(),
            vector: Vec::new(),
            concept_ids,
            category_ids,
            concept_names,
            category_names,
        });
    }

    let titles_by_doc: HashMap<Id, String> = catalog_rows
        .iter()
        .map(|c| (c.id, c.title.clone()))
        .collect();

    // ---- Materialize concept rows.
    let mut concept_rows: Vec<Concept> = concepts
        .values()
        .map(|merged| {
            let catalog_titles = merged
                .catalog_ids
                .iter()
                .filter_map(|id| titles_by_doc.get(id).cloned())
                .collect();
            Concept {
                id: merged.id,
                name: merged.name.clone(),
                summary: merged.summary.clone(),
                concept_type: merged.concept_type,
                catalog_ids: merged.catalog_ids.iter().copied().collect(),
                chunk_ids: merged.chunk_ids.iter().copied().collect(),
                adjacent_ids: adjacent.get(&merged.id).cloned().unwrap_or_default(),
                related_ids: related.get(&merged.id).cloned().unwrap_or_default(),
                synonyms: merged.synonyms.iter().cloned().collect(),
                broader_terms: merged.broader_terms.iter().cloned().collect(),
                narrower_terms: merged.narrower_terms.iter().cloned().collect(),
                weight: (merged.catalog_ids.len() as f32 / p95).clamp(0.0, 1.0),
                vector: Vec::new(),
                catalog_titles,
            }
        })
        .collect();

    // ---- Materialize category rows with counts.
    let chunks_by_doc: HashMap<Id, u32> = {
        let mut map: HashMap<Id, u32> = HashMap::new();
        for chunk in &all_chunks {
            *map.entry(chunk.catalog_id).or_insert(0) += 1;
        }
        map
    };
    let mut category_rows: Vec<Category> = categories
        .values()
        .map(|merged| {
            let chunk_count = merged
                .catalog_ids
                .iter()
                .map(|id| chunks_by_doc.get(id).copied().unwrap_or(0))
                .sum();
            let concept_count = concept_rows
                .iter()
                .filter(|c| c.catalog_ids.iter().any(|id| merged.catalog_ids.contains(id)))
                .count() as u32;
            Category {
                id: merged.id,
                name: merged.name.clone(),
                description: descriptions.get(&merged.name).cloned().unwrap_or_default(),
                parent_id: None,
                aliases: merged.aliases.iter().cloned().collect(),
                related_ids: Vec::new(),
                document_count: merged.catalog_ids.len() as u32,
                chunk_count,
                concept_count,
                vector: Vec::new(),
            }
        })
        .collect();

    // ---- Vectors.
    for row in catalog_rows.iter_mut() {
        let basis = if row.summary.is_empty() {
            row.title.clone()
        } else {
            format!("{} {}", row.title, row.summary)
        };
        row.vector = embeddings.embed(&basis).await?;
    }
    for chunk in all_chunks.iter_mut() {
        chunk.vector = embeddings.embed(&chunk.text).await?;
    }
    for concept in concept_rows.iter_mut() {
        concept.vector = embeddings
            .embed(&format!("{} {}", concept.name, concept.summary))
            .await?;
    }
    for category in category_rows.iter_mut() {
        category.vector = embeddings
            .embed(&format!("{} {}", category.name, category.description))
            .await?;
    }
    for page in all_pages.iter_mut() {
        page.vector = embeddings.embed(&page.text_preview).await?;
    }

    // ---- Referential integrity before the swap.
    verify_integrity(&catalog_rows, &all_chunks, &concept_rows, &category_rows)?;

    // ---- Write staging, swap atomically.
    let staging = TableStore::open_staging(db_root).await?;
    for row in &catalog_rows {
        staging.put_catalog(row).await?;
    }
    for chunk in &all_chunks {
        staging.put_chunk(chunk).await?;
    }
    for concept in &concept_rows {
        staging.put_concept(concept).await?;
    }
    for category in &category_rows {
        staging.put_category(category).await?;
    }
    for page in &all_pages {
        staging.put_page(page).await?;
    }
    staging.close().await;
    TableStore::commit_staging(db_root)?;

    let summary = BuildSummary {
        documents: catalog_rows.len(),
        chunks: all_chunks.len(),
        concepts: concept_rows.len(),
        categories: category_rows.len(),
        pages: all_pages.len(),
    };
    info!(
        documents = summary.documents,
        chunks = summary.chunks,
        concepts = summary.concepts,
        categories = summary.categories,
        "index build complete"
    );
    Ok(summary)
}

/// Lexical relations: two concepts relate when they share a token of
/// length >= 4 and neither name is a substring of the other.
fn lexical_relations(concepts: &BTreeMap<String, MergedConcept>) -> HashMap<Id, Vec<Id>> {
    let tokenized: Vec<(Id, &str, BTreeSet<&str>)> = concepts
        .values()
        .map(|c| {
            let tokens: BTreeSet<&str> = c
                .name
                .split_whitespace()
                .filter(|t| t.len() >= LEXICAL_MIN_TOKEN)
                .collect();
            (c.id, c.name.as_str(), tokens)
        })
        .collect();

    let mut related: HashMap<Id, Vec<(Id, usize)>> = HashMap::new();
    for i in 0..tokenized.len() {
        for j in (i + 1)..tokenized.len() {
            let (id_a, name_a, tokens_a) = &tokenized[i];
            let (id_b, name_b, tokens_b) = &tokenized[j];
            if name_a.contains(name_b) || name_b.contains(name_a) {
                continue;
            }
            let shared = tokens_a.intersection(tokens_b).count();
            if shared > 0 {
                related.entry(*id_a).or_default().push((*id_b, shared));
                related.entry(*id_b).or_default().push((*id_a, shared));
            }
        }
    }

    related
        .into_iter()
        .map(|(id, mut edges)| {
            edges.sort_by(|x, y| y.1.cmp(&x.1).then(x.0.cmp(&y.0)));
            edges.truncate(TOP_K_NEIGHBOURS);
            (id, edges.into_iter().map(|(n, _)| n).collect())
        })
        .collect()
}

/// LLM post-pass for category descriptions, at most once per new category
/// via an incremental cache keyed by category name.
async fn describe_categories(
    db_root: &Path,
    categories: &BTreeMap<String, MergedCategory>,
    describer: Option<(Arc<dyn ChatClient>, String)>,
) -> Result<HashMap<String, String>> {
    let cache_path = db_root.join(".category-cache.json");
    let mut known: HashMap<String, String> = match std::fs::read_to_string(&cache_path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => HashMap::new(),
    };

    if let Some((chat, model)) = describer {
        let mut dirty = false;
        for name in categories.keys() {
            if known.contains_key(name) {
                continue;
            }
            let request = ChatRequest {
                model: model.clone(),
                messages: vec![
                    ChatMessage::system(
                        "Describe the given document category in one sentence. Respond with the sentence only.",
                    ),
                    ChatMessage::user(name.clone()),
                ],
                max_tokens: 128,
                temperature: 0.3,
            };
            match chat.chat(request).await {
                Ok(response) => {
                    known.insert(name.clone(), response.text.trim().to_string());
                    dirty = true;
                }
                Err(e) => {
                    // A missing description is cosmetic; the build goes on.
                    warn!(category = %name, error = %e, "category description failed");
                }
            }
        }
        if dirty {
            std::fs::create_dir_all(db_root)?;
            std::fs::write(&cache_path, serde_json::to_string_pretty(&known)?)?;
        }
    }

    Ok(known)
}

fn verify_integrity(
    catalog: &[CatalogEntry],
    chunks: &[Chunk],
    concepts: &[Concept],
    categories: &[Category],
) -> Result<()> {
    let catalog_ids: BTreeSet<Id> = catalog.iter().map(|c| c.id).collect();
    let chunk_ids: BTreeSet<Id> = chunks.iter().map(|c| c.id).collect();
    let concept_ids: BTreeSet<Id> = concepts.iter().map(|c| c.id).collect();
    let category_ids: BTreeSet<Id> = categories.iter().map(|c| c.id).collect();

    let check = |ids: &[Id], table: &BTreeSet<Id>, what: &str| -> Result<()> {
        for id in ids {
            if !table.contains(id) {
                return Err(EngineError::Fatal(format!(
                    "dangling {} reference: {}",
                    what, id
                )));
            }
        }
        Ok(())
    };

    for entry in catalog {
        check(&entry.concept_ids, &concept_ids, "concept")?;
        check(&entry.category_ids, &category_ids, "category")?;
    }
    for chunk in chunks {
        check(&[chunk.catalog_id], &catalog_ids, "catalog")?;
        check(&chunk.concept_ids, &concept_ids, "concept")?;
    }
    for concept in concepts {
        check(&concept.catalog_ids, &catalog_ids, "catalog")?;
        check(&concept.chunk_ids, &chunk_ids, "chunk")?;
        check(&concept.adjacent_ids, &concept_ids, "concept")?;
        check(&concept.related_ids, &concept_ids, "concept")?;
    }
    Ok(())
}

/// Whole-phrase containment with non-alphanumeric boundaries on both
/// sides; `war` must not match inside `software`.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(phrase) {
        let start = from + pos;
        let end = start + phrase.len();
        let left_ok = start == 0
            || !haystack[..start]
                .chars()
                .next_back()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false);
        let right_ok = end == haystack.len()
            || !haystack[end..]
                .chars()
                .next()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false);
        if left_ok && right_ok {
            return true;
        }
        from = end;
    }
    false
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[usize], p: f64) -> usize {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::TextChunker;
    use crate::embedding::SimpleEmbedder;
    use crate::llm::parse_concepts_json;
    use tempfile::TempDir;

    fn bundle(source: &str, title: &str, text: &str, concepts_json: &str) -> DocumentBundle {
        let catalog_id = ids::catalog_id(source);
        let pages = vec![DocPage {
            page_number: Some(1),
            text: text.to_string(),
        }];
        let chunks = TextChunker::default().chunk_document(catalog_id, &pages);
        DocumentBundle {
            source: source.to_string(),
            document_hash: ids::content_hash(text.as_bytes()),
            title: title.to_string(),
            document_type: DocumentType::Book,
            metadata: DocMetadata::default(),
            pages,
            chunks,
            extracted: parse_concepts_json(concepts_json).unwrap(),
            overview: format!("Overview of {}.", title),
        }
    }

    fn service() -> EmbeddingService {
        EmbeddingService::new(Arc::new(SimpleEmbedder), 4096)
    }

    fn two_bundles() -> Vec<DocumentBundle> {
        vec![
            bundle(
                "/docs/a.pdf",
                "Alpha",
                "Innovation and disruption shape markets. Innovation everywhere.",
                r#"{"primary_concepts": [
                    {"name": "Innovation", "summary": "New ideas.", "type": "thematic"},
                    {"name": "disruption", "type": "terminology"}
                ], "categories": ["Business Strategy"]}"#,
            ),
            bundle(
                "/docs/b.pdf",
                "Beta",
                "Innovation requires disciplined product management across markets.",
                r#"{"primary_concepts": [
                    "innovation",
                    {"name": "product management", "summary": "Owning outcomes."}
                ], "categories": ["Business Strategy", "Management"]}"#,
            ),
        ]
    }

    #[tokio::test]
    async fn build_merges_duplicate_concepts() {
        let tmp = TempDir::new().unwrap();
        let summary = build_index(tmp.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        assert_eq!(summary.documents, 2);
        assert_eq!(summary.concepts, 3);
        assert_eq!(summary.categories, 2);

        let store = TableStore::open(tmp.path()).await.unwrap();
        let innovation = store.concept_by_name("innovation").await.unwrap().unwrap();
        assert_eq!(innovation.catalog_ids.len(), 2);
        assert_eq!(innovation.summary, "New ideas.");
        assert_eq!(innovation.concept_type, ConceptType::Thematic);
        store.close().await;
    }

    #[tokio::test]
    async fn reverse_edges_are_symmetric() {
        let tmp = TempDir::new().unwrap();
        build_index(tmp.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();

        let catalog = store.all_catalog().await.unwrap();
        let concepts = store.all_concepts().await.unwrap();
        for doc in &catalog {
            for cid in &doc.concept_ids {
                let concept = concepts.iter().find(|c| c.id == *cid).unwrap();
                assert!(concept.catalog_ids.contains(&doc.id));
            }
        }
        for concept in &concepts {
            for did in &concept.catalog_ids {
                let doc = catalog.iter().find(|d| d.id == *did).unwrap();
                assert!(doc.concept_ids.contains(&concept.id));
            }
        }
        store.close().await;
    }

    #[tokio::test]
    async fn chunk_concepts_and_density_populated() {
        let tmp = TempDir::new().unwrap();
        build_index(tmp.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();

        let chunks = store.all_chunks().await.unwrap();
        let with_concepts: Vec<_> = chunks.iter().filter(|c| !c.concept_ids.is_empty()).collect();
        assert!(!with_concepts.is_empty());
        for chunk in &chunks {
            assert!((0.0..=1.0).contains(&chunk.concept_density));
        }
        store.close().await;
    }

    #[tokio::test]
    async fn cooccurrence_links_concepts_sharing_documents() {
        let tmp = TempDir::new().unwrap();
        build_index(tmp.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        let innovation = store.concept_by_name("innovation").await.unwrap().unwrap();
        let disruption = store.concept_by_name("disruption").await.unwrap().unwrap();
        assert!(innovation.adjacent_ids.contains(&disruption.id));
        assert!(disruption.adjacent_ids.contains(&innovation.id));
        store.close().await;
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let tmp = TempDir::new().unwrap();
        build_index(tmp.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        for entry in store.all_catalog().await.unwrap() {
            let norm: f32 = entry.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
        for chunk in store.all_chunks().await.unwrap() {
            let norm: f32 = chunk.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
        store.close().await;
    }

    #[tokio::test]
    async fn rebuild_is_id_stable() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();
        build_index(tmp1.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();
        build_index(tmp2.path(), &two_bundles(), &service(), None)
            .await
            .unwrap();

        let store1 = TableStore::open(tmp1.path()).await.unwrap();
        let store2 = TableStore::open(tmp2.path()).await.unwrap();
        let ids1: Vec<Id> = store1.all_concepts().await.unwrap().iter().map(|c| c.id).collect();
        let ids2: Vec<Id> = store2.all_concepts().await.unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids1, ids2);
        store1.close().await;
        store2.close().await;
    }

    #[tokio::test]
    async fn zero_concept_document_still_indexed() {
        let tmp = TempDir::new().unwrap();
        let bundles = vec![bundle(
            "/docs/empty.pdf",
            "Empty",
            "Some text without much substance.",
            r#"{"primary_concepts": [], "categories": []}"#,
        )];
        build_index(tmp.path(), &bundles, &service(), None)
            .await
            .unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        let entry = store
            .get_catalog(ids::catalog_id("/docs/empty.pdf"))
            .await
            .unwrap()
            .unwrap();
        assert!(entry.concept_ids.is_empty());
        assert!(!entry.summary.is_empty());
        store.close().await;
    }

    #[test]
    fn phrase_match_respects_boundaries() {
        assert!(contains_phrase("the art of software design", "software"));
        assert!(!contains_phrase("the art of software design", "war"));
        assert!(contains_phrase("a war story", "war"));
        assert!(contains_phrase("innovation, everywhere", "innovation"));
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted = vec![1, 1, 1, 2, 2, 3, 4, 5, 9, 20];
        assert_eq!(percentile(&sorted, 0.95), 20);
        assert_eq!(percentile(&sorted, 0.5), 2);
        assert_eq!(percentile(&[], 0.95), 0);
    }

    #[test]
    fn lexical_relations_share_tokens_not_substrings() {
        let mut concepts: BTreeMap<String, MergedConcept> = BTreeMap::new();
        for name in ["software design", "design thinking", "software design patterns"] {
            concepts.insert(
                name.to_string(),
                MergedConcept {
                    id: ids::concept_id(name),
                    name: name.to_string(),
                    summary: String::new(),
                    concept_type: ConceptType::Thematic,
                    catalog_ids: BTreeSet::new(),
                    chunk_ids: BTreeSet::new(),
                    synonyms: BTreeSet::new(),
                    broader_terms: BTreeSet::new(),
                    narrower_terms: BTreeSet::new(),
                },
            );
        }
        let related = lexical_relations(&concepts);
        let a = ids::concept_id("software design");
        let b = ids::concept_id("design thinking");
        let c = ids::concept_id("software design patterns");
        // Shared token "design" links a <-> b.
        assert!(related.get(&a).map(|r| r.contains(&b)).unwrap_or(false));
        // "software design" is a substring of "software design patterns":
        // excluded as a chain artifact.
        assert!(!related.get(&a).map(|r| r.contains(&c)).unwrap_or(false));
    }
}
