//! Category repository and the in-memory category index.
//!
//! The [`CategoryIndex`] is loaded once at startup (and reloaded after an
//! index build) from the category table; it provides O(1) name and alias
//! resolution plus hierarchy traversal. All lookups are case-insensitive
//! through name normalization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::ids::{normalize_name, Id};
use crate::models::{CatalogEntry, Category, Concept};
use crate::store::TableStore;

/// Sort orders for category listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategorySort {
    Name,
    DocumentCount,
    Popularity,
}

impl CategorySort {
    pub fn parse(s: &str) -> Self {
        match s {
            "document_count" => CategorySort::DocumentCount,
            "popularity" => CategorySort::Popularity,
            _ => CategorySort::Name,
        }
    }
}

/// Sort orders for concepts-in-category listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConceptSort {
    Name,
    DocumentCount,
}

impl ConceptSort {
    pub fn parse(s: &str) -> Self {
        match s {
            "document_count" => ConceptSort::DocumentCount,
            _ => ConceptSort::Name,
        }
    }
}

/// Fully-loaded category lookup structure.
#[derive(Default)]
pub struct CategoryIndex {
    by_id: HashMap<Id, Category>,
    name_to_id: HashMap<String, Id>,
    alias_to_id: HashMap<String, Id>,
    children: HashMap<Id, Vec<Id>>,
}

impl CategoryIndex {
    pub async fn load(store: &TableStore) -> Result<Self> {
        let mut index = CategoryIndex::default();
        for category in store.all_categories().await? {
            index.name_to_id
                .insert(normalize_name(&category.name), category.id);
            for alias in &category.aliases {
                index.alias_to_id.insert(normalize_name(alias), category.id);
            }
            if let Some(parent) = category.parent_id {
                index.children.entry(parent).or_default().push(category.id);
            }
            index.by_id.insert(category.id, category);
        }
        for ids in index.children.values_mut() {
            ids.sort();
        }
        Ok(index)
    }

    pub fn get(&self, id: Id) -> Option<&Category> {
        self.by_id.get(&id)
    }

    pub fn id_for_name(&self, name: &str) -> Option<Id> {
        self.name_to_id.get(&normalize_name(name)).copied()
    }

    pub fn id_for_alias(&self, alias: &str) -> Option<Id> {
        self.alias_to_id.get(&normalize_name(alias)).copied()
    }

    /// Resolve a canonical name or alias, canonical name winning.
    pub fn resolve(&self, name_or_alias: &str) -> Option<&Category> {
        self.id_for_name(name_or_alias)
            .or_else(|| self.id_for_alias(name_or_alias))
            .and_then(|id| self.by_id.get(&id))
    }

    pub fn children_of(&self, id: Id) -> Vec<Id> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Category> {
        let mut categories: Vec<Category> = self.by_id.values().cloned().collect();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        categories
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub struct CategoryRepository {
    store: Arc<TableStore>,
    index: RwLock<CategoryIndex>,
}

impl CategoryRepository {
    pub async fn open(store: Arc<TableStore>) -> Result<Self> {
        let index = CategoryIndex::load(&store).await?;
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    /// Re-read the category table, e.g. after an index build swap.
    pub async fn reload(&self) -> Result<()> {
        let fresh = CategoryIndex::load(&self.store).await?;
        *self.index.write().await = fresh;
        Ok(())
    }

    pub async fn find_by_id(&self, id: Id) -> Result<Option<Category>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Category>> {
        let index = self.index.read().await;
        Ok(index.id_for_name(name).and_then(|id| index.get(id)).cloned())
    }

    pub async fn find_by_alias(&self, alias: &str) -> Result<Option<Category>> {
        let index = self.index.read().await;
        Ok(index.id_for_alias(alias).and_then(|id| index.get(id)).cloned())
    }

    /// Resolve canonical name or alias.
    pub async fn resolve(&self, name_or_alias: &str) -> Result<Option<Category>> {
        Ok(self.index.read().await.resolve(name_or_alias).cloned())
    }

    /// List categories with sorting and optional substring search over
    /// names and aliases.
    pub async fn list(
        &self,
        sort_by: CategorySort,
        limit: usize,
        search: Option<&str>,
    ) -> Result<Vec<Category>> {
        let mut categories = self.index.read().await.all();

        if let Some(needle) = search {
            let needle = normalize_name(needle);
            categories.retain(|c| {
                normalize_name(&c.name).contains(&needle)
                    || c.aliases
                        .iter()
                        .any(|a| normalize_name(a).contains(&needle))
            });
        }

        match sort_by {
            CategorySort::Name => {}
            CategorySort::DocumentCount => categories.sort_by(|a, b| {
                b.document_count
                    .cmp(&a.document_count)
                    .then(a.name.cmp(&b.name))
            }),
            CategorySort::Popularity => categories.sort_by(|a, b| {
                (b.document_count + b.concept_count)
                    .cmp(&(a.document_count + a.concept_count))
                    .then(a.name.cmp(&b.name))
            }),
        }

        categories.truncate(limit);
        Ok(categories)
    }

    /// Documents tagged with the category (optionally including child
    /// categories), ordered by title.
    pub async fn documents_in(
        &self,
        category_or_alias: &str,
        include_children: bool,
        limit: usize,
    ) -> Result<Vec<CatalogEntry>> {
        let ids = {
            let index = self.index.read().await;
            let Some(category) = index.resolve(category_or_alias) else {
                return Ok(Vec::new());
            };
            let mut ids = vec![category.id];
            if include_children {
                ids.extend(index.children_of(category.id));
            }
            ids
        };

        let mut entries: Vec<CatalogEntry> = self
            .store
            .all_catalog()
            .await?
            .into_iter()
            .filter(|entry| entry.category_ids.iter().any(|id| ids.contains(id)))
            .collect();
        entries.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Concepts present in the category's documents, with how many of
    /// those documents carry each concept.
    pub async fn concepts_in(
        &self,
        category_or_alias: &str,
        sort_by: ConceptSort,
        limit: usize,
    ) -> Result<Vec<(Concept, u32)>> {
        let category_id = {
            let index = self.index.read().await;
            match index.resolve(category_or_alias) {
                Some(category) => category.id,
                None => return Ok(Vec::new()),
            }
        };

        let doc_ids: Vec<Id> = self
            .store
            .all_catalog()
            .await?
            .into_iter()
            .filter(|entry| entry.category_ids.contains(&category_id))
            .map(|entry| entry.id)
            .collect();

        let mut scored: Vec<(Concept, u32)> = self
            .store
            .all_concepts()
            .await?
            .into_iter()
            .filter_map(|concept| {
                let count = concept
                    .catalog_ids
                    .iter()
                    .filter(|id| doc_ids.contains(id))
                    .count() as u32;
                (count > 0).then_some((concept, count))
            })
            .collect();

        match sort_by {
            ConceptSort::Name => scored.sort_by(|a, b| a.0.name.cmp(&b.0.name)),
            ConceptSort::DocumentCount => scored.sort_by(|a, b| {
                b.1.cmp(&a.1).then(a.0.name.cmp(&b.0.name))
            }),
        }
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn category(id: Id, name: &str, aliases: &[&str], parent: Option<Id>, docs: u32) -> Category {
        Category {
            id,
            name: name.to_string(),
            description: String::new(),
            parent_id: parent,
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            related_ids: vec![],
            document_count: docs,
            chunk_count: 0,
            concept_count: 0,
            vector: vec![0.0; 4],
        }
    }

    async fn seeded_repo(tmp: &TempDir) -> CategoryRepository {
        let store = Arc::new(TableStore::open(tmp.path()).await.unwrap());
        store
            .put_category(&category(1, "Software Engineering", &["SWE"], None, 45))
            .await
            .unwrap();
        store
            .put_category(&category(2, "Testing", &[], Some(1), 12))
            .await
            .unwrap();
        store
            .put_category(&category(3, "Machine Learning", &["ML", "AI"], None, 30))
            .await
            .unwrap();
        CategoryRepository::open(store).await.unwrap()
    }

    #[tokio::test]
    async fn alias_and_name_resolve_to_same_id() {
        let tmp = TempDir::new().unwrap();
        let repo = seeded_repo(&tmp).await;
        let by_name = repo.find_by_name("software engineering").await.unwrap().unwrap();
        let by_alias = repo.find_by_alias("swe").await.unwrap().unwrap();
        assert_eq!(by_name.id, by_alias.id);
        let resolved = repo.resolve("SWE").await.unwrap().unwrap();
        assert_eq!(resolved.id, by_name.id);
    }

    #[tokio::test]
    async fn missing_category_is_none() {
        let tmp = TempDir::new().unwrap();
        let repo = seeded_repo(&tmp).await;
        assert!(repo.find_by_name("Philately").await.unwrap().is_none());
        assert!(repo.find_by_alias("XYZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_sorts_by_document_count() {
        let tmp = TempDir::new().unwrap();
        let repo = seeded_repo(&tmp).await;
        let listed = repo
            .list(CategorySort::DocumentCount, 10, None)
            .await
            .unwrap();
        assert_eq!(listed[0].name, "Software Engineering");
        assert_eq!(listed[1].name, "Machine Learning");
    }

    #[tokio::test]
    async fn list_search_matches_aliases() {
        let tmp = TempDir::new().unwrap();
        let repo = seeded_repo(&tmp).await;
        let listed = repo.list(CategorySort::Name, 10, Some("ml")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Machine Learning");
    }

    #[tokio::test]
    async fn hierarchy_children_tracked() {
        let tmp = TempDir::new().unwrap();
        let repo = seeded_repo(&tmp).await;
        let index = repo.index.read().await;
        assert_eq!(index.children_of(1), vec![2]);
        assert!(index.children_of(3).is_empty());
    }
}
