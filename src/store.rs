//! Table storage over SQLite.
//!
//! One database file per snapshot at `{db_root}/tables.sqlite`, holding the
//! four primary tables plus the optional page table. ID arrays and name
//! arrays are JSON text columns; vectors are little-endian `f32` BLOBs.
//!
//! The index build never mutates the live file. It writes a complete new
//! database to `tables.sqlite.staging`, closes it, and renames it onto the
//! live path. A reader holding the old file keeps a consistent old
//! snapshot; new connections observe the new one.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{EngineError, Result};
use crate::ids::Id;
use crate::models::{
    Category, CatalogEntry, Chunk, Concept, ConceptType, DocumentType, Page,
};

const LIVE_FILE: &str = "tables.sqlite";
const STAGING_FILE: &str = "tables.sqlite.staging";

pub struct TableStore {
    pool: SqlitePool,
}

impl TableStore {
    pub fn live_path(db_root: &Path) -> PathBuf {
        db_root.join(LIVE_FILE)
    }

    pub fn staging_path(db_root: &Path) -> PathBuf {
        db_root.join(STAGING_FILE)
    }

    /// Open (creating if missing) the live snapshot under `db_root`.
    pub async fn open(db_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_root)?;
        Self::open_file(&Self::live_path(db_root)).await
    }

    /// Open a fresh staging database, discarding any stale staging file
    /// left by a killed build.
    pub async fn open_staging(db_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_root)?;
        let path = Self::staging_path(db_root);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::open_file(&path).await
    }

    async fn open_file(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| EngineError::Dependency(format!("sqlite options: {}", e)))?
            .create_if_missing(true)
            // Single-file snapshots keep the rename swap atomic; WAL would
            // leave sidecar files behind.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Delete);

        // One pinned connection per store: every query runs against the
        // inode the store opened, so an engine keeps a consistent snapshot
        // across a concurrent rename swap.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Atomically replace the live snapshot with the staging file. The
    /// staging store must be closed first.
    pub fn commit_staging(db_root: &Path) -> Result<()> {
        let staging = Self::staging_path(db_root);
        let live = Self::live_path(db_root);
        std::fs::rename(&staging, &live)
            .map_err(|e| EngineError::Dependency(format!("snapshot swap: {}", e)))?;
        info!(path = %live.display(), "table snapshot swapped");
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                authors TEXT NOT NULL DEFAULT '[]',
                year INTEGER,
                publisher TEXT,
                isbn TEXT,
                doi TEXT,
                arxiv_id TEXT,
                venue TEXT,
                keywords TEXT NOT NULL DEFAULT '[]',
                abstract_text TEXT,
                document_type TEXT NOT NULL DEFAULT 'unknown',
                summary TEXT NOT NULL DEFAULT '',
                vector BLOB NOT NULL,
                concept_ids TEXT NOT NULL DEFAULT '[]',
                category_ids TEXT NOT NULL DEFAULT '[]',
                concept_names TEXT NOT NULL DEFAULT '[]',
                category_names TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                catalog_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                page_number INTEGER,
                concept_ids TEXT NOT NULL DEFAULT '[]',
                concept_density REAL NOT NULL DEFAULT 0,
                vector BLOB NOT NULL,
                UNIQUE(catalog_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS concepts (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                concept_type TEXT NOT NULL DEFAULT 'thematic',
                catalog_ids TEXT NOT NULL DEFAULT '[]',
                chunk_ids TEXT NOT NULL DEFAULT '[]',
                adjacent_ids TEXT NOT NULL DEFAULT '[]',
                related_ids TEXT NOT NULL DEFAULT '[]',
                synonyms TEXT NOT NULL DEFAULT '[]',
                broader_terms TEXT NOT NULL DEFAULT '[]',
                narrower_terms TEXT NOT NULL DEFAULT '[]',
                weight REAL NOT NULL DEFAULT 0,
                vector BLOB NOT NULL,
                catalog_titles TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                parent_id INTEGER,
                aliases TEXT NOT NULL DEFAULT '[]',
                related_ids TEXT NOT NULL DEFAULT '[]',
                document_count INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                concept_count INTEGER NOT NULL DEFAULT 0,
                vector BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY,
                catalog_id INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                concept_ids TEXT NOT NULL DEFAULT '[]',
                text_preview TEXT NOT NULL DEFAULT '',
                vector BLOB NOT NULL,
                UNIQUE(catalog_id, page_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_catalog ON chunks(catalog_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_source ON catalog(source)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_concepts_name ON concepts(name)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_catalog ON pages(catalog_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ============ Catalog ============

    pub async fn put_catalog(&self, entry: &CatalogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO catalog
                (id, source, title, author, authors, year, publisher, isbn, doi,
                 arxiv_id, venue, keywords, abstract_text, document_type, summary,
                 vector, concept_ids, category_ids, concept_names, category_names)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id as i64)
        .bind(&entry.source)
        .bind(&entry.title)
        .bind(&entry.author)
        .bind(strings_to_json(&entry.authors)?)
        .bind(entry.year)
        .bind(&entry.publisher)
        .bind(&entry.isbn)
        .bind(&entry.doi)
        .bind(&entry.arxiv_id)
        .bind(&entry.venue)
        .bind(strings_to_json(&entry.keywords)?)
        .bind(&entry.abstract_text)
        .bind(entry.document_type.as_str())
        .bind(&entry.summary)
        .bind(vec_to_blob(&entry.vector))
        .bind(ids_to_json(&entry.concept_ids)?)
        .bind(ids_to_json(&entry.category_ids)?)
        .bind(strings_to_json(&entry.concept_names)?)
        .bind(strings_to_json(&entry.category_names)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_catalog(&self, id: Id) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query("SELECT * FROM catalog WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_catalog(&r)).transpose()
    }

    pub async fn all_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query("SELECT * FROM catalog ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_catalog).collect()
    }

    pub async fn catalog_by_source(&self, source: &str) -> Result<Option<CatalogEntry>> {
        let row = sqlx::query("SELECT * FROM catalog WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_catalog(&r)).transpose()
    }

    // ============ Chunks ============

    pub async fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
                (id, catalog_id, chunk_index, text, hash, page_number,
                 concept_ids, concept_density, vector)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk.id as i64)
        .bind(chunk.catalog_id as i64)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(chunk.page_number.map(|p| p as i64))
        .bind(ids_to_json(&chunk.concept_ids)?)
        .bind(chunk.concept_density as f64)
        .bind(vec_to_blob(&chunk.vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: Id) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    pub async fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks ORDER BY catalog_id, chunk_index")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn chunks_by_catalog(&self, catalog_id: Id, limit: usize) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE catalog_id = ? ORDER BY chunk_index LIMIT ?",
        )
        .bind(catalog_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    // ============ Concepts ============

    pub async fn put_concept(&self, concept: &Concept) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO concepts
                (id, name, summary, concept_type, catalog_ids, chunk_ids,
                 adjacent_ids, related_ids, synonyms, broader_terms,
                 narrower_terms, weight, vector, catalog_titles)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(concept.id as i64)
        .bind(&concept.name)
        .bind(&concept.summary)
        .bind(concept.concept_type.as_str())
        .bind(ids_to_json(&concept.catalog_ids)?)
        .bind(ids_to_json(&concept.chunk_ids)?)
        .bind(ids_to_json(&concept.adjacent_ids)?)
        .bind(ids_to_json(&concept.related_ids)?)
        .bind(strings_to_json(&concept.synonyms)?)
        .bind(strings_to_json(&concept.broader_terms)?)
        .bind(strings_to_json(&concept.narrower_terms)?)
        .bind(concept.weight as f64)
        .bind(vec_to_blob(&concept.vector))
        .bind(strings_to_json(&concept.catalog_titles)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_concept(&self, id: Id) -> Result<Option<Concept>> {
        let row = sqlx::query("SELECT * FROM concepts WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_concept(&r)).transpose()
    }

    pub async fn concept_by_name(&self, name: &str) -> Result<Option<Concept>> {
        let row = sqlx::query("SELECT * FROM concepts WHERE lower(name) = lower(?)")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_concept(&r)).transpose()
    }

    pub async fn all_concepts(&self) -> Result<Vec<Concept>> {
        let rows = sqlx::query("SELECT * FROM concepts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_concept).collect()
    }

    // ============ Categories ============

    pub async fn put_category(&self, category: &Category) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO categories
                (id, name, description, parent_id, aliases, related_ids,
                 document_count, chunk_count, concept_count, vector)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(category.id as i64)
        .bind(&category.name)
        .bind(&category.description)
        .bind(category.parent_id.map(|p| p as i64))
        .bind(strings_to_json(&category.aliases)?)
        .bind(ids_to_json(&category.related_ids)?)
        .bind(category.document_count as i64)
        .bind(category.chunk_count as i64)
        .bind(category.concept_count as i64)
        .bind(vec_to_blob(&category.vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_category(&self, id: Id) -> Result<Option<Category>> {
        let row = sqlx::query("SELECT * FROM categories WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_category(&r)).transpose()
    }

    pub async fn all_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query("SELECT * FROM categories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_category).collect()
    }

    // ============ Pages ============

    pub async fn put_page(&self, page: &Page) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pages
                (id, catalog_id, page_number, concept_ids, text_preview, vector)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(page.id as i64)
        .bind(page.catalog_id as i64)
        .bind(page.page_number as i64)
        .bind(ids_to_json(&page.concept_ids)?)
        .bind(&page.text_preview)
        .bind(vec_to_blob(&page.vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pages_by_catalog(&self, catalog_id: Id) -> Result<Vec<Page>> {
        let rows = sqlx::query("SELECT * FROM pages WHERE catalog_id = ? ORDER BY page_number")
            .bind(catalog_id as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_page).collect()
    }

    // ============ Counts ============

    pub async fn count(&self, table: &str) -> Result<u64> {
        let allowed = ["catalog", "chunks", "concepts", "categories", "pages"];
        if !allowed.contains(&table) {
            return Err(EngineError::Validation(format!("unknown table: {}", table)));
        }
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

// ============ Row codecs ============

fn ids_to_json(ids: &[Id]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

fn json_to_ids(json: &str) -> Result<Vec<Id>> {
    Ok(serde_json::from_str(json)?)
}

fn strings_to_json(strings: &[String]) -> Result<String> {
    Ok(serde_json::to_string(strings)?)
}

fn json_to_strings(json: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(json)?)
}

fn row_to_catalog(row: &SqliteRow) -> Result<CatalogEntry> {
    let concept_ids: String = row.get("concept_ids");
    let category_ids: String = row.get("category_ids");
    let concept_names: String = row.get("concept_names");
    let category_names: String = row.get("category_names");
    let authors: String = row.get("authors");
    let keywords: String = row.get("keywords");
    let document_type: String = row.get("document_type");
    let vector: Vec<u8> = row.get("vector");
    Ok(CatalogEntry {
        id: row.get::<i64, _>("id") as Id,
        source: row.get("source"),
        title: row.get("title"),
        author: row.get("author"),
        authors: json_to_strings(&authors)?,
        year: row.get("year"),
        publisher: row.get("publisher"),
        isbn: row.get("isbn"),
        doi: row.get("doi"),
        arxiv_id: row.get("arxiv_id"),
        venue: row.get("venue"),
        keywords: json_to_strings(&keywords)?,
        abstract_text: row.get("abstract_text"),
        document_type: DocumentType::parse(&document_type),
        summary: row.get("summary"),
        vector: blob_to_vec(&vector),
        concept_ids: json_to_ids(&concept_ids)?,
        category_ids: json_to_ids(&category_ids)?,
        concept_names: json_to_strings(&concept_names)?,
        category_names: json_to_strings(&category_names)?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let concept_ids: String = row.get("concept_ids");
    let vector: Vec<u8> = row.get("vector");
    Ok(Chunk {
        id: row.get::<i64, _>("id") as Id,
        catalog_id: row.get::<i64, _>("catalog_id") as Id,
        chunk_index: row.get::<i64, _>("chunk_index") as usize,
        text: row.get("text"),
        hash: row.get("hash"),
        page_number: row.get::<Option<i64>, _>("page_number").map(|p| p as u32),
        concept_ids: json_to_ids(&concept_ids)?,
        concept_density: row.get::<f64, _>("concept_density") as f32,
        vector: blob_to_vec(&vector),
    })
}

fn row_to_concept(row: &SqliteRow) -> Result<Concept> {
    let catalog_ids: String = row.get("catalog_ids");
    let chunk_ids: String = row.get("chunk_ids");
    let adjacent_ids: String = row.get("adjacent_ids");
    let related_ids: String = row.get("related_ids");
    let synonyms: String = row.get("synonyms");
    let broader_terms: String = row.get("broader_terms");
    let narrower_terms: String = row.get("narrower_terms");
    let catalog_titles: String = row.get("catalog_titles");
    let concept_type: String = row.get("concept_type");
    let vector: Vec<u8> = row.get("vector");
    Ok(Concept {
        id: row.get::<i64, _>("id") as Id,
        name: row.get("name"),
        summary: row.get("summary"),
        concept_type: ConceptType::parse(&concept_type),
        catalog_ids: json_to_ids(&catalog_ids)?,
        chunk_ids: json_to_ids(&chunk_ids)?,
        adjacent_ids: json_to_ids(&adjacent_ids)?,
        related_ids: json_to_ids(&related_ids)?,
        synonyms: json_to_strings(&synonyms)?,
        broader_terms: json_to_strings(&broader_terms)?,
        narrower_terms: json_to_strings(&narrower_terms)?,
        weight: row.get::<f64, _>("weight") as f32,
        vector: blob_to_vec(&vector),
        catalog_titles: json_to_strings(&catalog_titles)?,
    })
}

fn row_to_category(row: &SqliteRow) -> Result<Category> {
    let aliases: String = row.get("aliases");
    let related_ids: String = row.get("related_ids");
    let vector: Vec<u8> = row.get("vector");
    Ok(Category {
        id: row.get::<i64, _>("id") as Id,
        name: row.get("name"),
        description: row.get("description"),
        parent_id: row.get::<Option<i64>, _>("parent_id").map(|p| p as Id),
        aliases: json_to_strings(&aliases)?,
        related_ids: json_to_ids(&related_ids)?,
        document_count: row.get::<i64, _>("document_count") as u32,
        chunk_count: row.get::<i64, _>("chunk_count") as u32,
        concept_count: row.get::<i64, _>("concept_count") as u32,
        vector: blob_to_vec(&vector),
    })
}

fn row_to_page(row: &SqliteRow) -> Result<Page> {
    let concept_ids: String = row.get("concept_ids");
    let vector: Vec<u8> = row.get("vector");
    Ok(Page {
        id: row.get::<i64, _>("id") as Id,
        catalog_id: row.get::<i64, _>("catalog_id") as Id,
        page_number: row.get::<i64, _>("page_number") as u32,
        concept_ids: json_to_ids(&concept_ids)?,
        text_preview: row.get("text_preview"),
        vector: blob_to_vec(&vector),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_catalog(id: Id) -> CatalogEntry {
        CatalogEntry {
            id,
            source: format!("/docs/book-{}.pdf", id),
            title: format!("Book {}", id),
            author: Some("Ada Writer".to_string()),
            authors: vec!["Ada Writer".to_string()],
            year: Some(2020),
            document_type: DocumentType::Book,
            summary: "About things.".to_string(),
            vector: vec![0.5; 4],
            concept_ids: vec![10, 20],
            concept_names: vec!["alpha".to_string(), "beta".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn catalog_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        store.put_catalog(&sample_catalog(1)).await.unwrap();

        let loaded = store.get_catalog(1).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Book 1");
        assert_eq!(loaded.concept_ids, vec![10, 20]);
        assert_eq!(loaded.concept_names, vec!["alpha", "beta"]);
        assert_eq!(loaded.document_type, DocumentType::Book);
        assert_eq!(loaded.vector, vec![0.5; 4]);
        assert!(store.get_catalog(99).await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn chunk_round_trip_preserves_nullable_page() {
        let tmp = TempDir::new().unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        let chunk = Chunk {
            id: 5,
            catalog_id: 1,
            chunk_index: 0,
            text: "chunk text".to_string(),
            hash: "h".to_string(),
            page_number: None,
            concept_ids: vec![10],
            concept_density: 0.5,
            vector: vec![1.0, 0.0],
        };
        store.put_chunk(&chunk).await.unwrap();
        let loaded = store.get_chunk(5).await.unwrap().unwrap();
        assert_eq!(loaded.page_number, None);
        assert_eq!(loaded.concept_ids, vec![10]);
        assert!((loaded.concept_density - 0.5).abs() < 1e-6);
        store.close().await;
    }

    #[tokio::test]
    async fn concept_lookup_by_name_is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        let concept = Concept {
            id: 7,
            name: "machine learning".to_string(),
            summary: "Learning from data.".to_string(),
            concept_type: ConceptType::Thematic,
            catalog_ids: vec![1],
            chunk_ids: vec![],
            adjacent_ids: vec![],
            related_ids: vec![],
            synonyms: vec!["ml".to_string()],
            broader_terms: vec![],
            narrower_terms: vec![],
            weight: 0.4,
            vector: vec![0.1; 4],
            catalog_titles: vec!["Book 1".to_string()],
        };
        store.put_concept(&concept).await.unwrap();
        let found = store.concept_by_name("Machine Learning").await.unwrap();
        assert_eq!(found.unwrap().id, 7);
        store.close().await;
    }

    #[tokio::test]
    async fn staging_swap_replaces_snapshot() {
        let tmp = TempDir::new().unwrap();

        let live = TableStore::open(tmp.path()).await.unwrap();
        live.put_catalog(&sample_catalog(1)).await.unwrap();
        live.close().await;

        let staging = TableStore::open_staging(tmp.path()).await.unwrap();
        staging.put_catalog(&sample_catalog(2)).await.unwrap();
        staging.put_catalog(&sample_catalog(3)).await.unwrap();
        staging.close().await;

        TableStore::commit_staging(tmp.path()).unwrap();

        let reopened = TableStore::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.count("catalog").await.unwrap(), 2);
        assert!(reopened.get_catalog(1).await.unwrap().is_none());
        assert!(reopened.get_catalog(2).await.unwrap().is_some());
        reopened.close().await;
    }

    #[tokio::test]
    async fn count_rejects_unknown_table() {
        let tmp = TempDir::new().unwrap();
        let store = TableStore::open(tmp.path()).await.unwrap();
        assert!(store.count("users; DROP TABLE catalog").await.is_err());
        store.close().await;
    }
}
