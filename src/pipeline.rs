//! Ingestion pipeline.
//!
//! Walks a source directory, hashes each candidate file, and dispatches the
//! remainder to a bounded worker pool. A worker takes one document
//! end-to-end: load → chunk → stage-cache lookup (or LLM extraction +
//! overview, then an atomic cache write) → checkpoint. Completion order is
//! unordered; dispatch follows sorted directory order.
//!
//! LLM cost is at-most-once per document: a file whose hash has an intact
//! stage-cache entry reuses it verbatim. The checkpoint is advisory — a
//! checkpointed hash without a cache entry is re-processed.
//!
//! A shutdown signal stops dispatching, lets in-flight workers finish their
//! current document, flushes the checkpoint, and skips the index build.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::checkpoint::{Checkpoint, CheckpointStore, IngestStage};
use crate::chunker::TextChunker;
use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::error::{EngineError, Result};
use crate::ids;
use crate::index_build::{build_index, BuildSummary, DocumentBundle};
use crate::llm::{ChatClient, ConceptExtractor, OverviewGenerator};
use crate::loader::{loader_for, title_from_filename, DocMetadata, OcrBackend};
use crate::models::DocumentType;
use crate::progress::{PipelineStage, ProgressEvent, ProgressSink, WorkerStatus};
use crate::resilience::{with_timeout, CircuitBreaker, RateLimiter, RetryPolicy};
use crate::stage_cache::{StageCache, StageCacheEntry};

/// Supported document extensions, lower-case.
const EXTENSIONS: &[&str] = &["pdf", "epub"];

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub source_dir: PathBuf,
    pub parallel: usize,
    pub max_docs: Option<usize>,
    pub use_cache: bool,
    pub overwrite: bool,
    pub clean_checkpoint: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &Config, source_dir: PathBuf) -> Self {
        Self {
            source_dir,
            parallel: config.pipeline.parallel,
            max_docs: config.pipeline.max_docs,
            use_cache: config.pipeline.use_cache,
            overwrite: config.pipeline.overwrite,
            clean_checkpoint: config.pipeline.clean_checkpoint,
        }
    }
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    pub documents_processed: usize,
    /// Documents whose LLM work was reused from the stage cache.
    pub documents_skipped: usize,
    pub documents_failed: usize,
    pub chunks: usize,
    pub llm_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cancelled: bool,
    pub build: BuildSummary,
}

pub struct PipelineDriver {
    db_root: PathBuf,
    chat: Arc<dyn ChatClient>,
    embeddings: Arc<EmbeddingService>,
    ocr: Option<Arc<dyn OcrBackend>>,
    progress: Arc<dyn ProgressSink>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    chunker: TextChunker,
    llm_timeout: Duration,
    stage_ttl_days: u64,
    summary_model: String,
    concept_model: String,
}

impl PipelineDriver {
    pub fn new(
        config: &Config,
        chat: Arc<dyn ChatClient>,
        embeddings: Arc<EmbeddingService>,
        ocr: Option<Arc<dyn OcrBackend>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            db_root: config.database.url.clone(),
            chat,
            embeddings,
            ocr,
            progress,
            rate_limiter: Arc::new(RateLimiter::new(Duration::from_millis(
                config.resilience.rate_limit_min_interval_ms,
            ))),
            breaker: Arc::new(CircuitBreaker::from_config("llm", &config.resilience)),
            retry: RetryPolicy::from_config(&config.resilience),
            chunker: TextChunker::default(),
            llm_timeout: Duration::from_millis(config.resilience.llm_timeout_ms),
            stage_ttl_days: config.caches.stage_ttl_days,
            summary_model: config.llm.summary_model.clone(),
            concept_model: config.llm.concept_model.clone(),
        }
    }

    /// Run ingestion over `options.source_dir` and rebuild the tables.
    pub async fn run(
        &self,
        options: &PipelineOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<IngestStats> {
        let mut files = discover(&options.source_dir)?;
        if let Some(max) = options.max_docs {
            files.truncate(max);
        }
        info!(files = files.len(), dir = %options.source_dir.display(), "ingestion started");

        std::fs::create_dir_all(&self.db_root)?;
        let stage_cache = Arc::new(StageCache::open(&self.db_root, self.stage_ttl_days)?);
        let checkpoint_store = Arc::new(CheckpointStore::open(&self.db_root));
        if options.clean_checkpoint || options.overwrite {
            checkpoint_store.clean()?;
        }
        let checkpoint = Arc::new(Mutex::new(checkpoint_store.load()));

        let ctx = Arc::new(WorkerCtx {
            chat: self.chat.clone(),
            ocr: self.ocr.clone(),
            progress: self.progress.clone(),
            rate_limiter: self.rate_limiter.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            chunker: self.chunker,
            llm_timeout: self.llm_timeout,
            use_cache: options.use_cache,
            stage_cache: stage_cache.clone(),
            checkpoint_store: checkpoint_store.clone(),
            checkpoint: checkpoint.clone(),
            summary_model: self.summary_model.clone(),
            concept_model: self.concept_model.clone(),
            llm_calls: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        });

        let semaphore = Arc::new(Semaphore::new(options.parallel.max(1)));
        let mut tasks: JoinSet<std::result::Result<Option<DocumentBundle>, (PathBuf, EngineError)>> =
            JoinSet::new();

        let mut dispatched = 0usize;
        for (index, path) in files.iter().enumerate() {
            if *shutdown.borrow() {
                info!("shutdown requested, no further documents dispatched");
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                EngineError::Fatal("worker semaphore closed".to_string())
            })?;
            let ctx = ctx.clone();
            let path = path.clone();
            let worker_index = index % options.parallel.max(1);
            let shutdown = shutdown.clone();
            dispatched += 1;
            tasks.spawn(async move {
                let _permit = permit;
                ctx.process_document(worker_index, &path, shutdown)
                    .await
                    .map_err(|e| (path, e))
            });
        }

        let mut bundles: Vec<DocumentBundle> = Vec::new();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(bundle))) => bundles.push(bundle),
                Ok(Ok(None)) => {} // cancelled mid-flight
                Ok(Err((path, e))) => {
                    failed += 1;
                    let mut cp = checkpoint.lock().unwrap();
                    cp.record_failed(&path.display().to_string());
                    let _ = checkpoint_store.save(&cp);
                    warn!(path = %path.display(), error = %truncate(&e.to_string(), 200), "document failed");
                }
                Err(join_err) => {
                    failed += 1;
                    warn!(error = %join_err, "worker panicked");
                }
            }
        }

        // Deterministic build input regardless of completion order.
        bundles.sort_by(|a, b| a.source.cmp(&b.source));

        let cancelled = *shutdown.borrow() || dispatched < files.len();
        let cache_stats = stage_cache.stats();
        let mut stats = IngestStats {
            documents_processed: bundles.len(),
            documents_skipped: ctx.reused.load(Ordering::SeqCst) as usize,
            documents_failed: failed,
            chunks: bundles.iter().map(|b| b.chunks.len()).sum(),
            llm_calls: ctx.llm_calls.load(Ordering::SeqCst),
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
            cancelled,
            build: BuildSummary::default(),
        };

        if cancelled {
            let cp = checkpoint.lock().unwrap().clone();
            checkpoint_store.save(&cp)?;
            info!("ingestion cancelled, checkpoint flushed, index build skipped");
            return Ok(stats);
        }

        {
            let mut cp = checkpoint.lock().unwrap();
            cp.stage = IngestStage::Summaries;
            checkpoint_store.save(&cp)?;
        }

        self.progress.on_progress(ProgressEvent {
            worker_index: 0,
            stage: PipelineStage::IndexBuild,
            document_name: String::new(),
            chunk_index: 0,
            total_chunks: bundles.len(),
            status: WorkerStatus::Processing,
        });

        stats.build = build_index(
            &self.db_root,
            &bundles,
            &self.embeddings,
            Some((self.chat.clone(), self.summary_model.clone())),
        )
        .await?;

        {
            let mut cp = checkpoint.lock().unwrap();
            cp.stage = IngestStage::Complete;
            checkpoint_store.save(&cp)?;
        }

        self.progress.on_progress(ProgressEvent {
            worker_index: 0,
            stage: PipelineStage::IndexBuild,
            document_name: String::new(),
            chunk_index: bundles.len(),
            total_chunks: bundles.len(),
            status: WorkerStatus::Done,
        });

        info!(
            processed = stats.documents_processed,
            skipped = stats.documents_skipped,
            failed = stats.documents_failed,
            llm_calls = stats.llm_calls,
            cache_hit_rate = cache_stats.hit_rate(),
            "ingestion finished"
        );
        Ok(stats)
    }

    /// Shared-limiter metrics, for the progress surface.
    pub async fn rate_limiter_metrics(&self) -> crate::resilience::RateLimiterMetrics {
        self.rate_limiter.metrics().await
    }
}

/// Candidate files in sorted order.
fn discover(source_dir: &Path) -> Result<Vec<PathBuf>> {
    if !source_dir.is_dir() {
        return Err(EngineError::Validation(format!(
            "not a directory: {}",
            source_dir.display()
        )));
    }
    let mut files: Vec<PathBuf> = WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

struct WorkerCtx {
    chat: Arc<dyn ChatClient>,
    ocr: Option<Arc<dyn OcrBackend>>,
    progress: Arc<dyn ProgressSink>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    chunker: TextChunker,
    llm_timeout: Duration,
    use_cache: bool,
    stage_cache: Arc<StageCache>,
    checkpoint_store: Arc<CheckpointStore>,
    checkpoint: Arc<Mutex<Checkpoint>>,
    summary_model: String,
    concept_model: String,
    llm_calls: AtomicU64,
    reused: AtomicU64,
}

impl WorkerCtx {
    async fn process_document(
        &self,
        worker_index: usize,
        path: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<DocumentBundle>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if *shutdown.borrow() {
            return Ok(None);
        }

        // ---- Load.
        self.emit(worker_index, PipelineStage::Load, &name, 0, 0, WorkerStatus::Processing);
        let bytes = std::fs::read(path)?;
        let document_hash = ids::content_hash(&bytes);
        drop(bytes);

        let loader = loader_for(path, self.ocr.clone()).ok_or_else(|| {
            EngineError::Validation(format!("unsupported format: {}", path.display()))
        })?;
        let loaded = loader.load(path).await?;

        if *shutdown.borrow() {
            return Ok(None);
        }

        // ---- Chunk.
        let source = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        let catalog_id = ids::catalog_id(&source);
        self.emit(worker_index, PipelineStage::Chunk, &name, 0, 0, WorkerStatus::Processing);
        let chunks = self.chunker.chunk_document(catalog_id, &loaded.pages);
        let total_chunks = chunks.len();

        let title = loaded
            .metadata
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| title_from_filename(path));
        let document_type = infer_document_type(path, &loaded.metadata);

        if *shutdown.borrow() {
            return Ok(None);
        }

        // ---- Stage cache or LLM enrichment.
        let cached = if self.use_cache {
            self.stage_cache.lookup(&document_hash)
        } else {
            None
        };

        let (extracted, overview, metadata) = match cached {
            Some(entry) => {
                info!(document = %name, "Using cached results");
                self.reused.fetch_add(1, Ordering::SeqCst);
                let metadata = entry.metadata.unwrap_or_else(|| loaded.metadata.clone());
                (entry.concepts, entry.content_overview, metadata)
            }
            None => {
                let full_text = loaded.full_text();

                self.emit(
                    worker_index,
                    PipelineStage::Summarize,
                    &name,
                    0,
                    total_chunks,
                    WorkerStatus::Waiting,
                );
                let overview_gen =
                    OverviewGenerator::new(self.chat.clone(), self.summary_model.clone());
                let overview = self
                    .guarded_llm("overview", || overview_gen.generate(&full_text))
                    .await?;

                self.emit(
                    worker_index,
                    PipelineStage::Extract,
                    &name,
                    0,
                    total_chunks,
                    WorkerStatus::Waiting,
                );
                let extractor =
                    ConceptExtractor::new(self.chat.clone(), self.concept_model.clone());
                let extracted = self
                    .guarded_llm("concept extraction", || extractor.extract(&full_text))
                    .await?;

                let entry = StageCacheEntry {
                    hash: document_hash.clone(),
                    source: source.clone(),
                    processed_at: chrono::Utc::now(),
                    concepts: extracted.clone(),
                    content_overview: overview.clone(),
                    metadata: Some(loaded.metadata.clone()),
                };
                self.stage_cache.store(&entry)?;
                (extracted, overview, loaded.metadata.clone())
            }
        };

        // ---- Checkpoint.
        self.emit(
            worker_index,
            PipelineStage::Checkpoint,
            &name,
            total_chunks,
            total_chunks,
            WorkerStatus::Processing,
        );
        {
            let mut cp = self.checkpoint.lock().unwrap();
            cp.record_processed(&document_hash, &source);
            self.checkpoint_store.save(&cp)?;
        }

        self.emit(
            worker_index,
            PipelineStage::Checkpoint,
            &name,
            total_chunks,
            total_chunks,
            WorkerStatus::Done,
        );

        Ok(Some(DocumentBundle {
            source,
            document_hash,
            title,
            document_type,
            metadata,
            pages: loaded.pages,
            chunks,
            extracted,
            overview,
        }))
    }

    /// Rate limiter → circuit breaker → timeout → retry, with a
    /// server-sent `retry_after` also pushing out the shared limiter.
    async fn guarded_llm<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.retry
            .run(op_name, || async {
                self.rate_limiter.acquire().await;
                self.llm_calls.fetch_add(1, Ordering::SeqCst);
                let result = self
                    .breaker
                    .call(|| with_timeout(self.llm_timeout, op()))
                    .await;
                if let Err(EngineError::RateLimited {
                    retry_after_ms: Some(ms),
                    ..
                }) = &result
                {
                    self.rate_limiter
                        .delay_next(Duration::from_millis(*ms))
                        .await;
                }
                result
            })
            .await
    }

    fn emit(
        &self,
        worker_index: usize,
        stage: PipelineStage,
        document_name: &str,
        chunk_index: usize,
        total_chunks: usize,
        status: WorkerStatus,
    ) {
        self.progress.on_progress(ProgressEvent {
            worker_index,
            stage,
            document_name: document_name.to_string(),
            chunk_index,
            total_chunks,
            status,
        });
    }
}

/// Classify a document from its format and sniffed metadata.
fn infer_document_type(path: &Path, metadata: &DocMetadata) -> DocumentType {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if metadata.doi.is_some() || metadata.arxiv_id.is_some() || metadata.venue.is_some() {
        return DocumentType::Paper;
    }
    if ext == "epub" || metadata.isbn.is_some() {
        return DocumentType::Book;
    }
    if metadata.publisher.is_some() {
        return DocumentType::Article;
    }
    DocumentType::Unknown
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max);
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_paper_from_doi() {
        let mut meta = DocMetadata::default();
        meta.doi = Some("10.1/xyz".to_string());
        assert_eq!(
            infer_document_type(Path::new("a.pdf"), &meta),
            DocumentType::Paper
        );
    }

    #[test]
    fn infer_book_from_epub_or_isbn() {
        let meta = DocMetadata::default();
        assert_eq!(
            infer_document_type(Path::new("a.epub"), &meta),
            DocumentType::Book
        );
        let mut with_isbn = DocMetadata::default();
        with_isbn.isbn = Some("9781234567890".to_string());
        assert_eq!(
            infer_document_type(Path::new("a.pdf"), &with_isbn),
            DocumentType::Book
        );
    }

    #[test]
    fn infer_unknown_without_signals() {
        assert_eq!(
            infer_document_type(Path::new("a.pdf"), &DocMetadata::default()),
            DocumentType::Unknown
        );
    }

    #[test]
    fn discover_rejects_missing_dir() {
        assert!(discover(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        let long = "x".repeat(300);
        let cut = truncate(&long, 20);
        assert!(cut.chars().count() <= 21);
        assert!(cut.ends_with('…'));
    }
}
