//! # Concept-RAG
//!
//! **A local document-oriented retrieval engine with LLM concept
//! enrichment and multi-signal hybrid search.**
//!
//! Concept-RAG ingests PDF and EPUB documents, enriches them with
//! LLM-extracted concepts and categories, and answers queries through a
//! hybrid scorer that blends vector similarity, BM25, title, concept, and
//! lexical-expansion signals.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────────┐
//! │  Loaders  │──▶│   Pipeline    │──▶│   Stage   │──▶│ Index build  │
//! │ PDF/EPUB  │   │ chunk+extract │   │   cache   │   │ (4 tables)   │
//! └───────────┘   └──────────────┘   └───────────┘   └──────┬───────┘
//!                                                           │ atomic swap
//!                      ┌──────────────┐   ┌────────────┐    ▼
//!                      │  Operations  │◀──│   Hybrid   │◀── SQLite
//!                      │  (ops, CLI)  │   │   search   │    snapshot
//!                      └──────────────┘   └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **pipeline** ([`pipeline`]) walks a directory, hashes each file,
//!    and runs load → chunk → LLM enrichment per document on a bounded
//!    worker pool. LLM outputs land in the per-document **stage cache**
//!    ([`stage_cache`]) so re-runs cost zero LLM calls.
//! 2. The **index build** ([`index_build`]) merges concepts across
//!    documents, derives reverse edges, co-occurrence and lexical graphs,
//!    and denormalized name arrays, then swaps the four-table SQLite
//!    snapshot atomically ([`store`]).
//! 3. At query time the **repositories** serve the **hybrid search
//!    service** ([`search`]), which consults the **query expander**
//!    ([`expand`]) and the result cache.
//! 4. The **operation surface** ([`ops`]) exposes the named operations
//!    with a uniform failure envelope; the `crag` CLI is a thin wrapper.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Tagged error kinds with retryability classification |
//! | [`ids`] | Hash-addressed 32-bit IDs and name normalization |
//! | [`models`] | Core rows: catalog, chunk, concept, category, page |
//! | [`loader`] | PDF and EPUB loaders, OCR collaborator seam |
//! | [`chunker`] | Recursive word-boundary chunker with overlap |
//! | [`llm`] | Chat client trait, concept extractor, overview generator |
//! | [`embedding`] | 384-dim embedders (hashed, OpenAI, HuggingFace) + cache |
//! | [`cache`] | Generic LRU + TTL cache with metrics |
//! | [`stage_cache`] | Content-addressed per-document LLM result cache |
//! | [`checkpoint`] | Advisory ingestion checkpoint |
//! | [`store`] | SQLite tables, staging build, atomic snapshot swap |
//! | [`repo_catalog`] | Catalog repository |
//! | [`repo_chunks`] | Chunk repository |
//! | [`repo_concepts`] | Concept repository |
//! | [`repo_categories`] | Category repository + in-memory category index |
//! | [`expand`] | WordNet/concept/corpus query expansion |
//! | [`search`] | Five-signal hybrid scoring with result caching |
//! | [`pipeline`] | Bounded-worker ingestion driver |
//! | [`index_build`] | Deterministic post-ingest table build |
//! | [`resilience`] | Retry, circuit breaker, bulkhead, rate limiter |
//! | [`progress`] | Pipeline progress events and sinks |
//! | [`ops`] | Named operation surface with failure envelope |
//! | [`engine`] | Composition root |

pub mod cache;
pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod expand;
pub mod ids;
pub mod index_build;
pub mod llm;
pub mod loader;
pub mod models;
pub mod ops;
pub mod pipeline;
pub mod progress;
pub mod repo_catalog;
pub mod repo_categories;
pub mod repo_chunks;
pub mod repo_concepts;
pub mod resilience;
pub mod search;
pub mod stage_cache;
pub mod store;
