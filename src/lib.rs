//! # Index Harness
//!
//! Keeps a remote search index consistent with a source corpus.
//!
//! Index Harness diffs the desired schema against the live one, reads the
//! index's health, picks a reindexing strategy, and streams documents into
//! the index in retried batches, with embeddings served from a
//! content-addressed cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Corpus    │──▶│   Pipeline   │──▶│  Index Ops  │──▶ search service
//! │  FS / Vec   │   │ Embed+Batch  │   │ (transport) │
//! └─────────────┘   └──────▲───────┘   └──────▲──────┘
//!                          │                  │
//!                   ┌──────┴──────────────────┴──────┐
//!                   │        Reindex Controller       │
//!                   │  schema diff · health · decide  │
//!                   └─────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ixh check-config              # validate configuration
//! ixh health                    # document count, storage, schema compliance
//! ixh schema plan               # show the schema diff
//! ixh reindex --dry-run         # show the strategy that would run
//! ixh reindex                   # run it
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | `IndexError` taxonomy |
//! | [`models`] | Documents, outcomes, scopes |
//! | [`transport`] | HTTP client with retry/backoff |
//! | [`index_ops`] | `SearchService` trait and HTTP `IndexClient` |
//! | [`memory`] | In-memory `SearchService` |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_cache`] | LRU + TTL embedding cache |
//! | [`pipeline`] | Batched, retried document upload |
//! | [`schema`] | Schema definitions, diffing, automation |
//! | [`health`] | Index health snapshots |
//! | [`reindex`] | Strategy decision and execution |
//! | [`manifest`] | Content-hash state for incremental runs |
//! | [`corpus`] | Source corpus abstraction |
//! | [`connector_fs`] | Filesystem corpus |
//! | [`progress`] | Progress reporting |
//! | [`config`] | TOML configuration parsing |

pub mod config;
pub mod connector_fs;
pub mod corpus;
pub mod embed_cache;
pub mod embedding;
pub mod error;
pub mod health;
pub mod index_ops;
pub mod manifest;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reindex;
pub mod schema;
pub mod transport;
