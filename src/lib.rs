//! # Repo Guide
//!
//! Ingest a source-code repository and answer questions about it, grounded
//! in cited chunks of its files.
//!
//! This crate is the process-facing half of the system: configuration, the
//! Git loader, file selection, provider adapters, the SQLite vector index,
//! the ingestion pipeline and the CLI wiring. The runtime-free half (data
//! model, chunker, namespace keys, retrieval flow, session state) lives in
//! [`repo_guide_core`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────┐   ┌───────────────┐
//! │  Loader  │──▶│ Select+Chunk  │──▶│ Embedder │──▶│ SQLite index  │
//! │  (git)   │   │ (files, core) │   │          │   │ (namespaced)  │
//! └──────────┘   └───────────────┘   └──────────┘   └──────┬────────┘
//!                                                          │
//!                 ┌───────────────┐   ┌───────────┐         │
//!   question ───▶ │ Retrieval flow│──▶│ Generator │   ◀─────┘
//!                 │    (core)     │   │ (optional)│
//!                 └───────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repo-guide init
//! repo-guide ingest https://github.com/acme/widgets
//! repo-guide ask --repo https://github.com/acme/widgets "What does this repo do?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema creation |
//! | [`loader`] | Git clone/update with per-URL locking |
//! | [`files`] | File selection and text decoding |
//! | [`embedding`] | Embedding providers and the retry/timeout wrapper |
//! | [`generate`] | Optional answer generation |
//! | [`sqlite_index`] | Namespace-scoped vector index and catalog |
//! | [`ingest`] | Ingestion pipeline |
//! | [`ask`] | Wiring of providers, index, ingestion and the retrieval flow |
//! | [`progress`] | Ingestion progress on stderr |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod files;
pub mod generate;
pub mod ingest;
pub mod loader;
pub mod migrate;
pub mod progress;
pub mod sqlite_index;
