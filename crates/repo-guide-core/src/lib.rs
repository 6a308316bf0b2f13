//! # repo-guide core
//!
//! Runtime-free logic for repo-guide: the data model, namespace keys, the
//! line-window chunker, the capability traits for embedding, vector
//! indexing and answer generation, the in-memory index, the
//! retrieval-orchestration flow and per-session chat history.
//!
//! This crate contains no tokio, sqlx, filesystem or process I/O. Timeouts
//! and retries are the job of the adapters that implement the traits.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod flow;
pub mod generate;
pub mod models;
pub mod namespace;
pub mod rank;
pub mod session;
pub mod store;
