//! Error taxonomy shared by the core and its adapters.
//!
//! Loader errors live next to the Git loader in the application crate;
//! per-file chunking problems are [`ChunkingWarning`](crate::models::ChunkingWarning)s,
//! not errors.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by an [`Embedder`](crate::embedding::Embedder).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    /// Rate limiting, server errors and transport failures.
    #[error("embedding provider unavailable: {0}")]
    Transient(String),
    /// The provider refused the request; retrying will not help.
    #[error("embedding provider rejected the request: {0}")]
    Rejected(String),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("embedding provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding provider is disabled")]
    Disabled,
}

impl EmbeddingError {
    /// Whether a bounded retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_) | EmbeddingError::Timeout(_))
    }
}

/// Failure reported by a [`VectorIndex`](crate::store::VectorIndex).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    #[error("index write failed: {0}")]
    Write(String),
    #[error("index query failed: {0}")]
    Query(String),
    #[error("vector has {actual} dimensions, index is configured for {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Failure reported by a [`Generator`](crate::generate::Generator).
///
/// The retrieval flow never surfaces this to its caller; it falls back to
/// the templated answer instead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("generation provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation provider returned an empty answer")]
    Empty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active namespace; ingest or select a repository first")]
    NoActiveNamespace,
}

/// Failures the query path lets through. Everything else degrades to a
/// templated answer; what remains is an unreachable index or asking
/// without an active namespace.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AskError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
