//! Core data models shared by the ingestion and query paths.
//!
//! Repositories, commits and source files only live for the duration of an
//! ingestion request. What survives is the [`Chunk`] (as [`ChunkMetadata`]
//! plus its vector) inside the vector index.

use serde::{Deserialize, Serialize};

/// Text encoding detected (or assumed) when a file was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
}

/// A decoded source file scoped to one commit.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub text: String,
    pub encoding: TextEncoding,
}

/// A contiguous, line-aligned slice of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_path: String,
    /// First line covered, 1-based inclusive.
    pub start_line: u32,
    /// Last line covered, 1-based inclusive.
    pub end_line: u32,
    pub text: String,
    /// Position of this chunk within its file, contiguous from 0.
    pub sequence_index: u32,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

impl Chunk {
    pub fn citation(&self) -> Citation {
        Citation {
            file_path: self.file_path.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }

    /// Metadata stored alongside the vector in the index.
    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            file_path: self.file_path.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
            sequence_index: self.sequence_index,
            text: self.text.clone(),
        }
    }
}

/// Reference to the file/line span that grounds part of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (lines {}-{})",
            self.file_path, self.start_line, self.end_line
        )
    }
}

/// Per-vector metadata held by the index.
///
/// Chunk text is stored here so retrieval never needs a second content
/// fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub sequence_index: u32,
    pub text: String,
}

impl ChunkMetadata {
    pub fn citation(&self) -> Citation {
        Citation {
            file_path: self.file_path.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }
}

/// Non-fatal, per-file problem found while selecting or chunking files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkingWarning {
    pub file_path: String,
    pub reason: String,
}

impl std::fmt::Display for ChunkingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped {}: {}", self.file_path, self.reason)
    }
}
