//! File selection and decoding for a working copy.
//!
//! Walks the checkout, applies the include globs and the deny list, skips
//! oversized and binary files, and decodes the rest into [`SourceFile`]s.
//! A file that cannot be read or decoded becomes a [`ChunkingWarning`]; it
//! never fails the walk.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use repo_guide_core::models::{ChunkingWarning, SourceFile, TextEncoding};

use crate::config::ChunkingConfig;

/// Paths never worth indexing: dependencies, build output, caches, lock
/// files and minified assets.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/vendor/**",
    "**/.venv/**",
    "**/venv/**",
    "**/__pycache__/**",
    "**/.mypy_cache/**",
    "**/.pytest_cache/**",
    "**/.tox/**",
    "**/*.lock",
    "**/package-lock.json",
    "**/pnpm-lock.yaml",
    "**/*.min.js",
    "**/*.min.css",
    "**/*.map",
];

/// Bytes inspected for a NUL when sniffing binary content.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Files left out of an ingestion, by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub excluded: usize,
    pub too_large: usize,
    pub binary: usize,
    pub unreadable: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.excluded + self.too_large + self.binary + self.unreadable
    }
}

#[derive(Debug, Default)]
pub struct Selection {
    /// Sorted by path.
    pub files: Vec<SourceFile>,
    pub warnings: Vec<ChunkingWarning>,
    pub skipped: SkipCounts,
}

pub struct FileSelector {
    include: Option<GlobSet>,
    exclude: GlobSet,
    max_file_bytes: u64,
}

impl FileSelector {
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        let include = if config.include_globs.is_empty() {
            None
        } else {
            Some(build_globset(&config.include_globs)?)
        };
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            include,
            exclude: build_globset(&excludes)?,
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Select and decode every eligible file under `root`.
    pub fn select(&self, root: &Path) -> Selection {
        let mut selection = Selection::default();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| relative_path(root, p))
                        .unwrap_or_default();
                    selection.skipped.unreadable += 1;
                    selection.warnings.push(ChunkingWarning {
                        file_path: path,
                        reason: format!("unreadable: {}", e),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative_path(root, entry.path());
            if self.exclude.is_match(&rel) {
                selection.skipped.excluded += 1;
                continue;
            }
            if let Some(include) = &self.include {
                if !include.is_match(&rel) {
                    selection.skipped.excluded += 1;
                    continue;
                }
            }

            match entry.metadata() {
                Ok(meta) if meta.len() > self.max_file_bytes => {
                    selection.skipped.too_large += 1;
                    selection.warnings.push(ChunkingWarning {
                        file_path: rel,
                        reason: format!(
                            "larger than {} bytes ({} bytes)",
                            self.max_file_bytes,
                            meta.len()
                        ),
                    });
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    selection.skipped.unreadable += 1;
                    selection.warnings.push(ChunkingWarning {
                        file_path: rel,
                        reason: format!("unreadable: {}", e),
                    });
                    continue;
                }
            }

            let bytes = match std::fs::read(entry.path()) {
                Ok(b) => b,
                Err(e) => {
                    selection.skipped.unreadable += 1;
                    selection.warnings.push(ChunkingWarning {
                        file_path: rel,
                        reason: format!("unreadable: {}", e),
                    });
                    continue;
                }
            };

            match decode_text(&bytes) {
                Decoded::Text(text, encoding) => selection.files.push(SourceFile {
                    path: rel,
                    text,
                    encoding,
                }),
                Decoded::Binary => {
                    debug!(path = %rel, "skipping binary file");
                    selection.skipped.binary += 1;
                }
                Decoded::Invalid(reason) => {
                    selection.skipped.unreadable += 1;
                    selection.warnings.push(ChunkingWarning {
                        file_path: rel,
                        reason,
                    });
                }
            }
        }

        selection.files.sort_by(|a, b| a.path.cmp(&b.path));
        selection
    }
}

/// Outcome of decoding one file's bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Text(String, TextEncoding),
    Binary,
    Invalid(String),
}

/// Decode UTF-8 (optionally with BOM) or BOM-marked UTF-16. Anything with a
/// NUL byte near the start and no UTF-16 BOM is treated as binary.
pub fn decode_text(bytes: &[u8]) -> Decoded {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes, TextEncoding::Utf16Le);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes, TextEncoding::Utf16Be);
    }

    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    if sniff.contains(&0) {
        return Decoded::Binary;
    }

    let (body, encoding) = match bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        Some(rest) => (rest, TextEncoding::Utf8Bom),
        None => (bytes, TextEncoding::Utf8),
    };
    match std::str::from_utf8(body) {
        Ok(s) => Decoded::Text(s.to_string(), encoding),
        Err(e) => Decoded::Invalid(format!("not valid UTF-8: {}", e)),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16, encoding: TextEncoding) -> Decoded {
    if bytes.len() % 2 != 0 {
        return Decoded::Invalid("truncated UTF-16 data".to_string());
    }
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    match char::decode_utf16(units).collect::<Result<String, _>>() {
        Ok(s) => Decoded::Text(s, encoding),
        Err(e) => Decoded::Invalid(format!("not valid UTF-16: {}", e)),
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
