#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

use repo_guide::config::Config;
use repo_guide_core::embedding::Embedder;
use repo_guide_core::error::EmbeddingError;

pub const DIMS: usize = 64;

/// Deterministic bag-of-words embedder: each lowercase word bumps one of
/// `DIMS` buckets chosen by a byte-sum hash.
pub struct WordEmbedder {
    /// Texts containing this marker are rejected.
    pub reject_marker: Option<String>,
    pub model: String,
    pub calls: AtomicUsize,
}

impl WordEmbedder {
    pub fn new() -> Self {
        Self {
            reject_marker: None,
            model: "bag-of-words".to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Same vectors, reported under another model name.
    pub fn named(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::new()
        }
    }

    pub fn rejecting(marker: &str) -> Self {
        Self {
            reject_marker: Some(marker.to_string()),
            ..Self::new()
        }
    }
}

pub fn word_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
    {
        let word = word.to_lowercase();
        let bucket = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
        v[bucket % DIMS] += 1.0;
    }
    v
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.reject_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbeddingError::Rejected("input contains marker".to_string()));
            }
        }
        Ok(texts.iter().map(|t| word_vector(t)).collect())
    }
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A small repository with five text files, one binary file and one
/// dependency directory, committed on `main`.
pub fn make_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin");
    write(&origin, "README.md", "# Widgets\n\nWidgets parses CSV files and renders charts.\n\n## Setup\n\nRun `cargo build` to compile the project.\n");
    write(&origin, "Cargo.toml", "[package]\nname = \"widgets\"\nversion = \"0.1.0\"\n");
    write(&origin, "src/main.rs", "mod parser;\n\nfn main() {\n    let rows = parser::parse_csv(\"a,b\\n1,2\");\n    println!(\"{}\", rows.len());\n}\n");
    write(&origin, "src/parser.rs", &numbered("pub fn parse_csv_row(line: &str) -> Vec<String> { line.split(',').map(String::from).collect() }", 150));
    write(&origin, "docs/charts.md", "# Charts\n\nCharts are rendered with the plot module.\n");
    write(&origin, "node_modules/dep/index.js", "module.exports = 1;\n");
    let logo = origin.join("logo.png");
    std::fs::write(logo, [0x89u8, b'P', b'N', b'G', 0, 0, 0, 1]).unwrap();

    git(&origin, &["init", "--quiet"]);
    git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "--quiet", "-m", "initial"]);
    origin
}

pub fn commit_file(origin: &Path, rel: &str, content: &str) -> String {
    write(origin, rel, content);
    git(origin, &["add", "."]);
    git(origin, &["commit", "--quiet", "-m", "update"]);
    git(origin, &["rev-parse", "HEAD"])
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// `n` lines of `line`, each prefixed with its line number.
pub fn numbered(line: &str, n: usize) -> String {
    (1..=n).map(|i| format!("// {}\n{}\n", i, line)).collect::<Vec<_>>().join("")
}

/// A config rooted in `tmp` with generation disabled.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data/guide.sqlite");
    config.loader.repos_dir = tmp.path().join("data/repos");
    config.loader.git_timeout_secs = 60;
    config.generation.provider = "disabled".to_string();
    config.embedding.batch_size = 8;
    config.embedding.concurrency = 3;
    config
}
