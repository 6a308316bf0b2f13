//! TOML configuration.
//!
//! Every section is optional; a missing section or key takes the default
//! from the matching `default_*` function. Secrets are never read from the
//! file: the OpenAI key comes from `OPENAI_API_KEY`.
//!
//! ```toml
//! [db]
//! path = "./data/repo-guide.sqlite"
//!
//! [loader]
//! repos_dir = "./data/repos"
//!
//! [embedding]
//! provider = "local"
//!
//! [retrieval]
//! top_k = 5
//! ```

use anyhow::{bail, Context, Result};
use repo_guide_core::chunk::ChunkParams;
use repo_guide_core::embedding::Metric;
use repo_guide_core::flow::FlowParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/repo-guide.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    /// Parent directory of the working copies.
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    /// Branch to check out; the remote default branch when unset.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default = "default_clone_attempts")]
    pub clone_attempts: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
            branch: None,
            git_timeout_secs: default_git_timeout_secs(),
            clone_attempts: default_clone_attempts(),
        }
    }
}

impl LoaderConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("./data/repos")
}
fn default_git_timeout_secs() -> u64 {
    300
}
fn default_clone_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Files larger than this are skipped with a warning.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// When non-empty, only matching paths are indexed.
    #[serde(default)]
    pub include_globs: Vec<String>,
    /// Added to the built-in deny list.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            overlap_lines: default_overlap_lines(),
            max_chars: default_max_chars(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            max_lines: self.max_lines,
            overlap_lines: self.overlap_lines,
            max_chars: self.max_chars,
        }
    }
}

fn default_max_lines() -> usize {
    60
}
fn default_overlap_lines() -> usize {
    10
}
fn default_max_chars() -> usize {
    2400
}
fn default_max_file_bytes() -> u64 {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches in flight at once during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            query_timeout_secs: default_query_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    30
}
fn default_write_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_template_sources")]
    pub template_sources: usize,
    #[serde(default)]
    pub expand_queries: bool,
    #[serde(default)]
    pub path_priors: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            max_context_chars: default_max_context_chars(),
            max_chunk_chars: default_max_chunk_chars(),
            template_sources: default_template_sources(),
            expand_queries: false,
            path_priors: false,
        }
    }
}

impl RetrievalConfig {
    pub fn flow_params(&self) -> FlowParams {
        FlowParams {
            top_k: self.top_k,
            candidate_k: self.candidate_k,
            max_context_chars: self.max_context_chars,
            max_chunk_chars: self.max_chunk_chars,
            template_sources: self.template_sources,
            expand_queries: self.expand_queries,
            path_priors: self.path_priors,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_candidate_k() -> usize {
    40
}
fn default_max_context_chars() -> usize {
    16_000
}
fn default_max_chunk_chars() -> usize {
    1_400
}
fn default_template_sources() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `openai` or `disabled`. An `openai` provider without
    /// `OPENAI_API_KEY` answers in retrieval-only mode.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_generation_timeout_secs(),
            url: None,
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    800
}
fn default_generation_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Loader
    if config.loader.clone_attempts == 0 {
        bail!("loader.clone_attempts must be >= 1");
    }
    if config.loader.git_timeout_secs == 0 {
        bail!("loader.git_timeout_secs must be > 0");
    }

    // Chunking
    if config.chunking.max_lines == 0 {
        bail!("chunking.max_lines must be > 0");
    }
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_lines >= config.chunking.max_lines {
        bail!("chunking.overlap_lines must be smaller than chunking.max_lines");
    }

    // Retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    // Embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if embedding.dims.is_none() || embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }

    // Generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
