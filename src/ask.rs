//! Process-level wiring for ingestion and question answering.
//!
//! [`Assistant`] owns the configured providers, the SQLite index and the
//! Git loader, and hands out borrowed [`RetrievalFlow`]s and [`Ingestor`]s.
//! The CLI builds one per invocation; the `chat` loop keeps one alive for
//! the whole session.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::warn;

use repo_guide_core::embedding::Embedder;
use repo_guide_core::error::{AskError, IndexError};
use repo_guide_core::flow::{Answer, FlowParams, NamespaceModel, RetrievalFlow};
use repo_guide_core::generate::Generator;
use repo_guide_core::namespace::Namespace;
use repo_guide_core::session::ChatSession;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::files::FileSelector;
use crate::generate::create_generator;
use crate::ingest::{IngestError, IngestReport, Ingestor};
use crate::loader::GitLoader;
use crate::progress::IngestProgress;
use crate::sqlite_index::{NamespaceEntry, SqliteIndex};

/// How the caller names the namespace to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceTarget {
    /// A namespace key as printed by `ingest` or `namespaces`.
    Key(String),
    /// A repository URL; resolves to its most recent ingestion.
    Repository(String),
}

pub struct Assistant {
    config: Config,
    embedder: Box<dyn Embedder>,
    generator: Option<Box<dyn Generator>>,
    index: SqliteIndex,
    loader: GitLoader,
    selector: Arc<FileSelector>,
    params: FlowParams,
}

impl Assistant {
    /// Build the providers named in `config` and open the index.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Self::from_parts(config, embedder, generator).await
    }

    /// Assemble an assistant around already-built providers.
    pub async fn from_parts(
        config: &Config,
        embedder: Box<dyn Embedder>,
        generator: Option<Box<dyn Generator>>,
    ) -> Result<Self> {
        let index = SqliteIndex::open(config, embedder.dims()).await?;
        Ok(Self {
            config: config.clone(),
            loader: GitLoader::new(&config.loader),
            selector: Arc::new(FileSelector::new(&config.chunking)?),
            params: config.retrieval.flow_params(),
            embedder,
            generator,
            index,
        })
    }

    pub fn index(&self) -> &SqliteIndex {
        &self.index
    }

    pub fn flow(&self) -> RetrievalFlow<'_> {
        RetrievalFlow::new(
            self.embedder.as_ref(),
            &self.index,
            self.generator.as_deref(),
            self.params.clone(),
        )
    }

    pub fn is_generating(&self) -> bool {
        self.generator.is_some()
    }

    /// Answer from `namespace`. A namespace in the catalog is only queried
    /// with the embedding model it was ingested with.
    pub async fn ask(&self, namespace: &Namespace, question: &str) -> Result<Answer, AskError> {
        let model = self.namespace_model(namespace).await?;
        self.flow().expecting(model).run(namespace, question).await
    }

    pub async fn ask_in_session(
        &self,
        session: &mut ChatSession,
        question: &str,
    ) -> Result<Answer, AskError> {
        let model = match session.active_namespace() {
            Some(namespace) => self.namespace_model(namespace).await?,
            None => None,
        };
        self.flow()
            .expecting(model)
            .ask_in_session(session, question)
            .await
    }

    async fn namespace_model(&self, namespace: &Namespace) -> Result<Option<NamespaceModel>, IndexError> {
        Ok(self
            .index
            .get_namespace(namespace.as_str())
            .await?
            .map(|entry| NamespaceModel::new(entry.model, entry.dims)))
    }

    /// Ingest `url`; `branch` overrides `[loader].branch`.
    pub async fn ingest(
        &self,
        url: &str,
        branch: Option<&str>,
        progress: &dyn IngestProgress,
    ) -> Result<IngestReport, IngestError> {
        let embedding = &self.config.embedding;
        Ingestor::new(
            &self.loader,
            Arc::clone(&self.selector),
            self.config.chunking.params(),
            self.embedder.as_ref(),
            &self.index,
            &self.index,
            embedding.batch_size,
            embedding.concurrency,
            progress,
        )
        .ingest(url, branch)
        .await
    }

    pub async fn namespaces(&self) -> Result<Vec<NamespaceEntry>, IndexError> {
        self.index.list_namespaces().await
    }

    /// Look up the catalog entry for `target`.
    ///
    /// Warns when the namespace was ingested with a different embedding
    /// model than the one configured now; [`Assistant::ask`] will then
    /// answer from the template without querying.
    pub async fn resolve_namespace(&self, target: &NamespaceTarget) -> Result<NamespaceEntry> {
        let entry = match target {
            NamespaceTarget::Key(key) => match self.index.get_namespace(key.trim()).await? {
                Some(entry) => entry,
                None => bail!(
                    "Unknown namespace '{}'. Run `repo-guide namespaces` to list ingested repositories.",
                    key.trim()
                ),
            },
            NamespaceTarget::Repository(url) => match self.index.latest_for_url(url).await? {
                Some(entry) => entry,
                None => bail!(
                    "Repository '{}' has not been ingested. Run `repo-guide ingest {}` first.",
                    url,
                    url
                ),
            },
        };

        if entry.model != self.embedder.model_name() || entry.dims != self.embedder.dims() {
            warn!(
                namespace = %entry.namespace,
                ingested_with = %entry.model,
                configured = %self.embedder.model_name(),
                "namespace was embedded with a different model; re-ingest to query it"
            );
        }
        Ok(entry)
    }
}
