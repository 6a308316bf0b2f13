//! Retrieval-orchestration flow.
//!
//! One question moves through a fixed sequence of stages:
//!
//! ```text
//! ReceiveQuery → EmbedQuery → Retrieve → AssembleContext
//!     → GenerateAnswer | TemplateAnswer → ReturnResult
//! ```
//!
//! The generate/template branch depends only on whether a [`Generator`] was
//! supplied. Every failure except an unreachable index degrades to the
//! templated, retrieval-only answer:
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | empty question | templated answer, no retrieval |
//! | query embedding fails | templated answer with a note, no citations |
//! | namespace embedded with another model | templated answer with a note, no retrieval |
//! | index query fails | [`AskError::Index`] |
//! | generation fails or returns nothing | templated answer with a note |

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{validate_batch, Embedder};
use crate::error::{AskError, SessionError};
use crate::generate::Generator;
use crate::models::Citation;
use crate::namespace::Namespace;
use crate::rank::{apply_path_priors, expand_query, merge_candidates};
use crate::session::ChatSession;
use crate::store::{IndexHit, VectorIndex};

/// Tuning knobs for one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowParams {
    /// Chunks handed to context assembly.
    pub top_k: usize,
    /// Candidates fetched per query when expansion or priors re-rank.
    pub candidate_k: usize,
    /// Upper bound on the rendered context, in characters.
    pub max_context_chars: usize,
    /// Per-chunk text cap inside the context, in characters.
    pub max_chunk_chars: usize,
    /// Sources listed in a templated answer.
    pub template_sources: usize,
    pub expand_queries: bool,
    pub path_priors: bool,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_k: 40,
            max_context_chars: 16_000,
            max_chunk_chars: 1_400,
            template_sources: 8,
            expand_queries: false,
            path_priors: false,
        }
    }
}

/// A state of the flow, recorded in the answer's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ReceiveQuery,
    EmbedQuery,
    Retrieve,
    AssembleContext,
    GenerateAnswer,
    TemplateAnswer,
    ReturnResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnswerMode {
    Generated,
    RetrievalOnly,
}

impl std::fmt::Display for AnswerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerMode::Generated => write!(f, "generated"),
            AnswerMode::RetrievalOnly => write!(f, "retrieval-only"),
        }
    }
}

/// Answer text before it is packaged, tagged with how it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    Generated(String),
    Templated(String),
}

impl Draft {
    pub fn mode(&self) -> AnswerMode {
        match self {
            Draft::Generated(_) => AnswerMode::Generated,
            Draft::Templated(_) => AnswerMode::RetrievalOnly,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Draft::Generated(text) | Draft::Templated(text) => text,
        }
    }
}

/// Result of one ask.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer_text: String,
    pub citations: Vec<Citation>,
    pub mode: AnswerMode,
    /// Degradations that happened along the way.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub stages: Vec<Stage>,
}

/// One labelled source inside the assembled context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBlock {
    /// `S1`, `S2`, ... in rank order.
    pub label: String,
    pub citation: Citation,
    pub score: f32,
    pub text: String,
}

impl ContextBlock {
    fn render(&self) -> String {
        format!("[{}] {}\n{}\n", self.label, self.citation, self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Context text handed to the generator.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(ContextBlock::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.blocks.iter().map(|b| b.citation.clone()).collect()
    }
}

/// Build the context from ranked hits.
///
/// Each chunk's text is capped at `max_chunk_chars`. When the rendered
/// context would exceed `max_context_chars`, the lowest-ranked blocks are
/// dropped first; if not even the best block fits, it is truncated.
pub fn assemble_context(
    hits: &[IndexHit],
    max_context_chars: usize,
    max_chunk_chars: usize,
) -> AssembledContext {
    let mut blocks: Vec<ContextBlock> = hits
        .iter()
        .enumerate()
        .map(|(i, hit)| ContextBlock {
            label: format!("S{}", i + 1),
            citation: hit.metadata.citation(),
            score: hit.score,
            text: truncate_chars(&hit.metadata.text, max_chunk_chars),
        })
        .collect();

    // Rendered length of the first n blocks: block lengths plus one
    // separator between neighbours.
    let mut total = 0usize;
    let mut keep = 0usize;
    for (i, block) in blocks.iter().enumerate() {
        let len = block.render().chars().count() + usize::from(i > 0);
        if total + len > max_context_chars {
            break;
        }
        total += len;
        keep += 1;
    }

    if keep == 0 && !blocks.is_empty() {
        let mut first = blocks.swap_remove(0);
        let header = first.render().chars().count() - first.text.chars().count();
        first.text = truncate_chars(&first.text, max_context_chars.saturating_sub(header));
        return AssembledContext {
            blocks: vec![first],
        };
    }

    blocks.truncate(keep);
    AssembledContext { blocks }
}

/// Embedding model a namespace's vectors were produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceModel {
    pub model: String,
    pub dims: usize,
}

impl NamespaceModel {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }

    fn matches(&self, embedder: &dyn Embedder) -> bool {
        self.model == embedder.model_name() && self.dims == embedder.dims()
    }
}

/// Why an answer was templated rather than generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateReason {
    NotConfigured,
    GenerationFailed,
    EmbeddingFailed,
    ModelMismatch,
    EmptyQuestion,
}

impl TemplateReason {
    fn headline(&self) -> &'static str {
        match self {
            TemplateReason::NotConfigured => "Retrieval-only answer (no generative model configured).",
            TemplateReason::GenerationFailed => {
                "Retrieval-only answer (the generative model was unavailable)."
            }
            TemplateReason::EmbeddingFailed => {
                "Retrieval-only answer (the question could not be embedded, so nothing was retrieved)."
            }
            TemplateReason::ModelMismatch => {
                "Retrieval-only answer (this repository was indexed with a different embedding model; re-ingest it to query)."
            }
            TemplateReason::EmptyQuestion => "Ask a question about the indexed repository.",
        }
    }
}

const PREVIEW_LINES: usize = 8;
const PREVIEW_CHARS: usize = 600;

/// Deterministic answer listing the top sources with a short preview of
/// each.
pub fn template_answer(
    question: &str,
    context: &AssembledContext,
    max_sources: usize,
    reason: TemplateReason,
) -> String {
    let mut out = String::from(reason.headline());
    if reason == TemplateReason::EmptyQuestion {
        return out;
    }

    if context.is_empty() {
        out.push_str("\n\nNo indexed content in this repository matched the question.");
        return out;
    }

    out.push_str(&format!(
        "\n\nMost relevant sources for \"{}\":\n",
        question.trim()
    ));
    for block in context.blocks.iter().take(max_sources) {
        out.push_str(&format!("\n[{}] {}\n", block.label, block.citation));
        let preview: String = block
            .text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(PREVIEW_LINES)
            .collect::<Vec<_>>()
            .join("\n");
        for line in truncate_chars(&preview, PREVIEW_CHARS).lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte, _)) => text[..byte].to_string(),
        None => text.to_string(),
    }
}

/// Runs questions against one index.
pub struct RetrievalFlow<'a> {
    embedder: &'a dyn Embedder,
    index: &'a dyn VectorIndex,
    generator: Option<&'a dyn Generator>,
    params: FlowParams,
    expected_model: Option<NamespaceModel>,
}

impl<'a> RetrievalFlow<'a> {
    pub fn new(
        embedder: &'a dyn Embedder,
        index: &'a dyn VectorIndex,
        generator: Option<&'a dyn Generator>,
        params: FlowParams,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            params,
            expected_model: None,
        }
    }

    /// Only query when the embedder matches the model the namespace was
    /// ingested with; otherwise answer from the template.
    pub fn expecting(mut self, model: Option<NamespaceModel>) -> Self {
        self.expected_model = model;
        self
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Answer `question` from the chunks stored under `namespace`.
    pub async fn run(&self, namespace: &Namespace, question: &str) -> Result<Answer, AskError> {
        let mut trace = Trace::default();
        trace.enter(Stage::ReceiveQuery);

        let question = question.trim();
        if question.is_empty() {
            let text = template_answer(
                question,
                &AssembledContext::default(),
                0,
                TemplateReason::EmptyQuestion,
            );
            return Ok(trace.finish(Draft::Templated(text), Vec::new()));
        }

        trace.enter(Stage::EmbedQuery);
        if let Some(expected) = self.expected_model.as_ref() {
            if !expected.matches(self.embedder) {
                warn!(
                    namespace = %namespace,
                    ingested_with = %expected.model,
                    configured = self.embedder.model_name(),
                    "embedding model mismatch; answering from template"
                );
                trace.note(format!(
                    "namespace {} was embedded with {} ({} dims) but the configured embedder is {} ({} dims)",
                    namespace,
                    expected.model,
                    expected.dims,
                    self.embedder.model_name(),
                    self.embedder.dims()
                ));
                trace.enter(Stage::TemplateAnswer);
                let text = template_answer(
                    question,
                    &AssembledContext::default(),
                    0,
                    TemplateReason::ModelMismatch,
                );
                return Ok(trace.finish(Draft::Templated(text), Vec::new()));
            }
        }
        let queries = if self.params.expand_queries {
            expand_query(question)
        } else {
            vec![question.to_string()]
        };
        let vectors = match self.embed_queries(&queries).await {
            Ok(v) => v,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "query embedding failed; answering from template");
                trace.note(format!("query embedding failed: {}", e));
                trace.enter(Stage::TemplateAnswer);
                let text = template_answer(
                    question,
                    &AssembledContext::default(),
                    0,
                    TemplateReason::EmbeddingFailed,
                );
                return Ok(trace.finish(Draft::Templated(text), Vec::new()));
            }
        };

        trace.enter(Stage::Retrieve);
        let hits = self.retrieve(namespace, &vectors).await?;
        debug!(namespace = %namespace, hits = hits.len(), "retrieved");

        trace.enter(Stage::AssembleContext);
        let context = assemble_context(
            &hits,
            self.params.max_context_chars,
            self.params.max_chunk_chars,
        );

        let (draft, citations) = match self.generator {
            Some(generator) => {
                trace.enter(Stage::GenerateAnswer);
                match generator.generate(&context.render(), question).await {
                    Ok(text) if !text.trim().is_empty() => {
                        (Draft::Generated(text.trim().to_string()), context.citations())
                    }
                    outcome => {
                        let reason = match outcome {
                            Err(e) => e.to_string(),
                            Ok(_) => "generation provider returned an empty answer".to_string(),
                        };
                        warn!(model = generator.model_name(), error = %reason, "generation failed; answering from template");
                        trace.note(format!("generation failed: {}", reason));
                        self.templated(&mut trace, question, &context, TemplateReason::GenerationFailed)
                    }
                }
            }
            None => self.templated(&mut trace, question, &context, TemplateReason::NotConfigured),
        };

        Ok(trace.finish(draft, citations))
    }

    /// Ask against the session's active namespace and record the turn.
    /// Blank questions are answered but not recorded.
    pub async fn ask_in_session(
        &self,
        session: &mut ChatSession,
        question: &str,
    ) -> Result<Answer, AskError> {
        let namespace = session
            .active_namespace()
            .cloned()
            .ok_or(SessionError::NoActiveNamespace)?;
        let answer = self.run(&namespace, question).await?;
        if !question.trim().is_empty() {
            session.record(question.trim(), &answer)?;
        }
        Ok(answer)
    }

    async fn embed_queries(&self, queries: &[String]) -> Result<Vec<Vec<f32>>, crate::error::EmbeddingError> {
        let vectors = self.embedder.embed(queries).await?;
        validate_batch(&vectors, queries.len(), self.embedder.dims())?;
        Ok(vectors)
    }

    async fn retrieve(
        &self,
        namespace: &Namespace,
        vectors: &[Vec<f32>],
    ) -> Result<Vec<IndexHit>, AskError> {
        let top_k = self.params.top_k;
        let reranks = self.params.expand_queries || self.params.path_priors;
        let k = if reranks {
            self.params.candidate_k.max(top_k)
        } else {
            top_k
        };

        let mut lists = Vec::with_capacity(vectors.len());
        for vector in vectors {
            lists.push(self.index.query(namespace, vector, k).await?);
        }
        let mut hits = if lists.len() == 1 {
            lists.pop().unwrap_or_default()
        } else {
            merge_candidates(lists)
        };
        if self.params.path_priors {
            apply_path_priors(&mut hits);
        }
        hits.truncate(top_k);
        Ok(hits)
    }

    fn templated(
        &self,
        trace: &mut Trace,
        question: &str,
        context: &AssembledContext,
        reason: TemplateReason,
    ) -> (Draft, Vec<Citation>) {
        trace.enter(Stage::TemplateAnswer);
        let shown = self.params.template_sources;
        let text = template_answer(question, context, shown, reason);
        let citations = context.citations().into_iter().take(shown).collect();
        (Draft::Templated(text), citations)
    }
}

#[derive(Default)]
struct Trace {
    stages: Vec<Stage>,
    notes: Vec<String>,
}

impl Trace {
    fn enter(&mut self, stage: Stage) {
        debug!(?stage, "flow stage");
        self.stages.push(stage);
    }

    fn note(&mut self, note: String) {
        self.notes.push(note);
    }

    fn finish(mut self, draft: Draft, citations: Vec<Citation>) -> Answer {
        if !self.stages.contains(&Stage::TemplateAnswer) && matches!(draft, Draft::Templated(_)) {
            self.enter(Stage::TemplateAnswer);
        }
        self.enter(Stage::ReturnResult);
        Answer {
            mode: draft.mode(),
            answer_text: draft.into_text(),
            citations,
            notes: self.notes,
            stages: self.stages,
        }
    }
}
