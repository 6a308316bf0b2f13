//! Generative-model capability and the grounding instruction.
//!
//! A [`Generator`] is optional. When none is configured the retrieval flow
//! answers from a template instead; that is a supported mode, not an error
//! path.

use async_trait::async_trait;

use crate::error::GenerationError;

/// System instruction sent with every generation request.
pub const GROUNDING_INSTRUCTION: &str = "You are a source-code onboarding assistant. \
Answer using ONLY the numbered sources provided. \
If the answer cannot be derived from those sources, say that the indexed repository \
does not contain enough information instead of guessing. \
Cite sources as [S1], [S2] after each statement that relies on them. \
If you infer something, prefix it with \"Likely:\" and cite the sources that support it.";

/// Produces an answer from assembled context and a question.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;

    async fn generate(&self, context: &str, question: &str) -> Result<String, GenerationError>;
}

/// User message combining the question with the rendered context.
pub fn grounded_prompt(context: &str, question: &str) -> String {
    let sources = if context.trim().is_empty() {
        "(no relevant sources found)"
    } else {
        context
    };
    format!(
        "Question: {}\n\nSources:\n{}\n\nAnswer the question from the sources above. \
         Prefer core code paths (src/, package modules) over tooling unless asked.",
        question.trim(),
        sources
    )
}
