//! Per-session conversation history scoped to one namespace.
//!
//! Switching the active namespace clears the history unconditionally, so
//! answers about one repository never leak into a conversation about
//! another.

use serde::Serialize;

use crate::error::SessionError;
use crate::flow::Answer;
use crate::models::Citation;
use crate::namespace::Namespace;

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Conversation state owned by whoever drives the session (CLI, UI).
#[derive(Debug, Default)]
pub struct ChatSession {
    active: Option<Namespace>,
    turns: Vec<Turn>,
    recent: Vec<Namespace>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_namespace(&self) -> Option<&Namespace> {
        self.active.as_ref()
    }

    /// Make `namespace` active. Returns `true` when the active namespace
    /// changed, in which case the history has been cleared.
    pub fn set_active_namespace(&mut self, namespace: Namespace) -> bool {
        self.recent.retain(|ns| ns != &namespace);
        self.recent.insert(0, namespace.clone());

        if self.active.as_ref() == Some(&namespace) {
            return false;
        }
        self.turns.clear();
        self.active = Some(namespace);
        true
    }

    pub fn append_turn(
        &mut self,
        question: impl Into<String>,
        answer: impl Into<String>,
        citations: Vec<Citation>,
    ) -> Result<(), SessionError> {
        if self.active.is_none() {
            return Err(SessionError::NoActiveNamespace);
        }
        self.turns.push(Turn {
            question: question.into(),
            answer: answer.into(),
            citations,
        });
        Ok(())
    }

    /// Append the outcome of an ask.
    pub fn record(&mut self, question: &str, answer: &Answer) -> Result<(), SessionError> {
        self.append_turn(question, answer.answer_text.clone(), answer.citations.clone())
    }

    /// Turns in the order they were appended.
    pub fn history(&self) -> &[Turn] {
        &self.turns
    }

    /// Drop the history but keep the active namespace.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Namespaces activated in this session, most recent first.
    pub fn recent_namespaces(&self) -> &[Namespace] {
        &self.recent
    }
}
