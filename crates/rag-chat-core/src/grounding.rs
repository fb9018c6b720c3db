//! Decide whether a turn answers from context or refuses.

use crate::models::ScoredChunk;

/// Fixed answer for strict agents when nothing relevant was retrieved.
/// Also quoted verbatim in the system prompt.
pub const REFUSAL_MESSAGE: &str =
    "I could not find any information about this in the available documents.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingDecision {
    /// Return [`REFUSAL_MESSAGE`] without calling the language model.
    Refuse,
    /// Assemble a prompt and call the language model.
    Answer,
}

impl GroundingDecision {
    /// Value of the turn's `grounded` flag.
    pub fn is_grounded(&self) -> bool {
        matches!(self, GroundingDecision::Answer)
    }
}

/// Refuse only when the agent is strict and the context set is empty.
///
/// A non-strict agent with empty context still answers: the model then
/// responds without any retrieved material.
pub fn decide(strict_grounding: bool, context: &[ScoredChunk]) -> GroundingDecision {
    if strict_grounding && context.is_empty() {
        GroundingDecision::Refuse
    } else {
        GroundingDecision::Answer
    }
}
