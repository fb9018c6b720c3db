//! Error taxonomy shared by every layer of rag-chat.
//!
//! Collaborators (crawler, embedder, vector store, language model,
//! repositories) report failures as [`RagError`]. The resilience layer in
//! the app crate consults [`RagError::is_retryable`] to decide whether an
//! attempt is worth repeating, and the HTTP adapter maps each variant to a
//! status code.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// External dependency types, each guarded by its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Crawler,
    Embedder,
    VectorStore,
    LanguageModel,
}

impl Dependency {
    pub const ALL: [Dependency; 4] = [
        Dependency::Crawler,
        Dependency::Embedder,
        Dependency::VectorStore,
        Dependency::LanguageModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Crawler => "crawler",
            Dependency::Embedder => "embedder",
            Dependency::VectorStore => "vector_store",
            Dependency::LanguageModel => "llm",
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// Bad input shape. Never retried; surfaced as a client error.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing agent or knowledge space.
    #[error("{0} not found")]
    NotFound(String),

    /// A collaborator call failed. `status_code` is `None` for transport
    /// failures (timeouts, resets, refused connections).
    #[error("{dependency} call failed{}: {message}", status_suffix(.status_code))]
    ExternalService {
        dependency: Dependency,
        status_code: Option<u16>,
        message: String,
    },

    /// The dependency's breaker is open; no attempt was made.
    #[error("circuit breaker open for {dependency}")]
    CircuitOpen { dependency: Dependency },

    /// Every attempt allowed by the retry policy failed.
    #[error("{dependency} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        dependency: Dependency,
        attempts: u32,
        #[source]
        source: Box<RagError>,
    },

    #[error("no user message found in conversation")]
    NoUserMessage,

    /// Embedding the query failed; fatal for the chat turn.
    #[error("failed to embed query: {0}")]
    EmbeddingFailed(#[source] Box<RagError>),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl RagError {
    pub fn external(
        dependency: Dependency,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        RagError::ExternalService {
            dependency,
            status_code,
            message: message.into(),
        }
    }

    pub fn persistence(err: impl fmt::Display) -> Self {
        RagError::Persistence(err.to_string())
    }

    /// Whether another attempt at the same call could plausibly succeed.
    ///
    /// Transport failures, 408, 429 and 5xx are transient. Other 4xx
    /// responses and validation failures are not. A `CircuitOpen` coming
    /// back from a nested call is transient from the caller's point of view;
    /// the caller's own breaker is checked before each attempt instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::ExternalService { status_code, .. } => match status_code {
                None => true,
                Some(408) | Some(429) => true,
                Some(code) => *code >= 500,
            },
            RagError::CircuitOpen { .. } => true,
            RagError::Timeout(_) => true,
            RagError::RetriesExhausted { .. }
            | RagError::Validation(_)
            | RagError::NotFound(_)
            | RagError::NoUserMessage
            | RagError::EmbeddingFailed(_)
            | RagError::Persistence(_) => false,
        }
    }

    /// The dependency this error is attributed to, if any.
    pub fn dependency(&self) -> Option<Dependency> {
        match self {
            RagError::ExternalService { dependency, .. }
            | RagError::CircuitOpen { dependency }
            | RagError::RetriesExhausted { dependency, .. } => Some(*dependency),
            RagError::EmbeddingFailed(inner) => inner.dependency(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_and_server_errors_retry() {
        assert!(RagError::external(Dependency::Crawler, None, "reset").is_retryable());
        assert!(RagError::external(Dependency::Embedder, Some(503), "down").is_retryable());
        assert!(RagError::external(Dependency::Embedder, Some(429), "slow down").is_retryable());
    }

    #[test]
    fn test_client_errors_do_not_retry() {
        assert!(!RagError::external(Dependency::Crawler, Some(400), "bad url").is_retryable());
        assert!(!RagError::external(Dependency::LanguageModel, Some(401), "key").is_retryable());
        assert!(!RagError::Validation("name is required".into()).is_retryable());
        assert!(!RagError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn test_nested_circuit_open_is_transient() {
        let err = RagError::CircuitOpen {
            dependency: Dependency::VectorStore,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_display_includes_dependency_and_status() {
        let err = RagError::external(Dependency::VectorStore, Some(502), "bad gateway");
        assert_eq!(err.to_string(), "vector_store call failed (502): bad gateway");
        let err = RagError::external(Dependency::Crawler, None, "timed out");
        assert_eq!(err.to_string(), "crawler call failed: timed out");
    }

    #[test]
    fn test_dependency_unwraps_embedding_failure() {
        let err = RagError::EmbeddingFailed(Box::new(RagError::CircuitOpen {
            dependency: Dependency::Embedder,
        }));
        assert_eq!(err.dependency(), Some(Dependency::Embedder));
    }
}
