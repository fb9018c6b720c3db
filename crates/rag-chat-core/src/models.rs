//! Core data models that flow through ingestion and chat turns.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Per-source ingestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Complete,
    Failed,
}

/// Aggregate ingestion state of a knowledge space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Partial,
    Complete,
    Failed,
}

impl IngestionStatus {
    /// `complete` if every source succeeded, `failed` if none did,
    /// `partial` otherwise. Any source still pending keeps the space pending.
    pub fn from_sources(sources: &[SourceState]) -> Self {
        if sources.is_empty() || sources.iter().any(|s| s.status == SourceStatus::Pending) {
            return IngestionStatus::Pending;
        }
        let ok = sources
            .iter()
            .filter(|s| s.status == SourceStatus::Complete)
            .count();
        if ok == sources.len() {
            IngestionStatus::Complete
        } else if ok == 0 {
            IngestionStatus::Failed
        } else {
            IngestionStatus::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Partial => "partial",
            IngestionStatus::Complete => "complete",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub url: String,
    pub status: SourceStatus,
}

/// A named set of crawled sources, isolated in its own vector namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSpace {
    pub tenant_id: String,
    pub id: String,
    pub name: String,
    /// Creation date (`YYYY-MM-DD`), part of the namespace.
    pub version: String,
    pub sources: Vec<SourceState>,
    pub status: IngestionStatus,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeSpace {
    /// A fresh space with every source pending.
    pub fn new(
        tenant_id: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        source_urls: &[String],
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            id: id.into(),
            name: name.into(),
            version: version_for(created_at.date_naive()),
            sources: source_urls
                .iter()
                .map(|url| SourceState {
                    url: url.clone(),
                    status: SourceStatus::Pending,
                })
                .collect(),
            status: IngestionStatus::Pending,
            created_at,
        }
    }

    /// Vector-store namespace: `t_{tenant}_ks_{id}_{version}`.
    pub fn namespace(&self) -> String {
        format!("t_{}_ks_{}_{}", self.tenant_id, self.id, self.version)
    }

    pub fn source_urls(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.url.clone()).collect()
    }

    pub fn set_source_status(&mut self, url: &str, status: SourceStatus) {
        for source in self.sources.iter_mut().filter(|s| s.url == url) {
            source.status = status;
        }
        self.status = IngestionStatus::from_sources(&self.sources);
    }
}

fn version_for(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// An agent answers from the knowledge spaces it is linked to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub tenant_id: String,
    pub id: String,
    pub name: String,
    pub knowledge_space_ids: Vec<String>,
    /// Refuse instead of answering unaided when nothing relevant is found.
    pub strict_grounding: bool,
    pub created_at: DateTime<Utc>,
}

/// A single passage of crawled text, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub namespace: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub chunk_index: usize,
    pub content_hash: String,
}

/// A chunk returned by a similarity search for the current turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
    /// Namespace the hit was retrieved from.
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_upper(&self) -> &'static str {
        match self {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Content of the most recent `user` message, if any.
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

/// An immutable record of one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub cited_urls: Vec<String>,
    pub grounded: bool,
    pub created_at: DateTime<Utc>,
}

/// Title and normalized text of a crawled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledPage {
    pub url: String,
    pub title: String,
    pub text: String,
}
