//! Storage abstractions for rag-chat.
//!
//! Two kinds of storage sit behind these traits:
//!
//! - the **vector store**, holding chunk embeddings partitioned by
//!   namespace (one namespace per knowledge space), and
//! - the **repositories** for knowledge spaces, agents and conversation
//!   turns.
//!
//! Implementations must be `Send + Sync` to work with async runtimes. The
//! in-memory backends in [`memory`] serve tests and local runs; the app
//! crate provides Qdrant and SQLite backends.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Agent, ConversationTurn, DocumentChunk, KnowledgeSpace, ScoredChunk};

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub url: String,
    pub title: String,
    pub content: String,
    pub chunk_index: usize,
    pub content_hash: String,
}

/// A chunk embedding ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &DocumentChunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            vector,
            payload: ChunkPayload {
                url: chunk.url.clone(),
                title: chunk.title.clone(),
                content: chunk.content.clone(),
                chunk_index: chunk.chunk_index,
                content_hash: chunk.content_hash.clone(),
            },
        }
    }
}

/// A single nearest-neighbour result from [`VectorStore::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

impl VectorHit {
    /// Attach the namespace the hit came from.
    pub fn into_scored(self, namespace: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                id: self.id,
                namespace: namespace.to_string(),
                url: self.payload.url,
                title: self.payload.title,
                content: self.payload.content,
                chunk_index: self.payload.chunk_index,
                content_hash: self.payload.content_hash,
            },
            score: self.score,
            namespace: namespace.to_string(),
        }
    }
}

/// A stored chunk as returned by [`VectorStore::list`], vector omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    #[serde(flatten)]
    pub payload: ChunkPayload,
}

/// Namespace-partitioned similarity index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace records by id |
/// | [`search`](VectorStore::search) | Top-K nearest neighbours, best first |
/// | [`list`](VectorStore::list) | Every record of a namespace, without vectors |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records within `namespace`. Records with an
    /// existing id overwrite the previous record.
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<()>;

    /// Return at most `top_k` hits ordered by descending score. A namespace
    /// that does not exist (or holds nothing) yields an empty list.
    async fn search(&self, namespace: &str, vector: &[f32], top_k: usize)
        -> Result<Vec<VectorHit>>;

    /// All records in `namespace`, in no particular order. A namespace that
    /// does not exist yields an empty list.
    async fn list(&self, namespace: &str) -> Result<Vec<StoredChunk>>;
}

#[async_trait]
pub trait KnowledgeSpaceRepository: Send + Sync {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<KnowledgeSpace>>;
    /// Insert or replace the whole space, sources included.
    async fn save(&self, space: &KnowledgeSpace) -> Result<()>;
    /// Spaces for a tenant, oldest first.
    async fn list(&self, tenant_id: &str) -> Result<Vec<KnowledgeSpace>>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Agent>>;
    async fn save(&self, agent: &Agent) -> Result<()>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn save(&self, turn: &ConversationTurn) -> Result<()>;
}
