//! Retrieval step of a chat turn: embed the question, search every linked
//! knowledge space, rank and cap the merged hits.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use rag_chat_core::embedding::Embedder;
use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::models::{last_user_message, Agent, ChatMessage, ScoredChunk};
use rag_chat_core::ranking::{cited_urls, select_context, RetrievalParams};
use rag_chat_core::store::{KnowledgeSpaceRepository, VectorStore};

use crate::resilience::Resilience;

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// The latest user message the search was run for.
    pub query: String,
    /// At most `max_context_chunks` hits, best first, all at or above the
    /// similarity threshold.
    pub context: Vec<ScoredChunk>,
    pub cited_urls: Vec<String>,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    spaces: Arc<dyn KnowledgeSpaceRepository>,
    resilience: Resilience,
    params: RetrievalParams,
    search_concurrency: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        spaces: Arc<dyn KnowledgeSpaceRepository>,
        resilience: Resilience,
    ) -> Self {
        Self {
            embedder,
            vectors,
            spaces,
            resilience,
            params: RetrievalParams::default(),
            search_concurrency: 4,
        }
    }

    pub fn with_params(mut self, params: RetrievalParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_search_concurrency(mut self, concurrency: usize) -> Self {
        self.search_concurrency = concurrency.max(1);
        self
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Find context for the latest user message in `messages`.
    ///
    /// Missing knowledge spaces and failed searches are logged and
    /// contribute no hits. Only a missing user message or a failed query
    /// embedding fail the call.
    pub async fn retrieve(
        &self,
        tenant_id: &str,
        agent: &Agent,
        messages: &[ChatMessage],
    ) -> Result<RetrievalOutcome> {
        let query = last_user_message(messages).ok_or(RagError::NoUserMessage)?;

        let vector = self
            .resilience
            .call(Dependency::Embedder, || self.embedder.embed(query))
            .await
            .map_err(|e| RagError::EmbeddingFailed(Box::new(e)))?;
        let vector = vector.as_slice();

        // `buffered` yields in input order, so the merge below sees hits in
        // agent link order regardless of which search finishes first.
        let searches: Vec<_> = agent
            .knowledge_space_ids
            .iter()
            .map(|ks_id| self.search_space(tenant_id, ks_id, vector))
            .collect();
        let per_space: Vec<Vec<ScoredChunk>> = stream::iter(searches)
            .buffered(self.search_concurrency)
            .collect()
            .await;

        let candidates: Vec<ScoredChunk> = per_space.into_iter().flatten().collect();
        let candidate_count = candidates.len();
        let context = select_context(candidates, &self.params);
        let cited_urls = cited_urls(&context, self.params.max_cited_urls);
        debug!(
            agent_id = %agent.id,
            candidates = candidate_count,
            selected = context.len(),
            "retrieval complete"
        );

        Ok(RetrievalOutcome {
            query: query.to_string(),
            context,
            cited_urls,
        })
    }

    async fn search_space(&self, tenant_id: &str, ks_id: &str, vector: &[f32]) -> Vec<ScoredChunk> {
        let space = match self.spaces.get(tenant_id, ks_id).await {
            Ok(Some(space)) => space,
            Ok(None) => {
                warn!(tenant_id, knowledge_space_id = ks_id, "linked knowledge space not found");
                return Vec::new();
            }
            Err(e) => {
                warn!(tenant_id, knowledge_space_id = ks_id, error = %e, "knowledge space lookup failed");
                return Vec::new();
            }
        };

        let namespace = space.namespace();
        let top_k = self.params.top_k;
        match self
            .resilience
            .call(Dependency::VectorStore, || {
                self.vectors.search(&namespace, vector, top_k)
            })
            .await
        {
            Ok(hits) => hits.into_iter().map(|h| h.into_scored(&namespace)).collect(),
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "vector search failed");
                Vec::new()
            }
        }
    }
}
