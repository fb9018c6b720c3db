//! In-memory storage backends for tests and local runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Vector search is brute-force cosine similarity over one namespace.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::models::{Agent, ConversationTurn, KnowledgeSpace};

use super::{
    AgentRepository, ConversationRepository, KnowledgeSpaceRepository, StoredChunk, VectorHit,
    VectorRecord, VectorStore,
};

/// In-memory vector store keyed by namespace.
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<HashMap<String, Vec<VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records held in `namespace`, in insertion order.
    pub fn records(&self, namespace: &str) -> Vec<VectorRecord> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces.get(namespace).cloned().unwrap_or_default()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = namespaces.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let stored = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            match stored.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => stored.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let Some(stored) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = stored
            .iter()
            .map(|r| VectorHit {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<StoredChunk>> {
        Ok(self
            .records(namespace)
            .into_iter()
            .map(|r| StoredChunk {
                id: r.id,
                payload: r.payload,
            })
            .collect())
    }
}

/// In-memory knowledge-space, agent and conversation repositories.
#[derive(Default)]
pub struct InMemoryRepository {
    spaces: RwLock<HashMap<(String, String), KnowledgeSpace>>,
    agents: RwLock<HashMap<(String, String), Agent>>,
    turns: RwLock<Vec<ConversationTurn>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded turn, in save order.
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn key(tenant_id: &str, id: &str) -> (String, String) {
    (tenant_id.to_string(), id.to_string())
}

#[async_trait]
impl KnowledgeSpaceRepository for InMemoryRepository {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<KnowledgeSpace>> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(spaces.get(&key(tenant_id, id)).cloned())
    }

    async fn save(&self, space: &KnowledgeSpace) -> Result<()> {
        let mut spaces = self.spaces.write().unwrap_or_else(PoisonError::into_inner);
        spaces.insert(key(&space.tenant_id, &space.id), space.clone());
        Ok(())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<KnowledgeSpace>> {
        let spaces = self.spaces.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<KnowledgeSpace> = spaces
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }
}

#[async_trait]
impl AgentRepository for InMemoryRepository {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Agent>> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(agents.get(&key(tenant_id, id)).cloned())
    }

    async fn save(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        agents.insert(key(&agent.tenant_id, &agent.id), agent.clone());
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for InMemoryRepository {
    async fn save(&self, turn: &ConversationTurn) -> Result<()> {
        self.turns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn.clone());
        Ok(())
    }
}
