//! Qdrant REST vector store.
//!
//! Each namespace maps to one collection (cosine distance, configured
//! dimensionality). Collections are created on first upsert. Searching or
//! listing a collection that does not exist yet returns nothing. Namespaces
//! are checked with [`validate_segment`] before they go into a URL path.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::ids::validate_segment;
use rag_chat_core::store::{ChunkPayload, StoredChunk, VectorHit, VectorRecord, VectorStore};

use crate::config::VectorStoreConfig;
use crate::http::{api_key_from_env, build_client, check_status, transport_error};

const DEP: Dependency = Dependency::VectorStore;
const SCROLL_PAGE: usize = 100;

pub struct QdrantVectorStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    dims: usize,
    known_collections: Mutex<HashSet<String>>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: &'a ChunkPayload,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    payload: Option<ChunkPayload>,
}

#[derive(Serialize)]
struct ScrollRequest<'a> {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<&'a Value>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollPage,
}

#[derive(Deserialize)]
struct ScrollPage {
    #[serde(default)]
    points: Vec<Record>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct Record {
    id: Value,
    payload: Option<ChunkPayload>,
}

impl QdrantVectorStore {
    pub fn new(config: &VectorStoreConfig, dims: usize) -> anyhow::Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(api_key_from_env(var)?),
            None => None,
        };
        Ok(Self {
            client: build_client(config.timeout_secs, None)?,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            dims,
            known_collections: Mutex::new(HashSet::new()),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    fn collection_url(&self, namespace: &str) -> Result<String> {
        validate_segment("namespace", namespace)?;
        Ok(format!("{}/collections/{}", self.base_url, namespace))
    }

    fn is_known(&self, namespace: &str) -> bool {
        self.known_collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(namespace)
    }

    async fn ensure_collection(&self, namespace: &str) -> Result<()> {
        if self.is_known(namespace) {
            return Ok(());
        }

        let url = self.collection_url(namespace)?;
        let existing = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| transport_error(DEP, e))?;

        if existing.status() == StatusCode::NOT_FOUND {
            debug!(collection = namespace, dims = self.dims, "creating Qdrant collection");
            let body = serde_json::json!({
                "vectors": { "size": self.dims, "distance": "Cosine" }
            });
            let created = self
                .request(self.client.put(&url))
                .json(&body)
                .send()
                .await
                .map_err(|e| transport_error(DEP, e))?;
            // 409: created concurrently by another job.
            if created.status() != StatusCode::CONFLICT {
                check_status(DEP, created).await?;
            }
        } else {
            check_status(DEP, existing).await?;
        }

        self.known_collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string());
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, namespace: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.ensure_collection(namespace).await?;

        let body = UpsertRequest {
            points: records
                .iter()
                .map(|r| Point {
                    id: &r.id,
                    vector: &r.vector,
                    payload: &r.payload,
                })
                .collect(),
        };
        let response = self
            .request(
                self.client
                    .put(format!("{}/points?wait=true", self.collection_url(namespace)?)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(DEP, e))?;
        check_status(DEP, response).await?;
        Ok(())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>> {
        let response = self
            .request(
                self.client
                    .post(format!("{}/points/search", self.collection_url(namespace)?)),
            )
            .json(&SearchRequest {
                vector,
                limit: top_k,
                with_payload: true,
            })
            .send()
            .await
            .map_err(|e| transport_error(DEP, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(DEP, response).await?;
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| transport_error(DEP, e))?;
        parsed.result.into_iter().map(into_hit).collect()
    }

    async fn list(&self, namespace: &str) -> Result<Vec<StoredChunk>> {
        let url = format!("{}/points/scroll", self.collection_url(namespace)?);
        let mut chunks = Vec::new();
        let mut offset: Option<Value> = None;

        loop {
            let response = self
                .request(self.client.post(&url))
                .json(&ScrollRequest {
                    limit: SCROLL_PAGE,
                    offset: offset.as_ref(),
                    with_payload: true,
                    with_vector: false,
                })
                .send()
                .await
                .map_err(|e| transport_error(DEP, e))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let response = check_status(DEP, response).await?;
            let page: ScrollResponse = response
                .json()
                .await
                .map_err(|e| transport_error(DEP, e))?;

            for record in page.result.points {
                chunks.push(into_stored(record)?);
            }
            match page.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(chunks)
    }
}

fn point_id(id: Value) -> String {
    match id {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn missing_payload(id: &str) -> RagError {
    RagError::external(DEP, None, format!("point {} returned without payload", id))
}

fn into_hit(point: ScoredPoint) -> Result<VectorHit> {
    let id = point_id(point.id);
    let payload = point.payload.ok_or_else(|| missing_payload(&id))?;
    Ok(VectorHit {
        id,
        score: point.score,
        payload,
    })
}

fn into_stored(record: Record) -> Result<StoredChunk> {
    let id = point_id(record.id);
    let payload = record.payload.ok_or_else(|| missing_payload(&id))?;
    Ok(StoredChunk { id, payload })
}
