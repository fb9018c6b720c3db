//! Embedding provider implementations.
//!
//! - **[`DisabledEmbedder`]**: fails every call; used when `[embedding]`
//!   is not configured. Ingestion and chat then fail with a validation
//!   error instead of silently producing empty vectors.
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/embeddings`
//!   endpoint, one request per batch.
//!
//! Retry and backoff are not handled here. Callers wrap every call in
//! [`Resilience::call`](crate::resilience::Resilience::call), which retries
//! on transport errors, 429 and 5xx and gives up immediately on other 4xx.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use rag_chat_core::embedding::Embedder;
use rag_chat_core::error::{Dependency, RagError, Result};

use crate::config::EmbeddingConfig;
use crate::http::{api_key_from_env, build_client, check_status, transport_error};

// ============ Disabled Provider ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::Validation(
            "embedding provider is disabled; set [embedding] provider in config".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = api_key_from_env(&config.api_key_env)?;

        Ok(Self {
            client: build_client(config.timeout_secs, None)?,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| transport_error(Dependency::Embedder, e))?;
        let response = check_status(Dependency::Embedder, response).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Dependency::Embedder, e))?;

        into_vectors(parsed, texts.len(), self.dims)
    }
}

/// Order vectors by `index` and check count and dimensionality.
fn into_vectors(
    response: EmbeddingResponse,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(RagError::external(
            Dependency::Embedder,
            None,
            format!("expected {} embeddings, got {}", expected, data.len()),
        ));
    }
    data.sort_by_key(|d| d.index);
    if let Some(bad) = data.iter().find(|d| d.embedding.len() != dims) {
        return Err(RagError::external(
            Dependency::Embedder,
            None,
            format!(
                "embedding has {} dimensions, configured {}",
                bad.embedding.len(),
                dims
            ),
        ));
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
