//! Language model clients: single-turn completion, no streaming.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::services::LanguageModel;

use crate::config::LlmConfig;
use crate::http::{api_key_from_env, build_client, check_status, transport_error};

pub struct DisabledLanguageModel;

#[async_trait]
impl LanguageModel for DisabledLanguageModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(RagError::Validation(
            "language model is disabled; set [llm] provider in config".to_string(),
        ))
    }
}

/// OpenAI-compatible `/chat/completions` client. The whole prompt is sent
/// as one user message.
pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        Ok(Self {
            client: build_client(config.timeout_secs, None)?,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key_from_env(&config.api_key_env)?,
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(Dependency::LanguageModel, e))?;
        let response = check_status(Dependency::LanguageModel, response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(Dependency::LanguageModel, e))?;
        first_choice(parsed)
    }
}

fn first_choice(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| {
            RagError::external(
                Dependency::LanguageModel,
                None,
                "completion response had no message content",
            )
        })
}

pub fn create_language_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLanguageModel)),
        "openai" => Ok(Arc::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
