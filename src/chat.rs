//! Chat turn orchestration and agent management.
//!
//! A turn runs: load agent → retrieve → log the search → grounding
//! decision → (answer) prompt + language model → record → respond. A
//! strict agent with no relevant context gets the fixed refusal and the
//! language model is never called. Turns aborted before completion record
//! nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::grounding::{decide, GroundingDecision, REFUSAL_MESSAGE};
use rag_chat_core::ids::{generate_id, validate_segment};
use rag_chat_core::models::{Agent, ChatMessage, Role};
use rag_chat_core::prompt::assemble_prompt;
use rag_chat_core::services::LanguageModel;
use rag_chat_core::store::{AgentRepository, KnowledgeSpaceRepository};

use crate::logging::{AgentCreatedEvent, NoopLogger, RagSearchEvent, StructuredLogger};
use crate::recorder::{ConversationRecorder, NewTurn};
use crate::resilience::Resilience;
use crate::retrieval::Retriever;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub messages: Vec<ChatMessage>,
    pub request_id: String,
}

/// OpenAI-style completion body, extended with citations and a grounding
/// flag on the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Conversation id of the recorded turn.
    pub id: String,
    pub object: String,
    /// The agent id.
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Role,
    pub content: String,
    pub cited_urls: Vec<String>,
    #[serde(rename = "isRag")]
    pub is_rag: bool,
}

impl ChatCompletion {
    fn new(id: String, agent_id: &str, content: String, cited_urls: Vec<String>, is_rag: bool) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            model: agent_id.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: Role::Assistant,
                    content,
                    cited_urls,
                    is_rag,
                },
            }],
        }
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

pub struct ChatService {
    agents: Arc<dyn AgentRepository>,
    retriever: Retriever,
    llm: Arc<dyn LanguageModel>,
    recorder: ConversationRecorder,
    resilience: Resilience,
    logger: Arc<dyn StructuredLogger>,
}

impl ChatService {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        retriever: Retriever,
        llm: Arc<dyn LanguageModel>,
        recorder: ConversationRecorder,
        resilience: Resilience,
    ) -> Self {
        Self {
            agents,
            retriever,
            llm,
            recorder,
            resilience,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatCompletion> {
        validate_segment("tenant id", &request.tenant_id)?;
        validate_segment("agent id", &request.agent_id)?;
        let agent = self
            .agents
            .get(&request.tenant_id, &request.agent_id)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("agent {}", request.agent_id)))?;

        let retrieval = self
            .retriever
            .retrieve(&request.tenant_id, &agent, &request.messages)
            .await?;

        let top_urls: Vec<String> = retrieval
            .context
            .iter()
            .map(|c| c.chunk.url.clone())
            .collect();
        self.logger.rag_search(&RagSearchEvent {
            request_id: &request.request_id,
            tenant_id: &request.tenant_id,
            agent_id: &agent.id,
            query: &retrieval.query,
            hit_count: retrieval.context.len(),
            top_urls: &top_urls,
            top_scores: retrieval.context.iter().map(|c| c.score).collect(),
            threshold: self.retriever.params().similarity_threshold,
        });

        let decision = decide(agent.strict_grounding, &retrieval.context);
        let (content, cited_urls) = match decision {
            GroundingDecision::Refuse => {
                info!(
                    request_id = %request.request_id,
                    agent_id = %agent.id,
                    "no relevant context; refusing"
                );
                (REFUSAL_MESSAGE.to_string(), Vec::new())
            }
            GroundingDecision::Answer => {
                let prompt =
                    assemble_prompt(&retrieval.context, &request.messages, &retrieval.query);
                let answer = self
                    .resilience
                    .call(Dependency::LanguageModel, || self.llm.complete(&prompt))
                    .await?;
                (answer, retrieval.cited_urls)
            }
        };

        let is_rag = decision.is_grounded();
        let conversation_id = self
            .recorder
            .record(NewTurn {
                tenant_id: request.tenant_id,
                agent_id: agent.id.clone(),
                user_id: request.user_id,
                user_message: retrieval.query,
                assistant_message: content.clone(),
                cited_urls: cited_urls.clone(),
                grounded: is_rag,
            })
            .await?;

        Ok(ChatCompletion::new(
            conversation_id,
            &agent.id,
            content,
            cited_urls,
            is_rag,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    pub tenant_id: String,
    pub name: String,
    pub knowledge_space_ids: Vec<String>,
    pub strict_grounding: bool,
    pub request_id: String,
}

pub struct AgentService {
    agents: Arc<dyn AgentRepository>,
    spaces: Arc<dyn KnowledgeSpaceRepository>,
    logger: Arc<dyn StructuredLogger>,
}

impl AgentService {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        spaces: Arc<dyn KnowledgeSpaceRepository>,
    ) -> Self {
        Self {
            agents,
            spaces,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Create an agent linked to existing knowledge spaces of the tenant.
    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<Agent> {
        let name = request.name.trim();
        validate_segment("tenant id", &request.tenant_id)?;
        if name.is_empty() {
            return Err(RagError::Validation("agent name is required".to_string()));
        }
        if request.knowledge_space_ids.is_empty() {
            return Err(RagError::Validation(
                "at least one knowledge space id is required".to_string(),
            ));
        }
        for ks_id in &request.knowledge_space_ids {
            validate_segment("knowledge space id", ks_id)?;
            if self.spaces.get(&request.tenant_id, ks_id).await?.is_none() {
                return Err(RagError::NotFound(format!("knowledge space {}", ks_id)));
            }
        }

        let agent = Agent {
            tenant_id: request.tenant_id.clone(),
            id: generate_id("agent"),
            name: name.to_string(),
            knowledge_space_ids: request.knowledge_space_ids.clone(),
            strict_grounding: request.strict_grounding,
            created_at: Utc::now(),
        };
        self.agents.save(&agent).await?;

        self.logger.agent_created(&AgentCreatedEvent {
            request_id: &request.request_id,
            tenant_id: &agent.tenant_id,
            agent_id: &agent.id,
            agent_name: &agent.name,
            knowledge_space_ids: &agent.knowledge_space_ids,
            strict_grounding: agent.strict_grounding,
        });
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, CountingLanguageModel, KeywordEmbedder, RecordingLogger};
    use rag_chat_core::models::KnowledgeSpace;
    use rag_chat_core::store::memory::{InMemoryRepository, InMemoryVectorStore};
    use rag_chat_core::store::{ChunkPayload, VectorRecord, VectorStore};

    struct Harness {
        service: ChatService,
        repo: Arc<InMemoryRepository>,
        llm: Arc<CountingLanguageModel>,
        logger: Arc<RecordingLogger>,
    }

    /// One knowledge space holding a pricing page, and two agents linked to
    /// it: `agent_strict` and `agent_loose`.
    async fn harness() -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let space = KnowledgeSpace::new(
            "acme",
            "ks_docs",
            "Docs",
            &["https://acme.example/pricing".to_string()],
            Utc::now(),
        );
        KnowledgeSpaceRepository::save(repo.as_ref(), &space).await.unwrap();
        let text = "The pricing plan costs ten dollars per month.";
        vectors
            .upsert(
                &space.namespace(),
                &[VectorRecord {
                    id: "c0".into(),
                    vector: KeywordEmbedder.vector_for(text),
                    payload: ChunkPayload {
                        url: "https://acme.example/pricing".into(),
                        title: "Pricing".into(),
                        content: text.into(),
                        chunk_index: 0,
                        content_hash: String::new(),
                    },
                }],
            )
            .await
            .unwrap();

        for (id, strict) in [("agent_strict", true), ("agent_loose", false)] {
            let mut agent = testing::agent(&["ks_docs"], strict);
            agent.id = id.into();
            AgentRepository::save(repo.as_ref(), &agent).await.unwrap();
        }

        let resilience = testing::fast_resilience();
        let retriever = Retriever::new(
            Arc::new(KeywordEmbedder),
            vectors,
            repo.clone(),
            resilience.clone(),
        );
        let llm = Arc::new(CountingLanguageModel::new("It costs ten dollars."));
        let logger = Arc::new(RecordingLogger::default());
        let service = ChatService::new(
            repo.clone(),
            retriever,
            llm.clone(),
            ConversationRecorder::new(repo.clone()),
            resilience,
        )
        .with_logger(logger.clone());
        Harness {
            service,
            repo,
            llm,
            logger,
        }
    }

    fn request(agent_id: &str, question: &str) -> ChatRequest {
        ChatRequest {
            tenant_id: "acme".into(),
            user_id: "u1".into(),
            agent_id: agent_id.into(),
            messages: vec![ChatMessage::user(question)],
            request_id: "req-1".into(),
        }
    }

    #[tokio::test]
    async fn test_grounded_answer_cites_sources() {
        let h = harness().await;
        let completion = h
            .service
            .chat(request("agent_strict", "What is the pricing plan?"))
            .await
            .unwrap();

        let message = &completion.choices[0].message;
        assert_eq!(message.content, "It costs ten dollars.");
        assert!(message.is_rag);
        assert_eq!(message.cited_urls, vec!["https://acme.example/pricing"]);
        assert_eq!(h.llm.calls(), 1);
        let prompt = h.llm.last_prompt().unwrap();
        assert!(prompt.contains("[Pricing](https://acme.example/pricing)"));

        let turns = h.repo.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].id, completion.id);
        assert!(turns[0].grounded);
        assert_eq!(h.logger.search_hit_counts(), vec![1]);
    }

    #[tokio::test]
    async fn test_strict_agent_refuses_without_calling_llm() {
        let h = harness().await;
        let completion = h
            .service
            .chat(request("agent_strict", "What's the weather?"))
            .await
            .unwrap();

        let message = &completion.choices[0].message;
        assert_eq!(message.content, REFUSAL_MESSAGE);
        assert!(!message.is_rag);
        assert!(message.cited_urls.is_empty());
        assert_eq!(h.llm.calls(), 0);

        let turns = h.repo.turns();
        assert_eq!(turns.len(), 1);
        assert!(!turns[0].grounded);
    }

    #[tokio::test]
    async fn test_non_strict_agent_answers_without_context() {
        let h = harness().await;
        let completion = h
            .service
            .chat(request("agent_loose", "What's the weather?"))
            .await
            .unwrap();

        assert_eq!(h.llm.calls(), 1);
        assert!(completion.choices[0].message.is_rag);
        assert!(completion.choices[0].message.cited_urls.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let h = harness().await;
        let err = h.service.chat(request("agent_nope", "hi")).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
        assert!(h.repo.turns().is_empty());
    }

    #[tokio::test]
    async fn test_create_agent_validates_links() {
        let repo = Arc::new(InMemoryRepository::new());
        let space = KnowledgeSpace::new("acme", "ks_1", "Docs", &[], Utc::now());
        KnowledgeSpaceRepository::save(repo.as_ref(), &space).await.unwrap();
        let service = AgentService::new(repo.clone(), repo.clone());

        let mut req = CreateAgentRequest {
            tenant_id: "acme".into(),
            name: "Support".into(),
            knowledge_space_ids: vec!["ks_1".into()],
            strict_grounding: true,
            request_id: "req".into(),
        };
        let agent = service.create_agent(req.clone()).await.unwrap();
        assert!(agent.id.starts_with("agent_"));
        assert!(AgentRepository::get(repo.as_ref(), "acme", &agent.id)
            .await
            .unwrap()
            .is_some());

        req.knowledge_space_ids = vec!["ks_1".into(), "ks_other".into()];
        assert!(matches!(
            service.create_agent(req.clone()).await,
            Err(RagError::NotFound(_))
        ));

        req.knowledge_space_ids.clear();
        assert!(matches!(
            service.create_agent(req).await,
            Err(RagError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_keeps_full_history() {
        let h = harness().await;
        let mut req = request("agent_strict", "What is the pricing plan?");
        req.messages.push(ChatMessage::new(Role::System, "Reply in French."));
        h.service.chat(req).await.unwrap();

        let prompt = h.llm.last_prompt().unwrap();
        let history = prompt
            .split("CONVERSATION HISTORY:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\n").next())
            .unwrap();
        assert_eq!(history, "USER: What is the pricing plan?\nSYSTEM: Reply in French.");
        assert!(prompt.contains("\n\nUSER: What is the pricing plan?\n\nTASK:"));
    }

    #[test]
    fn test_completion_shape() {
        let completion = ChatCompletion::new(
            "conv_1".into(),
            "agent_1",
            "hello".into(),
            vec!["https://a.example".into()],
            true,
        );
        let value = serde_json::to_value(&completion).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["model"], "agent_1");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["isRag"], true);
        assert_eq!(value["choices"][0]["message"]["cited_urls"][0], "https://a.example");
        assert_eq!(completion.content(), "hello");
    }
}
