//! Service wiring.
//!
//! [`AppServices::from_config`] builds the production graph (SQLite
//! repositories, HTTP collaborators, Qdrant or in-memory vectors).
//! [`AppServices::assemble`] takes the collaborators explicitly, which is
//! how tests plug in fakes. Either way a single [`BreakerRegistry`] is
//! shared by every service, so a dependency that trips during ingestion is
//! also open for chat turns.

use std::sync::Arc;

use anyhow::{bail, Result};

use rag_chat_core::chunk::CharRatioTokenizer;
use rag_chat_core::embedding::Embedder;
use rag_chat_core::services::{Crawler, LanguageModel};
use rag_chat_core::store::memory::InMemoryVectorStore;
use rag_chat_core::store::{
    AgentRepository, ConversationRepository, KnowledgeSpaceRepository, VectorStore,
};

use crate::chat::{AgentService, ChatService};
use crate::config::Config;
use crate::crawler::HttpCrawler;
use crate::embedding::create_embedder;
use crate::ingest::{IngestionService, IngestionSettings};
use crate::llm::create_language_model;
use crate::logging::{tracing_logger, StructuredLogger};
use crate::qdrant::QdrantVectorStore;
use crate::recorder::ConversationRecorder;
use crate::resilience::{BreakerRegistry, Resilience};
use crate::retrieval::Retriever;
use crate::sqlite_store::SqliteRepository;
use crate::{db, migrate};

/// The external collaborators every service is built from.
pub struct Collaborators {
    pub crawler: Arc<dyn Crawler>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LanguageModel>,
    pub vectors: Arc<dyn VectorStore>,
    pub spaces: Arc<dyn KnowledgeSpaceRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub logger: Arc<dyn StructuredLogger>,
}

#[derive(Clone)]
pub struct AppServices {
    pub ingestion: Arc<IngestionService>,
    pub chat: Arc<ChatService>,
    pub agents: Arc<AgentService>,
    pub breakers: Arc<BreakerRegistry>,
    pub logger: Arc<dyn StructuredLogger>,
}

impl AppServices {
    /// Connect to the database (running migrations) and build the
    /// configured providers.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let repo = Arc::new(SqliteRepository::new(pool));

        let embedder = create_embedder(&config.embedding)?;
        let vectors: Arc<dyn VectorStore> = match config.vector_store.provider.as_str() {
            "memory" => Arc::new(InMemoryVectorStore::new()),
            "qdrant" => Arc::new(QdrantVectorStore::new(
                &config.vector_store,
                embedder.dims(),
            )?),
            other => bail!("Unknown vector_store provider: {}", other),
        };

        let collaborators = Collaborators {
            crawler: Arc::new(HttpCrawler::new(&config.crawler)?),
            embedder,
            llm: create_language_model(&config.llm)?,
            vectors,
            spaces: repo.clone(),
            agents: repo.clone(),
            conversations: repo,
            logger: tracing_logger(),
        };
        let resilience = Resilience::from_config(&config.resilience);
        Ok(Self::assemble(config, collaborators, resilience))
    }

    pub fn assemble(config: &Config, parts: Collaborators, resilience: Resilience) -> Self {
        let tokenizer = Arc::new(CharRatioTokenizer {
            chars_per_token: config.chunking.chars_per_token,
        });

        let ingestion = IngestionService::new(
            parts.crawler,
            parts.embedder.clone(),
            parts.vectors.clone(),
            parts.spaces.clone(),
            resilience.clone(),
        )
        .with_settings(IngestionSettings::from_config(config))
        .with_tokenizer(tokenizer)
        .with_logger(parts.logger.clone());

        let retriever = Retriever::new(
            parts.embedder,
            parts.vectors,
            parts.spaces.clone(),
            resilience.clone(),
        )
        .with_params(config.retrieval.params())
        .with_search_concurrency(config.retrieval.search_concurrency);

        let breakers = Arc::clone(resilience.breakers());
        let chat = ChatService::new(
            parts.agents.clone(),
            retriever,
            parts.llm,
            ConversationRecorder::new(parts.conversations),
            resilience,
        )
        .with_logger(parts.logger.clone());

        let agents = AgentService::new(parts.agents, parts.spaces).with_logger(parts.logger.clone());

        Self {
            ingestion: Arc::new(ingestion),
            chat: Arc::new(chat),
            agents: Arc::new(agents),
            breakers,
            logger: parts.logger,
        }
    }
}
