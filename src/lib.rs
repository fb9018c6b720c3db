//! # rag-chat
//!
//! Retrieval-augmented chat over crawled knowledge spaces.
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌──────────────┐
//! │ Crawler  │──▶│ Chunk + Embed     │──▶│ Vector store │
//! │ (HTTP)   │   │ (ingest)          │   │ per-space ns │
//! └──────────┘   └───────────────────┘   └──────┬───────┘
//!                                               │ search
//!                ┌───────────────────┐   ┌──────▼───────┐
//!   user ───────▶│ Chat turn         │◀──│ Retrieval    │
//!                │ ground → prompt → │   │ rank + cap   │
//!                │ LLM → record      │   └──────────────┘
//!                └───────────────────┘
//! ```
//!
//! Every call to the crawler, embedder, vector store and language model
//! runs through [`resilience::Resilience`]: bounded retries with backoff
//! plus one circuit breaker per dependency type.
//!
//! Pure pieces (chunking, ranking, grounding, prompt assembly, data model)
//! live in the runtime-free `rag-chat-core` crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`logging`] | tracing setup and structured domain events |
//! | [`resilience`] | Retry policy and circuit breakers |
//! | [`ingest`] | Knowledge-space ingestion |
//! | [`retrieval`] | Embedding search across linked spaces |
//! | [`chat`] | Chat turns and agent creation |
//! | [`recorder`] | Conversation persistence |
//! | [`crawler`], [`embedding`], [`llm`], [`qdrant`] | HTTP collaborators |
//! | [`sqlite_store`], [`db`], [`migrate`] | SQLite repositories |
//! | [`services`] | Wiring |
//! | [`server`] | axum HTTP adapter |

pub mod chat;
pub mod config;
pub mod crawler;
pub mod db;
pub mod embedding;
mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod qdrant;
pub mod recorder;
pub mod resilience;
pub mod retrieval;
pub mod server;
pub mod services;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod testing;
