//! Logging setup and structured domain events.
//!
//! Plain diagnostics use `tracing` macros directly. Domain events that
//! operators query for (retrieval outcomes, crawl progress, agent creation,
//! request completion) go through the [`StructuredLogger`] capability. It is
//! passed explicitly to the services that emit them, and every method has a
//! no-op default, so an implementation only overrides what it cares about.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Outcome of the retrieval step of one chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct RagSearchEvent<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub agent_id: &'a str,
    pub query: &'a str,
    /// Hits that survived thresholding and capping.
    pub hit_count: usize,
    pub top_urls: &'a [String],
    pub top_scores: Vec<f32>,
    pub threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Started,
    Completed,
    Failed,
}

/// Progress of one source URL during ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlProgressEvent<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub knowledge_space_id: &'a str,
    pub url: &'a str,
    /// 1-based position of `url` in the source list.
    pub url_index: usize,
    pub total_urls: usize,
    pub status: CrawlStatus,
    pub chunk_count: Option<usize>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCreatedEvent<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub knowledge_space_ids: &'a [String],
    pub strict_grounding: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status_code: u16,
    pub duration_ms: u64,
}

/// Sink for structured domain events.
pub trait StructuredLogger: Send + Sync {
    fn rag_search(&self, _event: &RagSearchEvent<'_>) {}
    fn crawl_progress(&self, _event: &CrawlProgressEvent<'_>) {}
    fn agent_created(&self, _event: &AgentCreatedEvent<'_>) {}
    fn request_completed(&self, _event: &RequestEvent<'_>) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl StructuredLogger for NoopLogger {}

/// Emits each event as one `tracing` record with the event's fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl StructuredLogger for TracingLogger {
    fn rag_search(&self, e: &RagSearchEvent<'_>) {
        info!(
            event = "rag_search",
            request_id = e.request_id,
            tenant_id = e.tenant_id,
            agent_id = e.agent_id,
            query = e.query,
            hit_count = e.hit_count,
            top_urls = ?e.top_urls,
            top_scores = ?e.top_scores,
            threshold = e.threshold,
            "RAG search completed"
        );
    }

    fn crawl_progress(&self, e: &CrawlProgressEvent<'_>) {
        match e.status {
            CrawlStatus::Failed => warn!(
                event = "crawl_progress",
                request_id = e.request_id,
                tenant_id = e.tenant_id,
                knowledge_space_id = e.knowledge_space_id,
                url = e.url,
                url_index = e.url_index,
                total_urls = e.total_urls,
                error = e.error_message.as_deref().unwrap_or(""),
                "crawl failed"
            ),
            status => info!(
                event = "crawl_progress",
                request_id = e.request_id,
                tenant_id = e.tenant_id,
                knowledge_space_id = e.knowledge_space_id,
                url = e.url,
                url_index = e.url_index,
                total_urls = e.total_urls,
                chunk_count = e.chunk_count,
                status = ?status,
                "crawl progress"
            ),
        }
    }

    fn agent_created(&self, e: &AgentCreatedEvent<'_>) {
        info!(
            event = "agent_created",
            request_id = e.request_id,
            tenant_id = e.tenant_id,
            agent_id = e.agent_id,
            agent_name = e.agent_name,
            knowledge_space_ids = ?e.knowledge_space_ids,
            strict_grounding = e.strict_grounding,
            "agent created"
        );
    }

    fn request_completed(&self, e: &RequestEvent<'_>) {
        info!(
            event = "request",
            request_id = e.request_id,
            tenant_id = e.tenant_id,
            method = e.method,
            path = e.path,
            status_code = e.status_code,
            duration_ms = e.duration_ms,
            "request completed"
        );
    }
}

pub fn tracing_logger() -> Arc<dyn StructuredLogger> {
    Arc::new(TracingLogger)
}

/// Install the global subscriber. `RUST_LOG` overrides `logging.level`.
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber may already be installed (tests, embedding binaries).
    if let Err(err) = installed {
        tracing::debug!("tracing subscriber already set: {err}");
    }
    Ok(())
}
