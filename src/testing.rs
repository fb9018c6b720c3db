//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use rag_chat_core::embedding::Embedder;
use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::models::{Agent, CrawledPage};
use rag_chat_core::services::{Crawler, LanguageModel};
use rag_chat_core::store::{StoredChunk, VectorHit, VectorRecord, VectorStore};

use crate::logging::{CrawlProgressEvent, CrawlStatus, RagSearchEvent, StructuredLogger};
use crate::resilience::{BreakerRegistry, Resilience, RetryPolicy};

/// Two attempts, no backoff.
pub fn fast_resilience() -> Resilience {
    Resilience::new(Arc::new(BreakerRegistry::default())).with_uniform_policy(RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
        jitter: false,
    })
}

pub fn agent(knowledge_space_ids: &[&str], strict_grounding: bool) -> Agent {
    Agent {
        tenant_id: "acme".into(),
        id: "agent_test".into(),
        name: "Test".into(),
        knowledge_space_ids: knowledge_space_ids.iter().map(|s| s.to_string()).collect(),
        strict_grounding,
        created_at: Utc::now(),
    }
}

enum FakePage {
    Ok(CrawledPage),
    /// Fails with a non-retryable 404 on the first fetch only.
    FailOnce { page: CrawledPage, failed: bool },
}

/// Serves canned pages; unknown URLs get a 404.
#[derive(Default)]
pub struct FakeCrawler {
    pages: Mutex<HashMap<String, FakePage>>,
}

impl FakeCrawler {
    fn crawled(url: &str, title: &str, text: &str) -> CrawledPage {
        CrawledPage {
            url: url.to_string(),
            title: title.to_string(),
            text: text.to_string(),
        }
    }

    pub fn page(self, url: &str, title: &str, text: &str) -> Self {
        self.insert(url, FakePage::Ok(Self::crawled(url, title, text)))
    }

    pub fn failing_once(self, url: &str, title: &str, text: &str) -> Self {
        self.insert(
            url,
            FakePage::FailOnce {
                page: Self::crawled(url, title, text),
                failed: false,
            },
        )
    }

    fn insert(self, url: &str, page: FakePage) -> Self {
        self.pages.lock().unwrap().insert(url.to_string(), page);
        self
    }
}

#[async_trait]
impl Crawler for FakeCrawler {
    async fn fetch(&self, url: &str) -> Result<CrawledPage> {
        crate::crawler::validate_url(url)?;
        let not_found = || RagError::external(Dependency::Crawler, Some(404), "not found");
        let mut pages = self.pages.lock().unwrap();
        match pages.get_mut(url) {
            Some(FakePage::Ok(page)) => Ok(page.clone()),
            Some(FakePage::FailOnce { page, failed }) => {
                if *failed {
                    Ok(page.clone())
                } else {
                    *failed = true;
                    Err(not_found())
                }
            }
            None => Err(not_found()),
        }
    }
}

const VOCABULARY: &[&str] = &[
    "pricing", "plan", "refund", "support", "install", "weather", "dollars", "week",
];

/// Bag-of-keywords embedder: one dimension per vocabulary word plus a
/// constant bias dimension so no vector is all zeros.
#[derive(Default)]
pub struct KeywordEmbedder;

impl KeywordEmbedder {
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = VOCABULARY
            .iter()
            .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
            .collect();
        vector.push(0.1);
        vector
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }
    fn dims(&self) -> usize {
        VOCABULARY.len() + 1
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

pub struct FailingVectorStore;

#[async_trait]
impl VectorStore for FailingVectorStore {
    async fn upsert(&self, _namespace: &str, _records: &[VectorRecord]) -> Result<()> {
        Err(RagError::external(Dependency::VectorStore, Some(503), "unavailable"))
    }
    async fn search(&self, _namespace: &str, _vector: &[f32], _top_k: usize) -> Result<Vec<VectorHit>> {
        Err(RagError::external(Dependency::VectorStore, Some(503), "unavailable"))
    }
    async fn list(&self, _namespace: &str) -> Result<Vec<StoredChunk>> {
        Err(RagError::external(Dependency::VectorStore, Some(503), "unavailable"))
    }
}

/// Returns a fixed answer and counts calls.
pub struct CountingLanguageModel {
    answer: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl CountingLanguageModel {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for CountingLanguageModel {
    fn model_name(&self) -> &str {
        "counting"
    }
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

/// Answers only after `delay`. Counts calls that started and calls that
/// ran to completion.
pub struct SlowLanguageModel {
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowLanguageModel {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for SlowLanguageModel {
    fn model_name(&self) -> &str {
        "slow"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok("too late".to_string())
    }
}

#[derive(Default)]
pub struct RecordingLogger {
    crawl: Mutex<Vec<CrawlStatus>>,
    searches: Mutex<Vec<usize>>,
}

impl RecordingLogger {
    pub fn crawl_count(&self, status: CrawlStatus) -> usize {
        self.crawl.lock().unwrap().iter().filter(|s| **s == status).count()
    }

    pub fn search_hit_counts(&self) -> Vec<usize> {
        self.searches.lock().unwrap().clone()
    }
}

impl StructuredLogger for RecordingLogger {
    fn crawl_progress(&self, event: &CrawlProgressEvent<'_>) {
        self.crawl.lock().unwrap().push(event.status);
    }
    fn rag_search(&self, event: &RagSearchEvent<'_>) {
        self.searches.lock().unwrap().push(event.hit_count);
    }
}
