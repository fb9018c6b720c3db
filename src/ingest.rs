//! Knowledge-space ingestion: crawl, chunk, embed, upsert.
//!
//! Each source URL goes through the pipeline independently:
//!
//! 1. **Crawl** the page through the [`Crawler`] (wrapped in the resilience
//!    layer).
//! 2. **Chunk** the page text with [`chunk_text`].
//! 3. **Embed** the chunks in batches of `batch_size`.
//! 4. **Upsert** one vector record per chunk into the space's namespace.
//!
//! A failure at any step marks that URL `failed` and is reported, but never
//! aborts the other URLs. Up to `concurrency` URLs are processed at once.
//! Chunk ids are derived from `(namespace, url, chunk_index)`, so resuming
//! a space re-upserts over the same records instead of duplicating them.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use rag_chat_core::chunk::{chunk_text, CharRatioTokenizer, ChunkConfig, Tokenizer};
use rag_chat_core::embedding::Embedder;
use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::ids::{chunk_id, content_hash, generate_id, validate_segment};
use rag_chat_core::models::{
    CrawledPage, DocumentChunk, IngestionStatus, KnowledgeSpace, SourceStatus,
};
use rag_chat_core::services::Crawler;
use rag_chat_core::store::{KnowledgeSpaceRepository, StoredChunk, VectorRecord, VectorStore};

use crate::config::Config;
use crate::logging::{CrawlProgressEvent, CrawlStatus, NoopLogger, StructuredLogger};
use crate::resilience::Resilience;

#[derive(Debug, Clone)]
pub struct CreateKnowledgeSpaceRequest {
    pub tenant_id: String,
    pub name: String,
    pub source_urls: Vec<String>,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlError {
    pub url: String,
    pub error: String,
}

/// Outcome of one ingestion run. Counts cover every source of the space;
/// `errors` covers the URLs processed by this run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    pub knowledge_space_id: String,
    pub namespace: String,
    pub status: IngestionStatus,
    pub successful_urls: usize,
    pub failed_urls: usize,
    pub errors: Vec<UrlError>,
}

/// The chunks stored for one knowledge space, ordered by source URL and
/// then chunk index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeChunks {
    pub knowledge_space_id: String,
    pub namespace: String,
    pub chunk_count: usize,
    pub chunks: Vec<StoredChunk>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestionSettings {
    pub chunk: ChunkConfig,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_source_urls: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            batch_size: 64,
            concurrency: 4,
            max_source_urls: 20,
        }
    }
}

impl IngestionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk: config.chunking.chunk_config(),
            batch_size: config.embedding.batch_size,
            concurrency: config.ingestion.concurrency,
            max_source_urls: config.ingestion.max_source_urls,
        }
    }
}

pub struct IngestionService {
    crawler: Arc<dyn Crawler>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    spaces: Arc<dyn KnowledgeSpaceRepository>,
    resilience: Resilience,
    tokenizer: Arc<dyn Tokenizer>,
    logger: Arc<dyn StructuredLogger>,
    settings: IngestionSettings,
}

/// Per-run context shared by the URL jobs.
struct Run<'a> {
    request_id: &'a str,
    tenant_id: &'a str,
    knowledge_space_id: &'a str,
    namespace: &'a str,
    total_urls: usize,
}

impl IngestionService {
    pub fn new(
        crawler: Arc<dyn Crawler>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        spaces: Arc<dyn KnowledgeSpaceRepository>,
        resilience: Resilience,
    ) -> Self {
        Self {
            crawler,
            embedder,
            vectors,
            spaces,
            resilience,
            tokenizer: Arc::new(CharRatioTokenizer::default()),
            logger: Arc::new(NoopLogger),
            settings: IngestionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: IngestionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Create a knowledge space and ingest all of its sources.
    ///
    /// Input problems are rejected before anything is persisted. Once the
    /// space exists, per-URL failures only affect the reported status.
    pub async fn create_knowledge_space(
        &self,
        request: CreateKnowledgeSpaceRequest,
    ) -> Result<IngestionReport> {
        let name = request.name.trim();
        validate_segment("tenant id", &request.tenant_id)?;
        if name.is_empty() {
            return Err(RagError::Validation(
                "knowledge space name is required".to_string(),
            ));
        }
        let urls = dedup_urls(&request.source_urls);
        if urls.is_empty() {
            return Err(RagError::Validation(
                "at least one source URL is required".to_string(),
            ));
        }
        if urls.len() > self.settings.max_source_urls {
            return Err(RagError::Validation(format!(
                "too many source URLs: {} (max {})",
                urls.len(),
                self.settings.max_source_urls
            )));
        }

        let mut space = KnowledgeSpace::new(
            request.tenant_id.clone(),
            generate_id("ks"),
            name,
            &urls,
            Utc::now(),
        );
        self.spaces.save(&space).await?;
        info!(
            request_id = %request.request_id,
            tenant_id = %space.tenant_id,
            knowledge_space_id = %space.id,
            urls = urls.len(),
            "created knowledge space"
        );

        self.ingest(&mut space, &request.request_id).await
    }

    /// Re-run ingestion for every source of an existing space that is not
    /// yet `complete`.
    pub async fn resume(
        &self,
        tenant_id: &str,
        knowledge_space_id: &str,
        request_id: &str,
    ) -> Result<IngestionReport> {
        validate_segment("tenant id", tenant_id)?;
        validate_segment("knowledge space id", knowledge_space_id)?;
        let mut space = self
            .spaces
            .get(tenant_id, knowledge_space_id)
            .await?
            .ok_or_else(|| {
                RagError::NotFound(format!("knowledge space {}", knowledge_space_id))
            })?;
        self.ingest(&mut space, request_id).await
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<KnowledgeSpace>> {
        validate_segment("tenant id", tenant_id)?;
        self.spaces.list(tenant_id).await
    }

    /// Everything indexed so far for a space. A space whose namespace was
    /// never written to has no chunks.
    pub async fn chunks(&self, tenant_id: &str, knowledge_space_id: &str) -> Result<KnowledgeChunks> {
        validate_segment("tenant id", tenant_id)?;
        validate_segment("knowledge space id", knowledge_space_id)?;
        let space = self
            .spaces
            .get(tenant_id, knowledge_space_id)
            .await?
            .ok_or_else(|| {
                RagError::NotFound(format!("knowledge space {}", knowledge_space_id))
            })?;

        let namespace = space.namespace();
        let mut chunks = self
            .resilience
            .call(Dependency::VectorStore, || self.vectors.list(&namespace))
            .await?;
        chunks.sort_by(|a, b| {
            (a.payload.url.as_str(), a.payload.chunk_index)
                .cmp(&(b.payload.url.as_str(), b.payload.chunk_index))
        });

        Ok(KnowledgeChunks {
            knowledge_space_id: space.id,
            namespace,
            chunk_count: chunks.len(),
            chunks,
        })
    }

    async fn ingest(&self, space: &mut KnowledgeSpace, request_id: &str) -> Result<IngestionReport> {
        let namespace = space.namespace();
        let jobs: Vec<(usize, String)> = space
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status != SourceStatus::Complete)
            .map(|(i, s)| (i + 1, s.url.clone()))
            .collect();

        let run = Run {
            request_id,
            tenant_id: &space.tenant_id,
            knowledge_space_id: &space.id,
            namespace: &namespace,
            total_urls: space.sources.len(),
        };
        let run = &run;

        let outcomes: Vec<(String, Result<usize>)> = stream::iter(jobs)
            .map(|(index, url)| async move {
                let outcome = self.ingest_url(run, index, &url).await;
                (url, outcome)
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut errors = Vec::new();
        for (url, outcome) in outcomes {
            match outcome {
                Ok(_) => space.set_source_status(&url, SourceStatus::Complete),
                Err(e) => {
                    space.set_source_status(&url, SourceStatus::Failed);
                    errors.push(UrlError {
                        url,
                        error: e.to_string(),
                    });
                }
            }
        }
        self.spaces.save(space).await?;

        let successful_urls = count(space, SourceStatus::Complete);
        let failed_urls = count(space, SourceStatus::Failed);
        info!(
            request_id,
            knowledge_space_id = %space.id,
            status = %space.status,
            successful_urls,
            failed_urls,
            "ingestion finished"
        );

        Ok(IngestionReport {
            knowledge_space_id: space.id.clone(),
            namespace,
            status: space.status,
            successful_urls,
            failed_urls,
            errors,
        })
    }

    async fn ingest_url(&self, run: &Run<'_>, url_index: usize, url: &str) -> Result<usize> {
        self.progress(run, url, url_index, CrawlStatus::Started, None, None);

        match self.crawl_and_index(run.namespace, url).await {
            Ok(chunk_count) => {
                self.progress(
                    run,
                    url,
                    url_index,
                    CrawlStatus::Completed,
                    Some(chunk_count),
                    None,
                );
                Ok(chunk_count)
            }
            Err(e) => {
                warn!(url, error = %e, "source ingestion failed");
                self.progress(
                    run,
                    url,
                    url_index,
                    CrawlStatus::Failed,
                    None,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn crawl_and_index(&self, namespace: &str, url: &str) -> Result<usize> {
        let page = self
            .resilience
            .call(Dependency::Crawler, || self.crawler.fetch(url))
            .await?;
        let chunks = self.build_chunks(namespace, url, &page);

        for batch in chunks.chunks(self.settings.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .resilience
                .call(Dependency::Embedder, || self.embedder.embed_batch(&texts))
                .await?;
            if vectors.len() != batch.len() {
                return Err(RagError::external(
                    Dependency::Embedder,
                    None,
                    format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
                ));
            }

            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRecord::from_chunk(chunk, vector))
                .collect();
            self.resilience
                .call(Dependency::VectorStore, || {
                    self.vectors.upsert(namespace, &records)
                })
                .await?;
        }

        Ok(chunks.len())
    }

    fn build_chunks(&self, namespace: &str, url: &str, page: &CrawledPage) -> Vec<DocumentChunk> {
        chunk_text(&page.text, &self.settings.chunk, self.tokenizer.as_ref())
            .into_iter()
            .enumerate()
            .map(|(chunk_index, content)| DocumentChunk {
                id: chunk_id(namespace, url, chunk_index),
                namespace: namespace.to_string(),
                url: url.to_string(),
                title: page.title.clone(),
                content_hash: content_hash(&content),
                content,
                chunk_index,
            })
            .collect()
    }

    fn progress(
        &self,
        run: &Run<'_>,
        url: &str,
        url_index: usize,
        status: CrawlStatus,
        chunk_count: Option<usize>,
        error_message: Option<String>,
    ) {
        self.logger.crawl_progress(&CrawlProgressEvent {
            request_id: run.request_id,
            tenant_id: run.tenant_id,
            knowledge_space_id: run.knowledge_space_id,
            url,
            url_index,
            total_urls: run.total_urls,
            status,
            chunk_count,
            error_message,
        });
    }
}

/// Trim, drop blanks and drop repeats, keeping first-seen order.
fn dedup_urls(urls: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(urls.len());
    for url in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        if !seen.iter().any(|s: &String| s == url) {
            seen.push(url.to_string());
        }
    }
    seen
}

fn count(space: &KnowledgeSpace, status: SourceStatus) -> usize {
    space.sources.iter().filter(|s| s.status == status).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCrawler, KeywordEmbedder, RecordingLogger};
    use rag_chat_core::chunk::WhitespaceTokenizer;
    use rag_chat_core::store::memory::{InMemoryRepository, InMemoryVectorStore};

    struct Harness {
        service: IngestionService,
        vectors: Arc<InMemoryVectorStore>,
        repo: Arc<InMemoryRepository>,
        logger: Arc<RecordingLogger>,
    }

    fn harness(crawler: FakeCrawler, settings: IngestionSettings) -> Harness {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let repo = Arc::new(InMemoryRepository::new());
        let logger = Arc::new(RecordingLogger::default());
        let service = IngestionService::new(
            Arc::new(crawler),
            Arc::new(KeywordEmbedder::default()),
            vectors.clone(),
            repo.clone(),
            crate::testing::fast_resilience(),
        )
        .with_settings(settings)
        .with_tokenizer(Arc::new(WhitespaceTokenizer))
        .with_logger(logger.clone());
        Harness {
            service,
            vectors,
            repo,
            logger,
        }
    }

    fn request(urls: &[&str]) -> CreateKnowledgeSpaceRequest {
        CreateKnowledgeSpaceRequest {
            tenant_id: "acme".into(),
            name: "Docs".into(),
            source_urls: urls.iter().map(|u| u.to_string()).collect(),
            request_id: "req-1".into(),
        }
    }

    #[tokio::test]
    async fn test_all_sources_complete() {
        let crawler = FakeCrawler::default()
            .page("https://a.example", "A", "Pricing starts at ten dollars.")
            .page("https://b.example", "B", "Refunds are issued within a week.");
        let h = harness(crawler, IngestionSettings::default());

        let report = h
            .service
            .create_knowledge_space(request(&["https://a.example", "https://b.example"]))
            .await
            .unwrap();

        assert_eq!(report.status, IngestionStatus::Complete);
        assert_eq!((report.successful_urls, report.failed_urls), (2, 0));
        assert_eq!(h.vectors.records(&report.namespace).len(), 2);

        let stored = KnowledgeSpaceRepository::get(h.repo.as_ref(), "acme", &report.knowledge_space_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, IngestionStatus::Complete);
    }

    #[tokio::test]
    async fn test_small_batches_cover_every_chunk() {
        let text = "One two three four. Five six seven eight. Nine ten eleven twelve.";
        let crawler = FakeCrawler::default().page("https://a.example", "A", text);
        let settings = IngestionSettings {
            chunk: ChunkConfig {
                max_tokens: 4,
                overlap_tokens: 0,
            },
            batch_size: 2,
            ..IngestionSettings::default()
        };
        let h = harness(crawler, settings);

        let report = h
            .service
            .create_knowledge_space(request(&["https://a.example"]))
            .await
            .unwrap();
        let mut indexes: Vec<usize> = h
            .vectors
            .records(&report.namespace)
            .iter()
            .map(|r| r.payload.chunk_index)
            .collect();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_persisting() {
        let h = harness(FakeCrawler::default(), IngestionSettings::default());

        let err = h.service.create_knowledge_space(request(&[])).await.unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));

        let mut blank = request(&["https://a.example"]);
        blank.name = "   ".into();
        assert!(h.service.create_knowledge_space(blank).await.is_err());

        let many: Vec<String> = (0..21).map(|i| format!("https://{}.example", i)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        assert!(h.service.create_knowledge_space(request(&refs)).await.is_err());

        assert!(h.service.list("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_retries_only_failed_sources() {
        let crawler = FakeCrawler::default()
            .page("https://a.example", "A", "Pricing starts at ten dollars.")
            .failing_once("https://b.example", "B", "Refunds are issued within a week.");
        let h = harness(crawler, IngestionSettings::default());

        let first = h
            .service
            .create_knowledge_space(request(&["https://a.example", "https://b.example"]))
            .await
            .unwrap();
        assert_eq!(first.status, IngestionStatus::Partial);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].url, "https://b.example");

        let started_before = h.logger.crawl_count(CrawlStatus::Started);
        let second = h
            .service
            .resume("acme", &first.knowledge_space_id, "req-2")
            .await
            .unwrap();
        assert_eq!(second.status, IngestionStatus::Complete);
        assert!(second.errors.is_empty());
        assert_eq!(h.logger.crawl_count(CrawlStatus::Started) - started_before, 1);
        assert_eq!(h.vectors.records(&second.namespace).len(), 2);
    }

    #[tokio::test]
    async fn test_resume_unknown_space_is_not_found() {
        let h = harness(FakeCrawler::default(), IngestionSettings::default());
        let err = h.service.resume("acme", "ks_missing", "req").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_progress_events_per_url() {
        let crawler = FakeCrawler::default().page("https://a.example", "A", "Hello there.");
        let h = harness(crawler, IngestionSettings::default());
        h.service
            .create_knowledge_space(request(&["https://a.example", "ftp://bad.example"]))
            .await
            .unwrap();

        assert_eq!(h.logger.crawl_count(CrawlStatus::Started), 2);
        assert_eq!(h.logger.crawl_count(CrawlStatus::Completed), 1);
        assert_eq!(h.logger.crawl_count(CrawlStatus::Failed), 1);
    }

    #[tokio::test]
    async fn test_chunks_lists_indexed_content() {
        let text = "One two three four. Five six seven eight.";
        let crawler = FakeCrawler::default()
            .page("https://b.example", "B", "Refunds are issued within a week.")
            .page("https://a.example", "A", text);
        let settings = IngestionSettings {
            chunk: ChunkConfig {
                max_tokens: 4,
                overlap_tokens: 0,
            },
            ..IngestionSettings::default()
        };
        let h = harness(crawler, settings);
        let report = h
            .service
            .create_knowledge_space(request(&["https://b.example", "https://a.example"]))
            .await
            .unwrap();

        let listed = h
            .service
            .chunks("acme", &report.knowledge_space_id)
            .await
            .unwrap();
        assert_eq!(listed.namespace, report.namespace);
        assert_eq!(listed.chunk_count, listed.chunks.len());
        let order: Vec<(&str, usize)> = listed
            .chunks
            .iter()
            .map(|c| (c.payload.url.as_str(), c.payload.chunk_index))
            .collect();
        assert_eq!(order[0], ("https://a.example", 0));
        assert_eq!(order[1], ("https://a.example", 1));
        assert_eq!(order.last().unwrap().0, "https://b.example");
        assert_eq!(listed.chunks[0].payload.content, "One two three four.");

        let value = serde_json::to_value(&listed).unwrap();
        assert_eq!(value["chunkCount"], listed.chunk_count);
        assert_eq!(value["chunks"][0]["url"], "https://a.example");
    }

    #[tokio::test]
    async fn test_chunks_of_unindexed_space_is_empty() {
        let h = harness(FakeCrawler::default(), IngestionSettings::default());
        let report = h
            .service
            .create_knowledge_space(request(&["https://gone.example"]))
            .await
            .unwrap();
        assert_eq!(report.status, IngestionStatus::Failed);

        let listed = h
            .service
            .chunks("acme", &report.knowledge_space_id)
            .await
            .unwrap();
        assert_eq!(listed.chunk_count, 0);

        let err = h.service.chunks("acme", "ks_missing").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsafe_ids_are_rejected() {
        let h = harness(FakeCrawler::default(), IngestionSettings::default());

        let mut bad_tenant = request(&["https://a.example"]);
        bad_tenant.tenant_id = "a/../x".into();
        let err = h
            .service
            .create_knowledge_space(bad_tenant)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));

        assert!(matches!(
            h.service.list("a?y").await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            h.service.resume("acme", "ks_1/../ks_2", "req").await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            h.service.chunks("acme", "ks 1").await,
            Err(RagError::Validation(_))
        ));
        assert!(h.service.list("acme").await.unwrap().is_empty());
    }

    #[test]
    fn test_dedup_urls() {
        let urls = vec![
            " https://a.example ".to_string(),
            "".to_string(),
            "https://b.example".to_string(),
            "https://a.example".to_string(),
        ];
        assert_eq!(dedup_urls(&urls), vec!["https://a.example", "https://b.example"]);
    }
}
