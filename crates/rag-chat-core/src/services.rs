//! Network-facing collaborators other than storage: the crawler and the
//! language model.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::CrawledPage;

/// Fetches a page and reduces it to a title and normalized text.
///
/// Must fail with a typed error on non-2xx responses, timeouts, and any
/// scheme other than `http`/`https`.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<CrawledPage>;
}

/// Single-turn text completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}
