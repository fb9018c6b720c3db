//! HTTP crawler: fetch a page and reduce it to a title and plain text.
//!
//! Only `http` and `https` URLs are accepted. Anything else fails with a
//! validation error before a request is made, so the resilience layer never
//! retries it. Text is taken from `<body>` with `script`, `style`,
//! `noscript` and `template` subtrees removed, then whitespace-collapsed.

use async_trait::async_trait;
use reqwest::Client;
use scraper::node::Node;
use scraper::{Html, Selector};
use url::Url;

use rag_chat_core::error::{Dependency, RagError, Result};
use rag_chat_core::models::CrawledPage;
use rag_chat_core::services::Crawler;

use crate::config::CrawlerConfig;
use crate::http::{build_client, check_status, transport_error};

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];
const UNTITLED: &str = "Untitled";

pub struct HttpCrawler {
    client: Client,
}

impl HttpCrawler {
    pub fn new(config: &CrawlerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs, Some(&config.user_agent))?,
        })
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn fetch(&self, url: &str) -> Result<CrawledPage> {
        let parsed = validate_url(url)?;
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| transport_error(Dependency::Crawler, e))?;
        let response = check_status(Dependency::Crawler, response).await?;
        let html = response
            .text()
            .await
            .map_err(|e| transport_error(Dependency::Crawler, e))?;
        Ok(extract_page(url, &html))
    }
}

/// Parse `raw` and require an `http`/`https` scheme.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RagError::Validation(format!("invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RagError::Validation(format!(
            "unsupported URL scheme '{}' in '{}': only http and https are allowed",
            other, raw
        ))),
    }
}

/// Title and normalized body text of an HTML document.
pub fn extract_page(url: &str, html: &str) -> CrawledPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut raw = String::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let skipped = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !skipped {
            raw.push_str(text);
            raw.push(' ');
        }
    }

    CrawledPage {
        url: url.to_string(),
        title,
        text: collapse_whitespace(&raw),
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
