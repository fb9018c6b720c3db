//! Shared reqwest plumbing for the HTTP collaborators.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response};

use rag_chat_core::error::{Dependency, RagError};

const MAX_ERROR_BODY: usize = 512;

pub(crate) fn build_client(timeout_secs: u64, user_agent: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs));
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent);
    }
    builder.build().context("failed to build HTTP client")
}

/// Read an API key from the named environment variable.
pub(crate) fn api_key_from_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => anyhow::bail!("{} environment variable not set", var),
    }
}

/// Map a transport failure. Timeouts and connection errors carry no
/// status and are therefore retryable.
pub(crate) fn transport_error(dependency: Dependency, err: reqwest::Error) -> RagError {
    let status = err.status().map(|s| s.as_u16());
    let message = if err.is_timeout() {
        format!("request timed out: {}", err)
    } else {
        err.to_string()
    };
    RagError::external(dependency, status, message)
}

/// Pass 2xx responses through; turn anything else into an
/// `ExternalService` error carrying the status and a clipped body.
pub(crate) async fn check_status(
    dependency: Dependency,
    response: Response,
) -> std::result::Result<Response, RagError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RagError::external(
        dependency,
        Some(status.as_u16()),
        clip(&body),
    ))
}

fn clip(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_long_bodies() {
        let long = "x".repeat(2000);
        let clipped = clip(&long);
        assert_eq!(clipped.chars().count(), MAX_ERROR_BODY + 1);
        assert_eq!(clip("  short  "), "short");
    }

    #[test]
    fn test_missing_api_key() {
        let err = api_key_from_env("RAGCHAT_TEST_KEY_THAT_IS_NEVER_SET").unwrap_err();
        assert!(err.to_string().contains("RAGCHAT_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
