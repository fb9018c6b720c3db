//! Identifier and content-hash helpers.
//!
//! Entity ids (`ks_…`, `agent_…`, `conv_…`) are time-based with a random
//! base36 suffix: unique enough, roughly ordered by recency, nothing more.
//! Chunk ids are UUIDv5 values derived from their position so that
//! re-ingesting the same page overwrites the same vector records.
//!
//! Caller-supplied ids (tenants, knowledge spaces, agents) must pass
//! [`validate_segment`] before use: they end up inside vector-store
//! namespaces and collection URL paths.

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

/// Generate `{prefix}_{unix_millis}_{9 random base36 chars}`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// Accept `value` only if it is a non-empty run of ASCII letters, digits,
/// `_` or `-`. `kind` names the field in the error message.
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RagError::Validation(format!("{} is required", kind)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RagError::Validation(format!(
            "{} may only contain letters, digits, '_' and '-': {:?}",
            kind, value
        )));
    }
    Ok(())
}

/// Deterministic chunk id for `(namespace, url, index)`.
pub fn chunk_id(namespace: &str, url: &str, chunk_index: usize) -> String {
    let name = format!("{}|{}|{}", namespace, url, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// SHA-256 hex digest of chunk text, kept alongside the vector for
/// staleness checks.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
