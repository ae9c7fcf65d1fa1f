//! Canonical request encoding for cache keys.
//!
//! Requests are serialized with the JSON Canonicalization Scheme (RFC 8785)
//! so that two payloads with the same content but different key order map to
//! the same cache entry.

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value to JCS canonical JSON.
pub fn to_canonical_string<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_jcs::to_string(value).context("JCS canonicalization failed")
}

/// Cache key for one `(service, method, request)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(service: &str, method: &str, request: &Value) -> anyhow::Result<Self> {
        let canonical = to_canonical_string(request)?;

        let mut h = Sha256::new();
        h.update(service.as_bytes());
        h.update(b"\n");
        h.update(method.as_bytes());
        h.update(b"\n");
        h.update(canonical.as_bytes());
        Ok(Self(hex::encode(h.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
