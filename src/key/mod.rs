//! Cache key and rate-limit identity derivation.
//!
//! Keys are fingerprints: the raw parameter values never appear in store
//! keys or logs, only a truncated SHA-256 over the canonical form.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::{Error, ErrorContext, Result};

/// Truncated hex length of a derived fingerprint.
const FINGERPRINT_LEN: usize = 32;

/// A derived cache key fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Derives cache keys and rate-limit identities from request attributes.
///
/// Determinism contract: two logically identical requests (same method,
/// path, and normalized parameters, in any order) always map to the same
/// key. This is the property the gateway's HIT rate depends on.
#[derive(Debug, Clone, Default)]
pub struct KeyCodec;

impl KeyCodec {
    pub fn new() -> Self {
        Self
    }

    /// Derive the cache key for a request.
    ///
    /// Parameters are sorted by name and value-normalized before hashing;
    /// duplicate parameter names keep the last value.
    pub fn derive_cache_key(
        &self,
        method: &str,
        path: &str,
        params: &[(String, String)],
    ) -> Result<CacheKey> {
        let method = method.trim();
        let path = path.trim();
        if method.is_empty() {
            return Err(Error::validation_with_context(
                "request method is empty",
                ErrorContext::new().with_source("key_codec"),
            ));
        }
        if path.is_empty() {
            return Err(Error::validation_with_context(
                "request path is empty",
                ErrorContext::new().with_source("key_codec"),
            ));
        }

        let mut normalized: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in params {
            normalized.insert(name.trim().to_string(), canonical_value(value));
        }

        let mut canonical = format!("{}\n{}\n", method.to_ascii_uppercase(), path);
        let mut first = true;
        for (name, value) in &normalized {
            if !first {
                canonical.push('&');
            }
            canonical.push_str(name);
            canonical.push('=');
            canonical.push_str(value);
            first = false;
        }

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hex: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(CacheKey(hex[..FINGERPRINT_LEN].to_string()))
    }

    /// Derive the rate-limit identity for a caller.
    ///
    /// Preference order: verified user id, first forwarded-for token,
    /// X-Real-IP, direct connection address. Callers that resolve to none
    /// of these all share the `unknown` bucket; that shared bucket is a
    /// documented degradation, not an error.
    pub fn derive_identity(
        &self,
        user_id: Option<&str>,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        remote_addr: Option<&str>,
    ) -> String {
        if let Some(id) = user_id.map(str::trim).filter(|s| !s.is_empty()) {
            return format!("user:{}", id);
        }
        if let Some(ip) = forwarded_for
            .and_then(|h| h.split(',').map(str::trim).find(|t| !t.is_empty()))
        {
            return format!("ip:{}", ip);
        }
        if let Some(ip) = real_ip.map(str::trim).filter(|s| !s.is_empty()) {
            return format!("ip:{}", ip);
        }
        if let Some(ip) = remote_addr.map(str::trim).filter(|s| !s.is_empty()) {
            return format!("ip:{}", ip);
        }
        "unknown".to_string()
    }
}

/// Coerce a parameter value to canonical string form.
///
/// Numbers lose trailing fractional zeros ("100.0" -> "100", "1.50" -> "1.5"),
/// booleans are lowercased. Integer-looking strings pass through verbatim so
/// large epoch values never round-trip through f64.
fn canonical_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return "true".to_string();
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return "false".to_string();
    }
    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed.to_string();
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        if v.is_finite() {
            // Rust's f64 Display is the shortest round-trip form.
            return format!("{}", v);
        }
    }
    trimmed.to_string()
}
