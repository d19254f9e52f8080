//! Inbound authentication: extract the caller's key the same way the
//! gateway's own `AuthProvider` does (`X-API-Key` header first, then a
//! `Bearer`/`bearer`-prefixed `Authorization` header), but compare it in
//! constant time — a strengthening SPEC_FULL.md §6/§9(d) requires beyond
//! what that extraction logic itself does.

use axum::http::HeaderMap;

#[derive(Debug, Clone)]
pub struct AuthKeys {
    keys: Vec<String>,
}

impl AuthKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// `true` iff `candidate` matches one of the configured keys. Every
    /// candidate is compared against every configured key in full (no
    /// early return on first match) so the total time depends only on the
    /// number of configured keys, not on which one (if any) matched.
    pub fn verify(&self, candidate: &str) -> bool {
        let mut matched = false;
        for key in &self.keys {
            matched |= constant_time_eq(key.as_bytes(), candidate.as_bytes());
        }
        matched
    }
}

/// Fixed-time byte comparison: XOR-accumulate every byte pair, including
/// the length mismatch case, rather than short-circuiting on the first
/// differing byte or on length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max_len = a.len().max(b.len());
    let mut diff = (a.len() != b.len()) as u8;
    for i in 0..max_len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Mirrors the gateway's own extraction order: `x-api-key` header first,
/// then `Authorization` with a `Bearer `/`bearer ` prefix stripped.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok())?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn extracts_x_api_key_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-a"));
        headers.insert("authorization", HeaderValue::from_static("Bearer key-b"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("key-a"));
    }

    #[test]
    fn falls_back_to_bearer_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer key-b"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("key-b"));
    }

    #[test]
    fn verify_accepts_any_configured_key() {
        let keys = AuthKeys::new(vec!["one".to_string(), "two".to_string()]);
        assert!(keys.verify("two"));
        assert!(!keys.verify("three"));
    }
}
