//! Response cache (C5), interface only: fingerprint idempotent requests,
//! return a prior result, and guarantee at-most-one concurrent build per
//! fingerprint process-wide. The entry table is an ArcSwap snapshot (the
//! same copy-on-write idiom the gateway's core state module uses for its
//! provider map); in-flight builds are coalesced with `futures_util`'s
//! `Shared`, already a dependency in this corpus for exactly this purpose.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{FutureExt, Shared};
use tokio::sync::Mutex;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Caching is the Router's call: it is skipped entirely for streaming
/// requests and the fingerprint MUST exclude `stream`, authentication, and
/// volatile request-id fields before being passed here.
pub fn fingerprint(model: &str, operation: &str, canonical_body: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(operation.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_body);
    hasher.finalize().to_hex().to_string()
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry>;

    /// At-most-one concurrent `build` per fingerprint; waiters share the
    /// first caller's result instead of repeating the upstream call.
    async fn single_flight(
        &self,
        fingerprint: &str,
        build: BoxFuture<Result<CacheEntry, String>>,
    ) -> Result<CacheEntry, String>;
}

type SharedBuild = Shared<BoxFuture<Result<CacheEntry, String>>>;

#[derive(Default)]
pub struct InMemoryResponseCache {
    entries: ArcSwap<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, SharedBuild>>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn lookup(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.entries.load().get(fingerprint).cloned()
    }

    async fn single_flight(
        &self,
        fingerprint: &str,
        build: BoxFuture<Result<CacheEntry, String>>,
    ) -> Result<CacheEntry, String> {
        if let Some(entry) = self.lookup(fingerprint).await {
            return Ok(entry);
        }

        let shared = {
            let mut guard = self.inflight.lock().await;
            if let Some(existing) = guard.get(fingerprint) {
                existing.clone()
            } else {
                let shared = build.shared();
                guard.insert(fingerprint.to_string(), shared.clone());
                shared
            }
        };

        let result = shared.await;

        {
            let mut guard = self.inflight.lock().await;
            guard.remove(fingerprint);
        }

        if let Ok(entry) = &result {
            let mut next = self.entries.load().as_ref().clone();
            next.insert(fingerprint.to_string(), entry.clone());
            self.entries.store(Arc::new(next));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let a = fingerprint("gpt-test", "chat_completion", b"{}");
        let b = fingerprint("gpt-test", "chat_completion", b"{}");
        let c = fingerprint("gpt-test", "chat_completion", b"{\"x\":1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn single_flight_runs_builder_once_for_concurrent_callers() {
        let cache = Arc::new(InMemoryResponseCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let build: BoxFuture<Result<CacheEntry, String>> = Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(CacheEntry {
                        status: 200,
                        headers: vec![],
                        body: Bytes::from_static(b"{}"),
                    })
                });
                cache.single_flight("fp", build).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_returns_cached_entry_after_build() {
        let cache = InMemoryResponseCache::new();
        let build: BoxFuture<Result<CacheEntry, String>> = Box::pin(async {
            Ok(CacheEntry {
                status: 200,
                headers: vec![],
                body: Bytes::from_static(b"hi"),
            })
        });
        cache.single_flight("fp", build).await.unwrap();
        assert!(cache.lookup("fp").await.is_some());
        assert!(cache.lookup("other").await.is_none());
    }
}
