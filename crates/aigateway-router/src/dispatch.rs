//! Router / Fallback Engine (C6): the single `route(envelope)` entry point.
//! Candidates come from the Registry already ordered and filtered; this
//! module's job is purely the per-candidate breaker/retry/client dance and
//! bookkeeping described in SPEC_FULL.md §4.6. It does not know about HTTP;
//! `crate::http` adapts this to axum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aigateway_breaker::{CircuitBreaker, EnterOutcome, ReportOutcome};
use aigateway_cache::{CacheEntry, ResponseCache};
use aigateway_client::{HttpMethod, RequestEnvelope, ResponseBody, UpstreamClient};
use aigateway_common::{AttemptSummary, ErrorClass, GatewayError, Operation, RequestId, UpstreamError};
use aigateway_metrics::Metrics;
use aigateway_registry::ProviderRegistry;
use aigateway_retry::{Adaptive, ExponentialBackoff, ImmediateRetry, RetryConfig, RetryExecutor, RetryHistory, RetryStrategy};
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Exponential,
    Immediate,
    Adaptive,
}

fn build_strategy(kind: StrategyKind) -> Box<dyn RetryStrategy> {
    match kind {
        StrategyKind::Exponential => Box::new(ExponentialBackoff),
        StrategyKind::Immediate => Box::new(ImmediateRetry),
        StrategyKind::Adaptive => Box::new(Adaptive),
    }
}

fn operation_name(op: Operation) -> &'static str {
    match op {
        Operation::ChatCompletion => "chat_completion",
        Operation::TextCompletion => "text_completion",
        Operation::Embeddings => "embeddings",
        Operation::ImageGeneration => "image_generation",
    }
}

/// Authentication/Authorization/ClientError are the request's own fault, not
/// the upstream's: surfaced immediately, no fallback, no breaker/registry
/// report (mirrors the explicit NotSupported carve-out in SPEC_FULL.md §4.6c).
fn is_short_circuit(class: &ErrorClass) -> bool {
    matches!(
        class,
        ErrorClass::Authentication | ErrorClass::Authorization | ErrorClass::ClientError
    )
}

pub struct RouterConfig {
    pub request_timeout: Duration,
    pub default_strategy: StrategyKind,
    pub strategy_overrides: HashMap<String, StrategyKind>,
    pub retry: RetryConfig,
}

/// What the Router receives: forwarded verbatim minus routing/auth keys.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub operation: Operation,
    pub model: String,
    pub stream: bool,
    pub path: String,
    pub forward_headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct Provenance {
    pub upstream: String,
    pub attempt: u32,
    pub elapsed: Duration,
    pub request_id: RequestId,
    pub cached: bool,
}

pub enum RouteOutcome {
    Buffered {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        provenance: Provenance,
    },
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        receiver: mpsc::Receiver<Bytes>,
        provenance: Provenance,
    },
}

pub struct GatewayRouter {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    client: Arc<dyn UpstreamClient>,
    cache: Arc<dyn ResponseCache>,
    metrics: Arc<Metrics>,
    config: RouterConfig,
    histories: Mutex<HashMap<String, Arc<Mutex<RetryHistory>>>>,
}

impl GatewayRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        client: Arc<dyn UpstreamClient>,
        cache: Arc<dyn ResponseCache>,
        metrics: Arc<Metrics>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            client,
            cache,
            metrics,
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    async fn history_for(&self, name: &str) -> Arc<Mutex<RetryHistory>> {
        let mut guard = self.histories.lock().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RetryHistory::new())))
            .clone()
    }

    pub async fn route(&self, envelope: Inbound) -> Result<RouteOutcome, GatewayError> {
        let request_id = RequestId::new();
        let started = Instant::now();
        let deadline = started + self.config.request_timeout;
        let span = tracing::info_span!(
            "route_request",
            request_id = %request_id,
            operation = ?envelope.operation,
            model = %envelope.model,
        );
        let _guard = span.enter();

        let candidates = self
            .registry
            .candidates(&envelope.model, envelope.operation.required_capability());
        if candidates.is_empty() {
            tracing::warn!("no candidate upstream serves this model/capability");
            return Err(GatewayError::ModelNotSupported {
                model: envelope.model.clone(),
            });
        }

        let cacheable = !envelope.stream;
        let fingerprint = cacheable.then(|| {
            aigateway_cache::fingerprint(&envelope.model, operation_name(envelope.operation), &envelope.body)
        });

        if let Some(fp) = &fingerprint {
            if let Some(entry) = self.cache.lookup(fp).await {
                self.metrics.record_cache_lookup(true);
                tracing::info!("served from cache");
                return Ok(RouteOutcome::Buffered {
                    status: entry.status,
                    headers: entry.headers,
                    body: entry.body,
                    provenance: Provenance {
                        upstream: "cache".to_string(),
                        attempt: 0,
                        elapsed: started.elapsed(),
                        request_id,
                        cached: true,
                    },
                });
            }
            self.metrics.record_cache_lookup(false);
        }

        let mut attempts: Vec<AttemptSummary> = Vec::new();
        let mut saw_reportable_failure = false;

        for (index, upstream) in candidates.iter().enumerate() {
            if Instant::now() >= deadline {
                tracing::warn!("deadline exceeded, abandoning remaining candidates");
                return Err(GatewayError::Timeout);
            }

            let permit = match self.breaker.enter(&upstream.name).await {
                EnterOutcome::Permit(p) => p,
                EnterOutcome::Reject { retry_after } => {
                    tracing::info!(
                        upstream = %upstream.name,
                        retry_after_s = retry_after.as_secs_f64(),
                        "breaker open, skipping candidate"
                    );
                    attempts.push(AttemptSummary {
                        upstream_name: upstream.name.clone(),
                        attempt_index: index as u32,
                        elapsed: Duration::ZERO,
                        error_class: Some("breaker_open".to_string()),
                        message: Some("circuit breaker open".to_string()),
                    });
                    saw_reportable_failure = true;
                    continue;
                }
            };

            let history_lock = self.history_for(&upstream.name).await;
            let mut history = history_lock.lock().await;

            let strategy_kind = self
                .config
                .strategy_overrides
                .get(&upstream.name)
                .copied()
                .unwrap_or(self.config.default_strategy);
            let executor = RetryExecutor::new(build_strategy(strategy_kind), &self.config.retry, upstream.name.clone());

            let client = self.client.clone();
            let upstream_cfg = upstream.clone();
            let path = envelope.path.clone();
            let headers = envelope.forward_headers.clone();
            let body = envelope.body.clone();
            let stream = envelope.stream;

            let attempt_started = Instant::now();
            let result = executor
                .execute(&mut *history, |_attempt| {
                    let client = client.clone();
                    let upstream_cfg = upstream_cfg.clone();
                    let request = RequestEnvelope {
                        method: HttpMethod::Post,
                        path: path.clone(),
                        headers: headers.clone(),
                        body: Some(body.clone()),
                        stream,
                    };
                    async move { client.call(upstream_cfg.as_ref(), &request, deadline).await }
                })
                .await;
            drop(history);

            match result {
                Err((ErrorClass::NotSupported, message)) => {
                    tracing::info!(upstream = %upstream.name, "operation not supported by this upstream");
                    attempts.push(AttemptSummary {
                        upstream_name: upstream.name.clone(),
                        attempt_index: index as u32,
                        elapsed: attempt_started.elapsed(),
                        error_class: Some(ErrorClass::NotSupported.name().to_string()),
                        message: Some(message),
                    });
                    continue;
                }
                Err((class, message)) if is_short_circuit(&class) => {
                    tracing::warn!(upstream = %upstream.name, class = %class, "short-circuiting on bad request");
                    // Not an upstream-health signal: release the HALF_OPEN
                    // probe (if one was issued) without penalizing the
                    // upstream, then surface the 4xx immediately.
                    self.breaker.report(permit, ReportOutcome::Success).await;
                    return Err(GatewayError::Upstream(UpstreamError { class, message }));
                }
                Err((class, message)) => {
                    self.breaker.report(permit, ReportOutcome::Failure).await;
                    self.registry.record_outcome(&upstream.name, false, Some(message.clone()));
                    self.metrics.record_retry_attempt(&upstream.name, &class);
                    tracing::warn!(upstream = %upstream.name, class = %class, "candidate exhausted retries");
                    attempts.push(AttemptSummary {
                        upstream_name: upstream.name.clone(),
                        attempt_index: index as u32,
                        elapsed: attempt_started.elapsed(),
                        error_class: Some(class.name().to_string()),
                        message: Some(message),
                    });
                    saw_reportable_failure = true;
                    continue;
                }
                Ok(response) => {
                    self.breaker.report(permit, ReportOutcome::Success).await;
                    self.registry.record_outcome(&upstream.name, true, None);
                    let provenance = Provenance {
                        upstream: upstream.name.clone(),
                        attempt: (index as u32) + 1,
                        elapsed: started.elapsed(),
                        request_id,
                        cached: false,
                    };

                    match response.body {
                        ResponseBody::Stream(receiver) => {
                            tracing::info!(upstream = %upstream.name, "stream established");
                            return Ok(RouteOutcome::Stream {
                                status: response.status,
                                headers: response.headers,
                                receiver,
                                provenance,
                            });
                        }
                        ResponseBody::Buffered(body) => {
                            if let Some(fp) = &fingerprint {
                                let entry = CacheEntry {
                                    status: response.status,
                                    headers: response.headers.clone(),
                                    body: body.clone(),
                                };
                                let build: aigateway_cache::BoxFuture<Result<CacheEntry, String>> =
                                    Box::pin(async move { Ok(entry) });
                                let _ = self.cache.single_flight(fp, build).await;
                            }
                            tracing::info!(
                                upstream = %upstream.name,
                                attempt = provenance.attempt,
                                elapsed_ms = provenance.elapsed.as_millis() as u64,
                                "request_complete"
                            );
                            return Ok(RouteOutcome::Buffered {
                                status: response.status,
                                headers: response.headers,
                                body,
                                provenance,
                            });
                        }
                    }
                }
            }
        }

        tracing::warn!(attempts = attempts.len(), "all candidates exhausted");
        if saw_reportable_failure {
            Err(GatewayError::AllUpstreamsUnavailable { attempts })
        } else {
            Err(GatewayError::OperationNotSupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigateway_breaker::{BreakerConfig, InMemoryBreakerStore};
    use aigateway_cache::InMemoryResponseCache;
    use aigateway_common::{Capability, UpstreamKind};
    use aigateway_registry::{HealthProbe, ProbeResult, UpstreamConfig};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _upstream: &UpstreamConfig) -> ProbeResult {
            ProbeResult { healthy: true, details: None }
        }
    }

    /// Scripted client: returns canned outcomes for each upstream name, in
    /// order, so the fallback path can be exercised without real HTTP.
    struct ScriptedClient {
        calls: AtomicUsize,
        scripts: HashMap<String, Vec<Result<(u16, Bytes), (ErrorClass, String)>>>,
    }

    #[async_trait]
    impl UpstreamClient for ScriptedClient {
        async fn call(
            &self,
            upstream: &UpstreamConfig,
            _envelope: &RequestEnvelope,
            _deadline: Instant,
        ) -> Result<aigateway_client::UpstreamResponse, (ErrorClass, String)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.get(&upstream.name).expect("scripted upstream");
            let call_index = self.calls.load(Ordering::SeqCst);
            let outcome = script.get(call_index - 1).or_else(|| script.last()).unwrap();
            match outcome {
                Ok((status, body)) => Ok(aigateway_client::UpstreamResponse {
                    status: *status,
                    headers: vec![],
                    body: ResponseBody::Buffered(body.clone()),
                }),
                Err(e) => Err(e.clone()),
            }
        }
    }

    fn upstream(name: &str, priority: i32) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            kind: UpstreamKind::OpenAi,
            base_url: "https://example.invalid".to_string(),
            credential_source: "KEY".to_string(),
            models: HashSet::from(["gpt-test".to_string()]),
            priority,
            enabled: true,
            forced: false,
            timeout_ms: 1_000,
            max_retries: 1,
            capability_set: HashSet::from([Capability::ChatCompletion]),
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            global: aigateway_retry::RetryParams {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_factor: 2.0,
                jitter: false,
                jitter_factor: 0.0,
            },
            ..Default::default()
        }
    }

    async fn registry(configs: Vec<UpstreamConfig>) -> Arc<ProviderRegistry> {
        ProviderRegistry::init(configs, Arc::new(AlwaysHealthy), Duration::from_secs(3600), Duration::from_secs(1))
            .unwrap()
    }

    fn inbound() -> Inbound {
        Inbound {
            operation: Operation::ChatCompletion,
            model: "gpt-test".to_string(),
            stream: false,
            path: "/v1/chat/completions".to_string(),
            forward_headers: vec![],
            body: Bytes::from_static(b"{\"model\":\"gpt-test\"}"),
        }
    }

    #[tokio::test]
    async fn happy_path_uses_first_candidate_only() {
        let reg = registry(vec![upstream("a", 1), upstream("b", 2)]).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), BreakerConfig::default()));
        let mut scripts = HashMap::new();
        scripts.insert("a".to_string(), vec![Ok((200, Bytes::from_static(b"{\"ok\":true}")))]);
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { calls: AtomicUsize::new(0), scripts });
        let router = GatewayRouter::new(
            reg.clone(),
            breaker,
            client,
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(Metrics::install()),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                default_strategy: StrategyKind::Exponential,
                strategy_overrides: HashMap::new(),
                retry: retry_config(),
            },
        );

        match router.route(inbound()).await.unwrap() {
            RouteOutcome::Buffered { provenance, .. } => {
                assert_eq!(provenance.upstream, "a");
                assert_eq!(provenance.attempt, 1);
            }
            RouteOutcome::Stream { .. } => panic!("expected buffered response"),
        }
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_on_exhausted_retries() {
        let reg = registry(vec![upstream("a", 1), upstream("b", 2)]).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), BreakerConfig::default()));
        let mut scripts = HashMap::new();
        scripts.insert(
            "a".to_string(),
            vec![
                Err((ErrorClass::ServerError, "boom".to_string())),
                Err((ErrorClass::ServerError, "boom".to_string())),
            ],
        );
        scripts.insert("b".to_string(), vec![Ok((200, Bytes::from_static(b"{\"ok\":true}")))]);
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { calls: AtomicUsize::new(0), scripts });
        let router = GatewayRouter::new(
            reg.clone(),
            breaker,
            client,
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(Metrics::install()),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                default_strategy: StrategyKind::Exponential,
                strategy_overrides: HashMap::new(),
                retry: retry_config(),
            },
        );

        match router.route(inbound()).await.unwrap() {
            RouteOutcome::Buffered { provenance, .. } => assert_eq!(provenance.upstream, "b"),
            RouteOutcome::Stream { .. } => panic!("expected buffered response"),
        }
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn authentication_error_short_circuits_without_fallback() {
        let reg = registry(vec![upstream("a", 1), upstream("b", 2)]).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), BreakerConfig::default()));
        let mut scripts = HashMap::new();
        scripts.insert("a".to_string(), vec![Err((ErrorClass::Authentication, "bad key".to_string()))]);
        scripts.insert("b".to_string(), vec![Ok((200, Bytes::from_static(b"{\"ok\":true}")))]);
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { calls: AtomicUsize::new(0), scripts });
        let router = GatewayRouter::new(
            reg.clone(),
            breaker,
            client,
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(Metrics::install()),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                default_strategy: StrategyKind::Exponential,
                strategy_overrides: HashMap::new(),
                retry: retry_config(),
            },
        );

        let err = router.route(inbound()).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_without_any_wire_call() {
        let reg = registry(vec![upstream("a", 1)]).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), BreakerConfig::default()));
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { calls: AtomicUsize::new(0), scripts: HashMap::new() });
        let router = GatewayRouter::new(
            reg.clone(),
            breaker,
            client,
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(Metrics::install()),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                default_strategy: StrategyKind::Exponential,
                strategy_overrides: HashMap::new(),
                retry: retry_config(),
            },
        );

        let mut req = inbound();
        req.model = "unknown-model".to_string();
        let err = router.route(req).await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotSupported { .. }));
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn second_request_for_same_fingerprint_is_served_from_cache() {
        let reg = registry(vec![upstream("a", 1)]).await;
        let breaker = Arc::new(CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), BreakerConfig::default()));
        let mut scripts = HashMap::new();
        scripts.insert("a".to_string(), vec![Ok((200, Bytes::from_static(b"{\"ok\":true}")))]);
        let client: Arc<dyn UpstreamClient> = Arc::new(ScriptedClient { calls: AtomicUsize::new(0), scripts });
        let router = GatewayRouter::new(
            reg.clone(),
            breaker,
            client,
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(Metrics::install()),
            RouterConfig {
                request_timeout: Duration::from_secs(5),
                default_strategy: StrategyKind::Exponential,
                strategy_overrides: HashMap::new(),
                retry: retry_config(),
            },
        );

        router.route(inbound()).await.unwrap();
        match router.route(inbound()).await.unwrap() {
            RouteOutcome::Buffered { provenance, .. } => {
                assert!(provenance.cached);
                assert_eq!(provenance.upstream, "cache");
            }
            RouteOutcome::Stream { .. } => panic!("expected buffered response"),
        }
        reg.shutdown().await;
    }
}
