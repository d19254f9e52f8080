//! Wires the seven core crates into one running gateway: registry, breaker,
//! retry config, client, cache, metrics, router, then the axum surface.
//! Mirrors the gateway's own bootstrap-then-build-engine-then-serve shape,
//! with the DB-backed `Bootstrap` struct replaced by a config-file-backed
//! one (SPEC_FULL.md §9 open question (c)).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aigateway_breaker::{CircuitBreaker, InMemoryBreakerStore};
use aigateway_cache::{InMemoryResponseCache, ResponseCache};
use aigateway_client::{ReqwestUpstreamClient, UpstreamClient};
use aigateway_metrics::Metrics;
use aigateway_registry::{HealthProbe, ProviderRegistry, RegistryError};
use aigateway_router::auth::AuthKeys;
use aigateway_router::{build_app, AppState, GatewayRouter, RouterConfig};

use crate::config::AppConfig;

pub struct Gateway {
    pub registry: Arc<ProviderRegistry>,
    pub router: axum::Router,
    pub bind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub fn build(config: AppConfig) -> Result<Gateway, BootstrapError> {
    let metrics = Arc::new(Metrics::install());

    let client = Arc::new(ReqwestUpstreamClient::new(metrics.clone()));
    let upstream_client: Arc<dyn UpstreamClient> = client.clone();
    let prober: Arc<dyn HealthProbe> = client;

    let registry = ProviderRegistry::init(
        config.upstreams,
        prober,
        Duration::from_millis(config.health_interval_ms),
        Duration::from_millis(config.health_probe_timeout_ms),
    )?;

    let breaker_store = Arc::new(InMemoryBreakerStore::new());
    let breaker = Arc::new(
        CircuitBreaker::new(breaker_store, config.breaker).with_observer(metrics.clone()),
    );

    let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryResponseCache::new());

    let router_config = RouterConfig {
        request_timeout: Duration::from_secs(120),
        default_strategy: config.default_strategy,
        strategy_overrides: HashMap::new(),
        retry: config.retry,
    };

    let gateway_router = Arc::new(GatewayRouter::new(
        registry.clone(),
        breaker,
        upstream_client,
        cache,
        metrics.clone(),
        router_config,
    ));

    let auth = Arc::new(AuthKeys::new(config.auth_keys));

    tracing::info!(
        header_mode = %config.auth_header_mode,
        keys_configured = !auth.is_empty(),
        "auth configured"
    );

    let state = AppState {
        router: gateway_router,
        registry: registry.clone(),
        metrics,
        auth,
    };

    Ok(Gateway {
        registry,
        router: build_app(state),
        bind: format!("{}:{}", config.host, config.port),
    })
}
