//! Provider registry and health tracker (C4): holds the configured set of
//! upstreams and produces an ordered candidate list for a (model,
//! capability) query. Candidate lists are immutable snapshots — modeled on
//! the same ArcSwap copy-on-write state the gateway's core state module
//! uses for its provider map, so an in-flight request never observes a
//! partially-applied health transition.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aigateway_common::{Capability, UpstreamKind};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate upstream name: {0}")]
    DuplicateName(String),
    #[error("more than one upstream is marked forced")]
    MultipleForced,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub kind: UpstreamKind,
    pub base_url: String,
    pub credential_source: String,
    pub models: HashSet<String>,
    pub priority: i32,
    pub enabled: bool,
    pub forced: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub capability_set: HashSet<Capability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone)]
struct UpstreamEntry {
    config: Arc<UpstreamConfig>,
    status: UpstreamStatus,
    consecutive_errors: u32,
    last_error_message: Option<String>,
    last_health_check_at: Option<Instant>,
}

/// Snapshot of one upstream's runtime state, returned to callers that need
/// to inspect health without touching the registry's internals.
#[derive(Debug, Clone)]
pub struct UpstreamRuntime {
    pub config: Arc<UpstreamConfig>,
    pub status: UpstreamStatus,
    pub consecutive_errors: u32,
    pub last_error_message: Option<String>,
}

pub struct ProbeResult {
    pub healthy: bool,
    pub details: Option<String>,
}

/// Implemented by the upstream client so the registry can health-check
/// without depending on the HTTP stack directly.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, upstream: &UpstreamConfig) -> ProbeResult;
}

pub struct ProviderRegistry {
    entries: ArcSwap<Vec<UpstreamEntry>>,
    prober: Arc<dyn HealthProbe>,
    health_interval: Duration,
    probe_timeout: Duration,
    shutdown: Arc<Notify>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderRegistry {
    /// Validates invariants (unique names, at most one forced upstream),
    /// instantiates one runtime per enabled config, and starts the
    /// background health loop.
    pub fn init(
        configs: Vec<UpstreamConfig>,
        prober: Arc<dyn HealthProbe>,
        health_interval: Duration,
        probe_timeout: Duration,
    ) -> Result<Arc<Self>, RegistryError> {
        let mut seen = HashSet::new();
        let mut forced_count = 0;
        for config in &configs {
            if !seen.insert(config.name.clone()) {
                return Err(RegistryError::DuplicateName(config.name.clone()));
            }
            if config.forced {
                forced_count += 1;
            }
        }
        if forced_count > 1 {
            return Err(RegistryError::MultipleForced);
        }

        let entries: Vec<UpstreamEntry> = configs
            .into_iter()
            .filter(|c| c.enabled)
            .map(|config| UpstreamEntry {
                config: Arc::new(config),
                status: UpstreamStatus::Healthy,
                consecutive_errors: 0,
                last_error_message: None,
                last_health_check_at: None,
            })
            .collect();

        let registry = Arc::new(Self {
            entries: ArcSwap::from_pointee(entries),
            prober,
            health_interval,
            probe_timeout,
            shutdown: Arc::new(Notify::new()),
            health_task: Mutex::new(None),
        });

        let task = tokio::spawn(registry.clone().health_loop());
        // Locking a freshly constructed Mutex cannot block; store synchronously.
        *registry.health_task.try_lock().expect("uncontended at init") = Some(task);

        Ok(registry)
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.health_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_scan().await,
                _ = self.shutdown.notified() => {
                    tracing::info!("registry health loop stopping");
                    return;
                }
            }
        }
    }

    async fn run_scan(&self) {
        let snapshot = self.entries.load();
        for entry in snapshot.iter() {
            if entry.status == UpstreamStatus::Disabled {
                continue;
            }
            let probe = tokio::time::timeout(self.probe_timeout, self.prober.probe(&entry.config));
            let outcome = match probe.await {
                Ok(result) => result,
                Err(_) => ProbeResult {
                    healthy: false,
                    details: Some("health probe timed out".to_string()),
                },
            };
            self.record_outcome(&entry.config.name, outcome.healthy, outcome.details);
        }
    }

    /// Ordered candidate list for a (model, capability) query. Returns a
    /// snapshot: later mutations to runtime state are invisible to a caller
    /// still iterating the returned vec.
    pub fn candidates(&self, model: &str, capability: Capability) -> Vec<Arc<UpstreamConfig>> {
        let snapshot = self.entries.load();

        if let Some(forced) = snapshot.iter().find(|e| e.config.forced) {
            return if forced.config.models.contains(model)
                && forced.config.capability_set.contains(&capability)
            {
                vec![forced.config.clone()]
            } else {
                Vec::new()
            };
        }

        let mut matching: Vec<&UpstreamEntry> = snapshot
            .iter()
            .filter(|e| {
                matches!(e.status, UpstreamStatus::Healthy | UpstreamStatus::Degraded)
                    && e.config.models.contains(model)
                    && e.config.capability_set.contains(&capability)
            })
            .collect();
        matching.sort_by_key(|e| e.config.priority);
        matching.into_iter().map(|e| e.config.clone()).collect()
    }

    /// Sorted, de-duplicated model identifiers across every enabled
    /// upstream, for the `GET /v1/models` surface.
    pub fn all_models(&self) -> Vec<String> {
        let snapshot = self.entries.load();
        let mut set = std::collections::BTreeSet::new();
        for entry in snapshot.iter() {
            set.extend(entry.config.models.iter().cloned());
        }
        set.into_iter().collect()
    }

    /// One runtime snapshot per configured upstream, for the `GET /health`
    /// surface's provider status counts.
    pub fn all_runtimes(&self) -> Vec<UpstreamRuntime> {
        self.entries
            .load()
            .iter()
            .map(|e| UpstreamRuntime {
                config: e.config.clone(),
                status: e.status,
                consecutive_errors: e.consecutive_errors,
                last_error_message: e.last_error_message.clone(),
            })
            .collect()
    }

    pub fn runtime(&self, name: &str) -> Option<UpstreamRuntime> {
        self.entries.load().iter().find(|e| e.config.name == name).map(|e| UpstreamRuntime {
            config: e.config.clone(),
            status: e.status,
            consecutive_errors: e.consecutive_errors,
            last_error_message: e.last_error_message.clone(),
        })
    }

    /// Success decrements `consecutive_errors` by one, recovering to
    /// Healthy at zero. Failure increments it, moving Healthy to Degraded
    /// and Degraded to Unhealthy; Disabled upstreams never transition
    /// automatically.
    ///
    /// Uses `rcu` (read-copy-update) rather than `load` + `store`: two
    /// concurrent calls for different upstreams must not race each other
    /// into overwriting one snapshot with the other — `rcu` retries the
    /// whole read-modify-write on a concurrent writer instead of silently
    /// dropping one side, the same CAS discipline the breaker's store uses.
    pub fn record_outcome(&self, name: &str, success: bool, error_message: Option<String>) {
        self.entries.rcu(|current| {
            let mut next = current.as_ref().clone();
            if let Some(entry) = next.iter_mut().find(|e| e.config.name == name) {
                if entry.status != UpstreamStatus::Disabled {
                    if success {
                        entry.consecutive_errors = entry.consecutive_errors.saturating_sub(1);
                        if entry.consecutive_errors == 0 {
                            entry.status = UpstreamStatus::Healthy;
                        }
                        entry.last_error_message = None;
                    } else {
                        entry.consecutive_errors += 1;
                        entry.status = entry.status.escalate();
                        entry.last_error_message = error_message.clone();
                    }
                    entry.last_health_check_at = Some(Instant::now());
                }
            }
            Arc::new(next)
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Some(task) = self.health_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

impl UpstreamStatus {
    fn escalate(self) -> Self {
        match self {
            UpstreamStatus::Healthy => UpstreamStatus::Degraded,
            UpstreamStatus::Degraded => UpstreamStatus::Unhealthy,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _upstream: &UpstreamConfig) -> ProbeResult {
            ProbeResult {
                healthy: true,
                details: None,
            }
        }
    }

    fn config(name: &str, priority: i32, forced: bool) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            kind: UpstreamKind::OpenAi,
            base_url: "https://example.invalid".to_string(),
            credential_source: "KEY".to_string(),
            models: HashSet::from(["gpt-test".to_string()]),
            priority,
            enabled: true,
            forced,
            timeout_ms: 1_000,
            max_retries: 2,
            capability_set: HashSet::from([Capability::ChatCompletion]),
        }
    }

    fn registry(configs: Vec<UpstreamConfig>) -> Arc<ProviderRegistry> {
        ProviderRegistry::init(
            configs,
            Arc::new(AlwaysHealthy),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let result = ProviderRegistry::init(
            vec![config("a", 0, false), config("a", 1, false)],
            Arc::new(AlwaysHealthy),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn rejects_multiple_forced() {
        let result = ProviderRegistry::init(
            vec![config("a", 0, true), config("b", 1, true)],
            Arc::new(AlwaysHealthy),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(RegistryError::MultipleForced)));
    }

    #[tokio::test]
    async fn candidates_sorted_by_priority() {
        let reg = registry(vec![config("low", 5, false), config("high", 1, false)]);
        let names: Vec<String> = reg
            .candidates("gpt-test", Capability::ChatCompletion)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        reg.shutdown().await;
        assert_eq!(names, vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn forced_upstream_bypasses_priority_and_health() {
        let reg = registry(vec![config("forced", 9, true), config("cheap", 0, false)]);
        let names: Vec<String> = reg
            .candidates("gpt-test", Capability::ChatCompletion)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        reg.shutdown().await;
        assert_eq!(names, vec!["forced".to_string()]);
    }

    #[tokio::test]
    async fn forced_upstream_without_capability_yields_empty() {
        let reg = registry(vec![config("forced", 9, true)]);
        let candidates = reg.candidates("gpt-test", Capability::Embeddings);
        reg.shutdown().await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn failures_escalate_then_recover() {
        let reg = registry(vec![config("a", 0, false)]);
        reg.record_outcome("a", false, Some("boom".to_string()));
        assert_eq!(reg.runtime("a").unwrap().status, UpstreamStatus::Degraded);
        reg.record_outcome("a", false, Some("boom again".to_string()));
        assert_eq!(reg.runtime("a").unwrap().status, UpstreamStatus::Unhealthy);
        reg.record_outcome("a", true, None);
        reg.record_outcome("a", true, None);
        assert_eq!(reg.runtime("a").unwrap().status, UpstreamStatus::Healthy);
        reg.shutdown().await;
    }
}
