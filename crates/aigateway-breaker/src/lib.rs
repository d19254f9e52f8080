//! Distributed circuit breaker (C2): a per-upstream CLOSED/OPEN/HALF_OPEN
//! state machine backed by a pluggable key/value store so that multiple
//! gateway instances agree on breaker state.
//!
//! The state machine and its compare-and-swap discipline are modeled on a
//! Redis-backed breaker that uses WATCH/MULTI/EXEC to avoid lost updates
//! under concurrent failure reports. `InMemoryBreakerStore` plays the same
//! role Redis would for a single-instance deployment; a real distributed
//! backend implements `BreakerStore` and is a drop-in replacement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerRecord {
    pub state: BreakerStateKind,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: BreakerStateKind::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Notified when the breaker's backing store is unreachable, so a metrics
/// crate can surface it without `aigateway-breaker` depending on one.
/// Mirrors `aigateway_client::RequestObserver`.
pub trait BreakerObserver: Send + Sync {
    fn backend_unavailable(&self, upstream: &str);
}

struct NoopBreakerObserver;

impl BreakerObserver for NoopBreakerObserver {
    fn backend_unavailable(&self, _upstream: &str) {}
}

#[derive(Debug, thiserror::Error)]
#[error("breaker store unavailable: {0}")]
pub struct StoreError(pub String);

pub enum CasError {
    /// Another writer moved the record between our read and our write.
    Conflict,
    Store(StoreError),
}

/// Atomic read/compare-and-write primitives for breaker state. An
/// implementation over Redis would `WATCH` the key on read and condition
/// the write on an `EXEC` of the watched transaction; the in-memory default
/// below plays the same role with a per-key generation counter.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<(BreakerRecord, u64), StoreError>;
    async fn compare_and_write(
        &self,
        name: &str,
        expected_generation: u64,
        new: BreakerRecord,
    ) -> Result<(), CasError>;
}

#[derive(Default)]
pub struct InMemoryBreakerStore {
    entries: Mutex<HashMap<String, (BreakerRecord, u64)>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn read(&self, name: &str) -> Result<(BreakerRecord, u64), StoreError> {
        let guard = self.entries.lock().await;
        Ok(guard
            .get(name)
            .cloned()
            .unwrap_or_else(|| (BreakerRecord::default(), 0)))
    }

    async fn compare_and_write(
        &self,
        name: &str,
        expected_generation: u64,
        new: BreakerRecord,
    ) -> Result<(), CasError> {
        let mut guard = self.entries.lock().await;
        let current_generation = guard.get(name).map(|(_, gen)| *gen).unwrap_or(0);
        if current_generation != expected_generation {
            return Err(CasError::Conflict);
        }
        guard.insert(name.to_string(), (new, expected_generation + 1));
        Ok(())
    }
}

/// A one-shot token returned by `enter`; must be paired with exactly one
/// `report` call.
#[derive(Debug, Clone)]
pub struct Permit {
    pub upstream: String,
    pub state_at_issue: BreakerStateKind,
}

#[derive(Debug, Clone)]
pub enum EnterOutcome {
    Permit(Permit),
    Reject { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
pub enum ReportOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window: Duration::from_secs(60),
        }
    }
}

pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    config: BreakerConfig,
    observer: Arc<dyn BreakerObserver>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            config,
            observer: Arc::new(NoopBreakerObserver),
        }
    }

    /// Replaces the backend-unavailable observer, e.g. with a metrics sink.
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Attempt to enter the protected region for `name`. Fails closed (i.e.
    /// behaves as CLOSED) if the backing store is unreachable.
    pub async fn enter(&self, name: &str) -> EnterOutcome {
        match self.try_enter(name).await {
            Ok(outcome) => outcome,
            Err(StoreError(message)) => {
                tracing::warn!(
                    upstream = name,
                    error = %message,
                    "breaker_backend_unavailable"
                );
                self.observer.backend_unavailable(name);
                EnterOutcome::Permit(Permit {
                    upstream: name.to_string(),
                    state_at_issue: BreakerStateKind::Closed,
                })
            }
        }
    }

    async fn try_enter(&self, name: &str) -> Result<EnterOutcome, StoreError> {
        loop {
            let (record, generation) = self.store.read(name).await?;
            match record.state {
                BreakerStateKind::Closed => {
                    return Ok(EnterOutcome::Permit(Permit {
                        upstream: name.to_string(),
                        state_at_issue: BreakerStateKind::Closed,
                    }));
                }
                BreakerStateKind::Open => {
                    let opened_at = record.opened_at.unwrap_or_else(Instant::now);
                    let elapsed = opened_at.elapsed();
                    if elapsed < self.config.recovery_window {
                        return Ok(EnterOutcome::Reject {
                            retry_after: self.config.recovery_window - elapsed,
                        });
                    }
                    let transitioned = BreakerRecord {
                        state: BreakerStateKind::HalfOpen,
                        failure_count: 0,
                        opened_at: Some(Instant::now()),
                    };
                    match self
                        .store
                        .compare_and_write(name, generation, transitioned)
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(upstream = name, "breaker half-open, probing");
                            return Ok(EnterOutcome::Permit(Permit {
                                upstream: name.to_string(),
                                state_at_issue: BreakerStateKind::HalfOpen,
                            }));
                        }
                        Err(CasError::Conflict) => continue,
                        Err(CasError::Store(err)) => return Err(err),
                    }
                }
                // The probe slot is already outstanding; every other caller
                // is rejected until `report` resolves it.
                BreakerStateKind::HalfOpen => {
                    return Ok(EnterOutcome::Reject {
                        retry_after: Duration::ZERO,
                    });
                }
            }
        }
    }

    pub async fn report(&self, permit: Permit, outcome: ReportOutcome) {
        let result = match outcome {
            ReportOutcome::Success => self.try_record_success(&permit.upstream).await,
            ReportOutcome::Failure => self.try_record_failure(&permit.upstream).await,
        };
        if let Err(StoreError(message)) = result {
            tracing::warn!(
                upstream = %permit.upstream,
                error = %message,
                "breaker_backend_unavailable"
            );
            self.observer.backend_unavailable(&permit.upstream);
        }
    }

    async fn try_record_success(&self, name: &str) -> Result<(), StoreError> {
        loop {
            let (_, generation) = self.store.read(name).await?;
            match self
                .store
                .compare_and_write(name, generation, BreakerRecord::default())
                .await
            {
                Ok(()) => {
                    tracing::info!(upstream = name, "breaker reset to closed after success");
                    return Ok(());
                }
                Err(CasError::Conflict) => continue,
                Err(CasError::Store(err)) => return Err(err),
            }
        }
    }

    async fn try_record_failure(&self, name: &str) -> Result<(), StoreError> {
        loop {
            let (record, generation) = self.store.read(name).await?;
            let failures = record.failure_count + 1;
            let opens = record.state == BreakerStateKind::HalfOpen
                || failures >= self.config.failure_threshold;
            let new = if opens {
                BreakerRecord {
                    state: BreakerStateKind::Open,
                    failure_count: failures,
                    opened_at: Some(Instant::now()),
                }
            } else {
                BreakerRecord {
                    state: BreakerStateKind::Closed,
                    failure_count: failures,
                    opened_at: None,
                }
            };
            match self.store.compare_and_write(name, generation, new).await {
                Ok(()) => {
                    if opens {
                        tracing::warn!(upstream = name, failures, "breaker opened");
                    }
                    return Ok(());
                }
                Err(CasError::Conflict) => continue,
                Err(CasError::Store(err)) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(InMemoryBreakerStore::new()),
            BreakerConfig {
                failure_threshold: threshold,
                recovery_window: window,
            },
        )
    }

    #[tokio::test]
    async fn closed_allows_entry_and_resets_on_success() {
        let cb = breaker(5, Duration::from_secs(60));
        let permit = match cb.enter("a").await {
            EnterOutcome::Permit(p) => p,
            EnterOutcome::Reject { .. } => panic!("expected permit"),
        };
        assert_eq!(permit.state_at_issue, BreakerStateKind::Closed);
        cb.report(permit, ReportOutcome::Success).await;
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..3 {
            let permit = match cb.enter("a").await {
                EnterOutcome::Permit(p) => p,
                EnterOutcome::Reject { .. } => panic!("expected permit before threshold"),
            };
            cb.report(permit, ReportOutcome::Failure).await;
        }
        match cb.enter("a").await {
            EnterOutcome::Reject { .. } => {}
            EnterOutcome::Permit(_) => panic!("breaker should be open"),
        }
    }

    #[tokio::test]
    async fn half_open_issues_single_probe() {
        let cb = breaker(1, Duration::from_millis(10));
        let permit = match cb.enter("a").await {
            EnterOutcome::Permit(p) => p,
            EnterOutcome::Reject { .. } => panic!("expected permit"),
        };
        cb.report(permit, ReportOutcome::Failure).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe = match cb.enter("a").await {
            EnterOutcome::Permit(p) => p,
            EnterOutcome::Reject { .. } => panic!("expected half-open probe"),
        };
        assert_eq!(probe.state_at_issue, BreakerStateKind::HalfOpen);

        match cb.enter("a").await {
            EnterOutcome::Reject { .. } => {}
            EnterOutcome::Permit(_) => panic!("second concurrent caller must be rejected"),
        }

        cb.report(probe, ReportOutcome::Success).await;
        match cb.enter("a").await {
            EnterOutcome::Permit(p) => assert_eq!(p.state_at_issue, BreakerStateKind::Closed),
            EnterOutcome::Reject { .. } => panic!("breaker should be closed after probe success"),
        }
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let cb = Arc::new(breaker(1_000_000, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                let permit = match cb.enter("a").await {
                    EnterOutcome::Permit(p) => p,
                    EnterOutcome::Reject { .. } => panic!("threshold unreached"),
                };
                cb.report(permit, ReportOutcome::Failure).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let (record, _) = cb.store.read("a").await.unwrap();
        assert!(record.failure_count >= 32);
    }
}
