//! Retry strategy selector (C3): given a classified error and an attempt
//! index, decide whether to retry and how long to wait. Three strategies
//! are provided — `ExponentialBackoff`, `ImmediateRetry`, `Adaptive` — each
//! grounded in a matching strategy from the system this gateway replaces.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use aigateway_common::ErrorClass;
use rand::Rng;

const RING_CAPACITY: usize = 100;
const MAX_IMMEDIATE_RETRIES: u32 = 2;
const IMMEDIATE_DELAYS_MS: [u64; 3] = [50, 100, 200];
const ADAPTATION_WINDOW: usize = 15;
const K_CONNECTION_MAX_ATTEMPTS: u32 = 2;

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "timeout",
    "network is unreachable",
    "temporary failure",
    "service temporarily unavailable",
    "gateway timeout",
];

fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    let jitter_range = delay.as_secs_f64() * jitter_factor;
    let delta = rand::rng().random::<f64>() * 2.0 * jitter_range - jitter_range;
    Duration::from_secs_f64((delay.as_secs_f64() + delta).max(0.0))
}

fn error_type_weight(error: &ErrorClass) -> f64 {
    match error {
        ErrorClass::RateLimited { .. } => 1.2,
        ErrorClass::Connection => 0.8,
        ErrorClass::Timeout => 0.9,
        ErrorClass::ServerError => 1.0,
        ErrorClass::Unknown => 0.7,
        _ => 1.0,
    }
}

/// Tuning knobs resolvable at strategy / error-class / per-upstream /
/// global scope, in that order of precedence.
#[derive(Debug, Clone, Copy)]
pub struct RetryParams {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryParamsOverride {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<bool>,
    pub jitter_factor: Option<f64>,
}

impl RetryParams {
    fn apply(&mut self, over: &RetryParamsOverride) {
        if let Some(v) = over.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = over.base_delay {
            self.base_delay = v;
        }
        if let Some(v) = over.max_delay {
            self.max_delay = v;
        }
        if let Some(v) = over.backoff_factor {
            self.backoff_factor = v;
        }
        if let Some(v) = over.jitter {
            self.jitter = v;
        }
        if let Some(v) = over.jitter_factor {
            self.jitter_factor = v;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    pub global: RetryParams,
    pub per_upstream: HashMap<String, RetryParamsOverride>,
    pub per_error_class: HashMap<&'static str, RetryParamsOverride>,
}

impl RetryConfig {
    pub fn effective(&self, upstream: &str, error: Option<&ErrorClass>) -> RetryParams {
        let mut params = self.global;
        if let Some(over) = self.per_upstream.get(upstream) {
            params.apply(over);
        }
        if let Some(class) = error {
            if let Some(over) = self.per_error_class.get(class.name()) {
                params.apply(over);
            }
        }
        params
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    /// `None` marks a success; `Some(name)` the `ErrorClass::name()` of a failure.
    error_class: Option<&'static str>,
}

/// Bounded per-upstream record of recent attempts, feeding the `Adaptive`
/// strategy's success-rate and pattern-confidence estimates.
#[derive(Debug, Clone, Default)]
pub struct RetryHistory {
    entries: VecDeque<HistoryEntry>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    immediate_retry_count: u32,
}

impl RetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.immediate_retry_count = 0;
        self.push(HistoryEntry { error_class: None });
    }

    pub fn record_failure(&mut self, error: &ErrorClass) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.push(HistoryEntry {
            error_class: Some(error.name()),
        });
    }

    fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Fraction of the last `window` attempts that succeeded; 1.0 with no history.
    pub fn success_rate(&self, window: usize) -> f64 {
        let recent: Vec<&HistoryEntry> = self.entries.iter().rev().take(window).collect();
        if recent.is_empty() {
            return 1.0;
        }
        let successes = recent.iter().filter(|e| e.error_class.is_none()).count();
        successes as f64 / recent.len() as f64
    }

    fn weighted_success_rate(&self, error: &ErrorClass, window: usize, weight: f64) -> f64 {
        let recent: Vec<&HistoryEntry> = self.entries.iter().rev().take(window).collect();
        if recent.is_empty() {
            return 1.0;
        }
        let total = recent.len() as f64;
        let class_name = error.name();
        let class_count = recent
            .iter()
            .filter(|e| e.error_class == Some(class_name))
            .count() as f64;
        let success_count = recent.iter().filter(|e| e.error_class.is_none()).count() as f64;
        (success_count / total) * (1.0 + weight * (class_count / total))
    }

    fn pattern_confidence(&self, error: &ErrorClass) -> f64 {
        if self.entries.len() < 5 {
            return 0.5;
        }
        let recent: Vec<&HistoryEntry> = self.entries.iter().rev().take(10).collect();
        let class_name = error.name();
        let count = recent
            .iter()
            .filter(|e| e.error_class == Some(class_name))
            .count();
        if count >= 3 {
            (0.5 + count as f64 / 10.0).min(0.9)
        } else {
            0.5
        }
    }
}

pub trait RetryStrategy: Send + Sync {
    fn should_retry(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> bool;

    fn compute_delay(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> Duration;
}

/// Rate-limit-optimized exponential backoff with success-rate modulation.
pub struct ExponentialBackoff;

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        _message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> bool {
        match error {
            ErrorClass::RateLimited { .. } => attempt < params.max_attempts,
            ErrorClass::Connection | ErrorClass::Timeout => {
                attempt < params.max_attempts.min(K_CONNECTION_MAX_ATTEMPTS)
            }
            ErrorClass::Authentication | ErrorClass::Authorization | ErrorClass::ClientError => {
                false
            }
            ErrorClass::ServerError => {
                if history.consecutive_failures > 3 {
                    attempt < params.max_attempts.min(1)
                } else {
                    attempt < params.max_attempts
                }
            }
            _ => false,
        }
    }

    fn compute_delay(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        _message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> Duration {
        let base_delay = match error {
            ErrorClass::RateLimited { retry_after } => retry_after.unwrap_or_else(|| {
                params
                    .base_delay
                    .mul_f64(2.0)
                    .max(Duration::from_secs(5))
            }),
            _ => params.base_delay,
        };

        let exponent = attempt.min(10);
        let mut delay = base_delay.mul_f64(params.backoff_factor.powi(exponent as i32));

        let success_rate = history.success_rate(20);
        if success_rate < 0.3 {
            delay = delay.mul_f64(2.5);
        } else if success_rate < 0.5 {
            delay = delay.mul_f64(1.8);
        } else if success_rate > 0.8 {
            delay = delay.mul_f64(0.6);
        }

        if matches!(error, ErrorClass::RateLimited { .. }) && history.consecutive_failures > 2 {
            delay = delay.mul_f64(1.3);
        }

        if params.jitter {
            delay = apply_jitter(delay, params.jitter_factor);
        }

        if matches!(error, ErrorClass::RateLimited { .. }) {
            delay = delay.max(Duration::from_secs(1));
        }

        delay.min(params.max_delay)
    }
}

/// Fast-path for obviously transient errors; falls back to exponential
/// behavior once its immediate-retry budget is spent.
pub struct ImmediateRetry;

impl ImmediateRetry {
    fn immediate_eligible(error: &ErrorClass, message: &str) -> bool {
        matches!(error, ErrorClass::Timeout | ErrorClass::Connection)
            || (matches!(error, ErrorClass::ServerError | ErrorClass::Unknown)
                && is_transient(message))
    }
}

impl RetryStrategy for ImmediateRetry {
    fn should_retry(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> bool {
        match error {
            ErrorClass::Authentication | ErrorClass::Authorization | ErrorClass::ClientError => {
                false
            }
            ErrorClass::ServerError => {
                if is_transient(message) && history.immediate_retry_count < MAX_IMMEDIATE_RETRIES {
                    history.immediate_retry_count += 1;
                    true
                } else {
                    attempt < params.max_attempts
                }
            }
            ErrorClass::Timeout | ErrorClass::Connection | ErrorClass::Unknown => {
                if Self::immediate_eligible(error, message)
                    && history.immediate_retry_count < MAX_IMMEDIATE_RETRIES
                {
                    history.immediate_retry_count += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn compute_delay(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> Duration {
        let on_immediate_path = history.immediate_retry_count >= 1
            && history.immediate_retry_count <= MAX_IMMEDIATE_RETRIES
            && Self::immediate_eligible(error, message);

        if on_immediate_path {
            let index = ((history.immediate_retry_count - 1) as usize)
                .min(IMMEDIATE_DELAYS_MS.len() - 1);
            Duration::from_millis(IMMEDIATE_DELAYS_MS[index])
        } else {
            history.immediate_retry_count = 0;
            let mut delay = params.base_delay.mul_f64(params.backoff_factor.powi(attempt as i32));
            if history.success_rate(20) < 0.5 {
                delay = delay.mul_f64(1.2);
            }
            if params.jitter {
                delay = apply_jitter(delay, params.jitter_factor);
            }
            delay.min(params.max_delay)
        }
    }
}

/// Learns from recent success/failure patterns; thresholds tighten as
/// confidence in the observed pattern drops.
pub struct Adaptive;

impl Adaptive {
    fn adapt_max_attempts(base: u32, success_rate: f64, confidence: f64) -> u32 {
        if success_rate > 0.8 && confidence > 0.7 {
            (base + 2).min(6)
        } else if success_rate > 0.6 && confidence > 0.6 {
            (base + 1).min(5)
        } else if success_rate < 0.3 || confidence < 0.4 {
            base.saturating_sub(1).max(1)
        } else {
            base
        }
    }
}

impl RetryStrategy for Adaptive {
    fn should_retry(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        _message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> bool {
        if matches!(
            error,
            ErrorClass::Authentication | ErrorClass::Authorization | ErrorClass::ClientError
        ) {
            return false;
        }

        let weight = error_type_weight(error);
        let weighted_rate = history.weighted_success_rate(error, ADAPTATION_WINDOW, weight);
        let confidence = history.pattern_confidence(error);
        let success_threshold = if confidence > 0.7 { 0.4 } else { 0.6 };
        let conservative_threshold = if confidence > 0.7 { 0.6 } else { 0.7 };

        match error {
            ErrorClass::RateLimited { .. } => {
                let max_attempts =
                    Self::adapt_max_attempts(params.max_attempts, weighted_rate, confidence);
                attempt < max_attempts
            }
            ErrorClass::Connection | ErrorClass::Timeout => {
                weighted_rate > success_threshold && attempt < params.max_attempts.min(4)
            }
            ErrorClass::ServerError => {
                weighted_rate > conservative_threshold && attempt < params.max_attempts.min(3)
            }
            ErrorClass::Unknown => {
                weighted_rate > conservative_threshold && attempt < params.max_attempts.min(2)
            }
            _ => false,
        }
    }

    fn compute_delay(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        _message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> Duration {
        let weight = error_type_weight(error);
        let weighted_rate = history.weighted_success_rate(error, ADAPTATION_WINDOW, weight);
        let confidence = history.pattern_confidence(error);

        let base_delay = match error {
            ErrorClass::RateLimited { .. } => {
                params.base_delay.mul_f64(2.0).max(Duration::from_secs(3))
            }
            ErrorClass::Connection | ErrorClass::Timeout => params.base_delay.mul_f64(0.5),
            ErrorClass::ServerError => params.base_delay.mul_f64(1.2),
            _ => params.base_delay,
        };

        let exponent = attempt.min(8);
        let mut delay = base_delay.mul_f64(params.backoff_factor.powi(exponent as i32));

        if weighted_rate < 0.3 {
            delay = delay.mul_f64(2.5);
        } else if weighted_rate < 0.5 {
            delay = delay.mul_f64(1.8);
        } else if weighted_rate > 0.8 && confidence > 0.7 {
            delay = delay.mul_f64(0.6);
        }

        if history.consecutive_failures > 2 {
            delay = delay.mul_f64(1.2 + confidence * 0.3);
        }

        if params.jitter {
            let mut jitter_factor = params.jitter_factor;
            if confidence > 0.8 {
                jitter_factor *= 0.7;
            }
            delay = apply_jitter(delay, jitter_factor);
        }

        delay.min(params.max_delay)
    }
}

impl RetryStrategy for Box<dyn RetryStrategy> {
    fn should_retry(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> bool {
        (**self).should_retry(history, error, message, attempt, params)
    }

    fn compute_delay(
        &self,
        history: &mut RetryHistory,
        error: &ErrorClass,
        message: &str,
        attempt: u32,
        params: &RetryParams,
    ) -> Duration {
        (**self).compute_delay(history, error, message, attempt, params)
    }
}

/// Ties a strategy, its resolved config, and one upstream's history
/// together into the `execute(work)` loop from SPEC_FULL.md §4.3.
pub struct RetryExecutor<'a, S: RetryStrategy> {
    pub strategy: S,
    pub config: &'a RetryConfig,
    pub upstream: String,
}

impl<'a, S: RetryStrategy> RetryExecutor<'a, S> {
    pub fn new(strategy: S, config: &'a RetryConfig, upstream: impl Into<String>) -> Self {
        Self {
            strategy,
            config,
            upstream: upstream.into(),
        }
    }

    pub async fn execute<F, Fut, T>(
        &self,
        history: &mut RetryHistory,
        mut work: F,
    ) -> Result<T, (ErrorClass, String)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, (ErrorClass, String)>>,
    {
        let max_attempts = self.config.effective(&self.upstream, None).max_attempts;
        let mut last_err = None;

        for attempt in 0..=max_attempts {
            match work(attempt).await {
                Ok(value) => {
                    history.record_success();
                    return Ok(value);
                }
                Err((class, message)) => {
                    let params = self.config.effective(&self.upstream, Some(&class));
                    if !self
                        .strategy
                        .should_retry(history, &class, &message, attempt, &params)
                    {
                        return Err((class, message));
                    }
                    let delay = self
                        .strategy
                        .compute_delay(history, &class, &message, attempt, &params);
                    history.record_failure(&class);
                    last_err = Some((class, message));
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_err.expect("loop runs at least once since max_attempts + 1 >= 1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RetryParams {
        RetryParams {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter: false,
            jitter_factor: 0.1,
        }
    }

    #[test]
    fn exponential_never_retries_auth_errors() {
        let strategy = ExponentialBackoff;
        let mut history = RetryHistory::new();
        assert!(!strategy.should_retry(
            &mut history,
            &ErrorClass::Authentication,
            "denied",
            0,
            &params()
        ));
    }

    #[test]
    fn exponential_retries_rate_limited_up_to_max_attempts() {
        let strategy = ExponentialBackoff;
        let mut history = RetryHistory::new();
        let rl = ErrorClass::RateLimited { retry_after: None };
        assert!(strategy.should_retry(&mut history, &rl, "slow down", 2, &params()));
        assert!(!strategy.should_retry(&mut history, &rl, "slow down", 3, &params()));
    }

    #[test]
    fn exponential_uses_retry_after_as_base_delay() {
        let strategy = ExponentialBackoff;
        let mut history = RetryHistory::new();
        let rl = ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        let delay = strategy.compute_delay(&mut history, &rl, "slow down", 0, &params());
        assert!(delay >= Duration::from_secs(1));
    }

    #[test]
    fn immediate_retry_uses_progressive_delays() {
        let strategy = ImmediateRetry;
        let mut history = RetryHistory::new();
        assert!(strategy.should_retry(
            &mut history,
            &ErrorClass::Connection,
            "connection reset by peer",
            0,
            &params()
        ));
        let delay = strategy.compute_delay(
            &mut history,
            &ErrorClass::Connection,
            "connection reset by peer",
            0,
            &params(),
        );
        assert_eq!(delay, Duration::from_millis(50));
    }

    #[test]
    fn immediate_retry_falls_back_after_budget_spent() {
        let strategy = ImmediateRetry;
        let mut history = RetryHistory::new();
        for _ in 0..MAX_IMMEDIATE_RETRIES {
            strategy.should_retry(
                &mut history,
                &ErrorClass::Connection,
                "connection reset",
                0,
                &params(),
            );
        }
        assert!(!strategy.should_retry(
            &mut history,
            &ErrorClass::Connection,
            "connection reset",
            0,
            &params()
        ));
    }

    #[test]
    fn adaptive_never_retries_client_errors() {
        let strategy = Adaptive;
        let mut history = RetryHistory::new();
        assert!(!strategy.should_retry(
            &mut history,
            &ErrorClass::ClientError,
            "bad request",
            0,
            &params()
        ));
    }

    #[tokio::test]
    async fn executor_max_attempts_zero_means_one_attempt() {
        let config = RetryConfig {
            global: RetryParams {
                max_attempts: 0,
                ..params()
            },
            ..Default::default()
        };
        let executor = RetryExecutor::new(ExponentialBackoff, &config, "upstream-a");
        let mut history = RetryHistory::new();
        let mut calls = 0;
        let result: Result<(), (ErrorClass, String)> = executor
            .execute(&mut history, |_attempt| {
                calls += 1;
                async { Err((ErrorClass::ServerError, "boom".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn executor_records_success_and_returns_value() {
        let config = RetryConfig::default();
        let executor = RetryExecutor::new(ExponentialBackoff, &config, "upstream-a");
        let mut history = RetryHistory::new();
        let result = executor
            .execute(&mut history, |_attempt| async { Ok::<_, (ErrorClass, String)>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(history.success_count, 1);
    }
}
