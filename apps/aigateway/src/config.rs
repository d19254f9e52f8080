//! Ambient config layer (SPEC_FULL.md §3.1, §6). A TOML file is the base
//! layer; CLI flags and `AIGATEWAY_*` environment variables patch
//! individual top-level fields on top of it, mirroring the
//! CLI-over-env-over-file-over-default precedence the gateway's own
//! `GlobalConfigPatch::overlay` uses for its DB-backed config, with the
//! persistent DB layer dropped in favor of a file (SPEC_FULL.md §9 open
//! question (c)).

use std::collections::HashSet;
use std::path::Path;

use aigateway_common::{Capability, UpstreamKind};
use aigateway_registry::UpstreamConfig;
use aigateway_retry::{RetryConfig, RetryParams, RetryParamsOverride};
use aigateway_router::StrategyKind;
use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub upstreams: Vec<UpstreamFileEntry>,
    pub auth: AuthFileConfig,
    pub breaker: BreakerFileConfig,
    pub retry: RetryFileConfig,
    pub health: HealthFileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamFileEntry {
    pub name: String,
    pub kind: UpstreamKind,
    pub base_url: String,
    pub credential_source: String,
    pub models: Vec<String>,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub forced: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub capability_set: Vec<Capability>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl From<UpstreamFileEntry> for UpstreamConfig {
    fn from(entry: UpstreamFileEntry) -> Self {
        UpstreamConfig {
            name: entry.name,
            kind: entry.kind,
            base_url: entry.base_url,
            credential_source: entry.credential_source,
            models: entry.models.into_iter().collect::<HashSet<String>>(),
            priority: entry.priority,
            enabled: entry.enabled,
            forced: entry.forced,
            timeout_ms: entry.timeout_ms,
            max_retries: entry.max_retries,
            capability_set: entry.capability_set.into_iter().collect::<HashSet<Capability>>(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthFileConfig {
    pub header_mode: Option<String>,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerFileConfig {
    pub failure_threshold: u32,
    pub recovery_window_ms: u64,
}

impl Default for BreakerFileConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryFileConfig {
    pub default_strategy: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        let defaults = RetryParams::default();
        Self {
            default_strategy: "exponential".to_string(),
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            jitter_factor: defaults.jitter_factor,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthFileConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

/// CLI/env overrides applied on top of the file config. Only the fields
/// SPEC_FULL.md §6's process entrypoint names are overridable outside the
/// file: host, port, and the inbound API key set.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_keys: Option<Vec<String>>,
}

/// Fully resolved, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upstreams: Vec<UpstreamConfig>,
    pub auth_keys: Vec<String>,
    pub auth_header_mode: String,
    pub breaker: aigateway_breaker::BreakerConfig,
    pub retry: RetryConfig,
    pub default_strategy: StrategyKind,
    pub health_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
}

fn parse_strategy(name: &str) -> StrategyKind {
    match name {
        "immediate" => StrategyKind::Immediate,
        "adaptive" => StrategyKind::Adaptive,
        _ => StrategyKind::Exponential,
    }
}

pub fn load(path: Option<&Path>, patch: ConfigPatch) -> anyhow::Result<AppConfig> {
    let mut file = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<FileConfig>(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    if let Some(host) = patch.host {
        file.host = Some(host);
    }
    if let Some(port) = patch.port {
        file.port = Some(port);
    }
    if let Some(keys) = patch.api_keys {
        file.auth.keys = keys;
    }

    let upstreams: Vec<UpstreamConfig> = file.upstreams.into_iter().map(Into::into).collect();

    let mut per_upstream = std::collections::HashMap::new();
    for upstream in &upstreams {
        per_upstream.insert(
            upstream.name.clone(),
            RetryParamsOverride {
                max_attempts: Some(upstream.max_retries),
                ..Default::default()
            },
        );
    }

    let retry = RetryConfig {
        global: RetryParams {
            max_attempts: file.retry.max_attempts,
            base_delay: std::time::Duration::from_millis(file.retry.base_delay_ms),
            max_delay: std::time::Duration::from_millis(file.retry.max_delay_ms),
            backoff_factor: file.retry.backoff_factor,
            jitter: true,
            jitter_factor: file.retry.jitter_factor,
        },
        per_upstream,
        per_error_class: std::collections::HashMap::new(),
    };

    Ok(AppConfig {
        host: file.host.unwrap_or_else(|| "0.0.0.0".to_string()),
        port: file.port.unwrap_or(8080),
        upstreams,
        auth_keys: file.auth.keys,
        auth_header_mode: file.auth.header_mode.unwrap_or_else(|| "both".to_string()),
        breaker: aigateway_breaker::BreakerConfig {
            failure_threshold: file.breaker.failure_threshold,
            recovery_window: std::time::Duration::from_millis(file.breaker.recovery_window_ms),
        },
        retry,
        default_strategy: parse_strategy(&file.retry.default_strategy),
        health_interval_ms: file.health.interval_ms,
        health_probe_timeout_ms: file.health.probe_timeout_ms,
    })
}
