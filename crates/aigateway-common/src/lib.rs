//! Shared types for the gateway: the error taxonomy, request/operation
//! vocabulary, and attempt bookkeeping used by every other crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of error classes used everywhere for routing decisions.
///
/// This is the one taxonomy every component classifies into; retry,
/// breaker, and HTTP-status mapping all switch on this enum rather than
/// inspecting raw upstream errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorClass {
    RateLimited { retry_after: Option<Duration> },
    Timeout,
    Connection,
    ServerError,
    Authentication,
    Authorization,
    ClientError,
    NotSupported,
    Malformed,
    Unknown,
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited { .. } => "rate_limited",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Connection => "connection",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Authorization => "authorization",
            ErrorClass::ClientError => "client_error",
            ErrorClass::NotSupported => "not_supported",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operations a caller may request. Mirrors the OpenAI-compatible surface
/// in SPEC_FULL.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    ChatCompletion,
    TextCompletion,
    Embeddings,
    ImageGeneration,
}

/// Capabilities an upstream may advertise. A superset of `Operation`
/// because some capabilities (Streaming, ModelDiscovery, ToolCalling) are
/// cross-cutting rather than one request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ChatCompletion,
    TextCompletion,
    Embeddings,
    Streaming,
    ModelDiscovery,
    ImageGeneration,
    VideoGeneration,
    ToolCalling,
}

impl Operation {
    /// The capability an upstream must advertise to serve this operation.
    pub fn required_capability(self) -> Capability {
        match self {
            Operation::ChatCompletion => Capability::ChatCompletion,
            Operation::TextCompletion => Capability::TextCompletion,
            Operation::Embeddings => Capability::Embeddings,
            Operation::ImageGeneration => Capability::ImageGeneration,
        }
    }
}

/// Closed set of known upstream vendor kinds, used for credential-header
/// selection, not for wire-format translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamKind {
    OpenAi,
    Azure,
    Anthropic,
    Cohere,
    OpenRouter,
    Perplexity,
    Generic,
}

/// Unique identifier for one inbound request, used in provenance and in
/// the structured log/tracing span for the request's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId(pub uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one wire call, as observed by the retry loop and the
/// router's bookkeeping.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success,
    NotSupported,
    Failure(ErrorClass, String),
}

/// One row of the per-request attempt trail, surfaced in
/// `AllUpstreamsUnavailable.details` and in the `attempt` metric.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub upstream_name: String,
    pub attempt_index: u32,
    pub elapsed: Duration,
    pub error_class: Option<String>,
    pub message: Option<String>,
}

/// The composite error surface returned by the router (C6) to the HTTP
/// boundary. Variants map 1:1 onto the status codes in SPEC_FULL.md §6.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Upstream(#[from] UpstreamError),
    #[error("model not supported: {model}")]
    ModelNotSupported { model: String },
    #[error("operation not supported by any candidate upstream")]
    OperationNotSupported,
    #[error("all upstreams unavailable")]
    AllUpstreamsUnavailable { attempts: Vec<AttemptSummary> },
    #[error("request deadline exceeded")]
    Timeout,
}

/// A single-upstream failure classified into the closed taxonomy, already
/// short-circuited (no retry, no fallback) per SPEC_FULL.md §7.
#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream error ({class}): {message}")]
pub struct UpstreamError {
    pub class: ErrorClass,
    pub message: String,
}

impl GatewayError {
    /// HTTP status code per SPEC_FULL.md §6's error status table.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Upstream(err) => match err.class {
                ErrorClass::ClientError => 400,
                ErrorClass::Authentication => 401,
                ErrorClass::Authorization => 403,
                ErrorClass::RateLimited { .. } => 429,
                _ => 502,
            },
            GatewayError::ModelNotSupported { .. } => 404,
            GatewayError::OperationNotSupported => 501,
            GatewayError::AllUpstreamsUnavailable { .. } => 503,
            GatewayError::Timeout => 504,
        }
    }

    /// The `type` field of the JSON error envelope in SPEC_FULL.md §6.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Upstream(err) => err.class.name(),
            GatewayError::ModelNotSupported { .. } => "model_not_supported",
            GatewayError::OperationNotSupported => "operation_not_supported",
            GatewayError::AllUpstreamsUnavailable { .. } => "all_upstreams_unavailable",
            GatewayError::Timeout => "timeout",
        }
    }
}
