//! Upstream client (C1): issues one HTTP call to one upstream, enforces the
//! per-call deadline, and classifies whatever comes back into the shared
//! `ErrorClass` taxonomy. Connection pooling is scoped per upstream name and
//! long-lived, mirroring the per-proxy client cache the gateway's own
//! upstream client keeps — swapped here from a TLS-fingerprinting client
//! onto plain `reqwest`, since this gateway fronts one OpenAI-shaped wire
//! format rather than impersonating a browser for vendor OAuth flows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aigateway_common::ErrorClass;
use aigateway_registry::{HealthProbe, ProbeResult, UpstreamConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub stream: bool,
}

pub enum ResponseBody {
    Buffered(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

/// Receives the per-call outcome so the router's metrics sink can record
/// it without the client depending on the metrics crate directly.
pub trait RequestObserver: Send + Sync {
    fn observe(
        &self,
        upstream: &str,
        success: bool,
        elapsed: Duration,
        error_class: Option<&ErrorClass>,
        total_tokens: Option<u64>,
    );
}

pub struct NoopObserver;

impl RequestObserver for NoopObserver {
    fn observe(&self, _: &str, _: bool, _: Duration, _: Option<&ErrorClass>, _: Option<u64>) {}
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn call(
        &self,
        upstream: &UpstreamConfig,
        envelope: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<UpstreamResponse, (ErrorClass, String)>;
}

pub struct ReqwestUpstreamClient {
    connect_timeout: Duration,
    clients: Mutex<HashMap<String, reqwest::Client>>,
    observer: Arc<dyn RequestObserver>,
}

impl ReqwestUpstreamClient {
    pub fn new(observer: Arc<dyn RequestObserver>) -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            clients: Mutex::new(HashMap::new()),
            observer,
        }
    }

    async fn client_for(&self, upstream: &UpstreamConfig) -> reqwest::Client {
        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&upstream.name) {
            return client.clone();
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(Duration::from_millis(upstream.timeout_ms))
            .build()
            .expect("reqwest client builder never fails with this configuration");
        guard.insert(upstream.name.clone(), client.clone());
        client
    }

    fn credential(&self, upstream: &UpstreamConfig) -> Result<String, (ErrorClass, String)> {
        std::env::var(&upstream.credential_source).map_err(|_| {
            (
                ErrorClass::Authentication,
                format!(
                    "credential env var {} is not set for upstream {}",
                    upstream.credential_source, upstream.name
                ),
            )
        })
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn call(
        &self,
        upstream: &UpstreamConfig,
        envelope: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<UpstreamResponse, (ErrorClass, String)> {
        let started = Instant::now();
        let span = tracing::info_span!("upstream_call", upstream = %upstream.name);
        let _guard = span.enter();

        let credential = self.credential(upstream)?;
        let client = self.client_for(upstream).await;
        let url = format!(
            "{}{}",
            upstream.base_url.trim_end_matches('/'),
            envelope.path
        );

        let method = match envelope.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = client.request(method, &url);
        for (name, value) in &envelope.headers {
            builder = builder.header(name, value);
        }
        let (header_name, header_value) = credential_header(upstream.kind, &credential);
        builder = builder.header(header_name, header_value);
        if let Some(body) = envelope.body.clone() {
            builder = builder.body(body);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = match tokio::time::timeout(remaining, builder.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                let class = classify_reqwest_error(&err);
                tracing::warn!(upstream = %upstream.name, error = %err, class = %class, "upstream_call_failed");
                self.observer
                    .observe(&upstream.name, false, started.elapsed(), Some(&class), None);
                return Err((class, err.to_string()));
            }
            Err(_) => {
                tracing::warn!(upstream = %upstream.name, "upstream_call_deadline_exceeded");
                self.observer.observe(
                    &upstream.name,
                    false,
                    started.elapsed(),
                    Some(&ErrorClass::Timeout),
                    None,
                );
                return Err((ErrorClass::Timeout, "request deadline exceeded".to_string()));
            }
        };

        let status = response.status().as_u16();
        let headers = headers_to_vec(response.headers());
        let retry_after = retry_after_from_headers(response.headers());

        if envelope.stream && (200..300).contains(&status) {
            let idle_timeout = Duration::from_millis(upstream.timeout_ms);
            let (tx, rx) = mpsc::channel::<Bytes>(16);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                loop {
                    let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                    let item = match next {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    let Some(item) = item else {
                        break;
                    };
                    let Ok(chunk) = item else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            tracing::debug!(upstream = %upstream.name, "upstream_call_streaming");
            self.observer
                .observe(&upstream.name, true, started.elapsed(), None, None);
            return Ok(UpstreamResponse {
                status,
                headers,
                body: ResponseBody::Stream(rx),
            });
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                let class = classify_reqwest_error(&err);
                tracing::warn!(upstream = %upstream.name, error = %err, "upstream_body_read_failed");
                self.observer
                    .observe(&upstream.name, false, started.elapsed(), Some(&class), None);
                return Err((class, err.to_string()));
            }
        };

        if let Some(class) = classify_status(status, retry_after, &body) {
            tracing::warn!(upstream = %upstream.name, status, class = %class, "upstream_call_error_status");
            self.observer
                .observe(&upstream.name, false, started.elapsed(), Some(&class), None);
            return Err((class, format!("upstream returned status {status}")));
        }

        let total_tokens = extract_total_tokens(&body);
        tracing::debug!(upstream = %upstream.name, status, "upstream_call_succeeded");
        self.observer
            .observe(&upstream.name, true, started.elapsed(), None, total_tokens);

        Ok(UpstreamResponse {
            status,
            headers,
            body: ResponseBody::Buffered(body),
        })
    }
}

#[async_trait]
impl HealthProbe for ReqwestUpstreamClient {
    async fn probe(&self, upstream: &UpstreamConfig) -> ProbeResult {
        let Ok(credential) = self.credential(upstream) else {
            return ProbeResult {
                healthy: false,
                details: Some("missing credential".to_string()),
            };
        };
        let client = self.client_for(upstream).await;
        let url = format!("{}/models", upstream.base_url.trim_end_matches('/'));
        let (header_name, header_value) = credential_header(upstream.kind, &credential);

        match client.get(&url).header(header_name, header_value).send().await {
            Ok(resp) if resp.status().as_u16() < 500 => ProbeResult {
                healthy: true,
                details: None,
            },
            Ok(resp) => ProbeResult {
                healthy: false,
                details: Some(format!("probe returned status {}", resp.status())),
            },
            Err(err) => ProbeResult {
                healthy: false,
                details: Some(err.to_string()),
            },
        }
    }
}

fn credential_header(kind: aigateway_common::UpstreamKind, value: &str) -> (&'static str, String) {
    match kind {
        aigateway_common::UpstreamKind::Anthropic => ("x-api-key", value.to_string()),
        _ => ("Authorization", format!("Bearer {value}")),
    }
}

fn headers_to_vec(map: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn retry_after_from_headers(map: &reqwest::header::HeaderMap) -> Option<Duration> {
    map.get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        return ErrorClass::Timeout;
    }
    if err.is_connect() {
        return ErrorClass::Connection;
    }
    if err.is_decode() {
        return ErrorClass::Malformed;
    }
    let message = err.to_string().to_ascii_lowercase();
    if message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("broken pipe")
        || message.contains("unexpected eof")
    {
        return ErrorClass::Connection;
    }
    ErrorClass::Unknown
}

fn classify_status(status: u16, retry_after: Option<Duration>, body: &Bytes) -> Option<ErrorClass> {
    if (200..300).contains(&status) {
        return None;
    }

    // Status drives the class first: a 5xx is a ServerError even when the
    // body is an HTML gateway error page, so it still gets retried.
    let status_class = match status {
        401 => ErrorClass::Authentication,
        403 => ErrorClass::Authorization,
        429 => ErrorClass::RateLimited { retry_after },
        400..=499 => ErrorClass::ClientError,
        500..=599 => ErrorClass::ServerError,
        _ => ErrorClass::Unknown,
    };

    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => {
            if matches!(status_class, ErrorClass::ClientError) {
                if let Some(error_type) = value
                    .get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(|t| t.as_str())
                {
                    if error_type == "invalid_request_error" || error_type == "invalid_request" {
                        return Some(ErrorClass::ClientError);
                    }
                }
            }
        }
        // Only a status code we can't otherwise classify falls back to
        // Malformed; a real 4xx/5xx keeps its status-derived class and stays
        // eligible for retry.
        Err(_) if !body.is_empty() && matches!(status_class, ErrorClass::Unknown) => {
            return Some(ErrorClass::Malformed);
        }
        Err(_) => {}
    }

    Some(status_class)
}

fn extract_total_tokens(body: &Bytes) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("usage")?.get("total_tokens")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_uses_api_key_header() {
        let (name, value) = credential_header(aigateway_common::UpstreamKind::Anthropic, "secret");
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "secret");
    }

    #[test]
    fn openai_like_uses_bearer_header() {
        let (name, value) = credential_header(aigateway_common::UpstreamKind::OpenAi, "secret");
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer secret");
    }

    #[test]
    fn classify_status_maps_common_codes() {
        let empty = Bytes::new();
        assert!(matches!(
            classify_status(401, None, &empty),
            Some(ErrorClass::Authentication)
        ));
        assert!(matches!(
            classify_status(429, Some(Duration::from_secs(2)), &empty),
            Some(ErrorClass::RateLimited { .. })
        ));
        assert!(classify_status(200, None, &empty).is_none());
    }

    #[test]
    fn classify_status_keeps_server_error_for_non_json_body() {
        let html = Bytes::from_static(b"<html>502 Bad Gateway</html>");
        assert!(matches!(
            classify_status(502, None, &html),
            Some(ErrorClass::ServerError)
        ));
    }

    #[test]
    fn classify_status_detects_malformed_body_for_unmapped_status() {
        let garbage = Bytes::from_static(b"not json");
        assert!(matches!(
            classify_status(100, None, &garbage),
            Some(ErrorClass::Malformed)
        ));
    }

    #[test]
    fn extract_total_tokens_reads_usage_field() {
        let body = Bytes::from_static(br#"{"usage":{"total_tokens":42}}"#);
        assert_eq!(extract_total_tokens(&body), Some(42));
    }
}
