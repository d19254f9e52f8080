//! axum HTTP surface (SPEC_FULL.md §6): adapts the OpenAI-compatible
//! routes onto `GatewayRouter::route`, enforces the constant-time auth
//! boundary, and renders the JSON error envelope. Streaming responses pass
//! upstream byte chunks through unchanged rather than re-parsing them into
//! discrete SSE events — the gateway never reshapes SSE framing across
//! vendors the way the teacher's multi-vendor parser does, so there is
//! nothing to reconstruct.

use std::sync::Arc;

use aigateway_common::{GatewayError, Operation, RequestId};
use aigateway_metrics::Metrics;
use aigateway_registry::{ProviderRegistry, UpstreamStatus};
use axum::body::{Body, Bytes as AxumBytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::auth::{extract_api_key, AuthKeys};
use crate::dispatch::{GatewayRouter, Inbound, RouteOutcome};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub registry: Arc<ProviderRegistry>,
    pub metrics: Arc<Metrics>,
    pub auth: Arc<AuthKeys>,
}

pub fn build_app(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(authenticated)
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

async fn auth_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.auth.is_empty() {
        return next.run(request).await;
    }
    match extract_api_key(request.headers()) {
        Some(key) if state.auth.verify(&key) => next.run(request).await,
        _ => {
            state.metrics.record_inbound_request(401);
            error_envelope(StatusCode::UNAUTHORIZED, "authentication", "missing or invalid API key", None)
        }
    }
}

async fn chat_completions(state: State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    dispatch(state, headers, body, Operation::ChatCompletion, "/v1/chat/completions").await
}

async fn completions(state: State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    dispatch(state, headers, body, Operation::TextCompletion, "/v1/completions").await
}

async fn embeddings(state: State<AppState>, headers: HeaderMap, body: AxumBytes) -> Response {
    dispatch(state, headers, body, Operation::Embeddings, "/v1/embeddings").await
}

async fn models(State(state): State<AppState>) -> Response {
    let models = state.registry.all_models();
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| json!({"id": id, "object": "model"}))
        .collect();
    state.metrics.record_inbound_request(200);
    (StatusCode::OK, Json(json!({"object": "list", "data": data}))).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let runtimes = state.registry.all_runtimes();
    let mut healthy = 0u32;
    let mut degraded = 0u32;
    let mut unhealthy = 0u32;
    let mut disabled = 0u32;
    for runtime in &runtimes {
        match runtime.status {
            UpstreamStatus::Healthy => healthy += 1,
            UpstreamStatus::Degraded => degraded += 1,
            UpstreamStatus::Unhealthy => unhealthy += 1,
            UpstreamStatus::Disabled => disabled += 1,
        }
    }
    let total = runtimes.len() as u32;
    let status = if total == 0 || healthy + degraded == total {
        "ok"
    } else if healthy > 0 {
        "degraded"
    } else {
        "unavailable"
    };
    let health_score = if total == 0 { 0.0 } else { (healthy as f64 + 0.5 * degraded as f64) / total as f64 };

    state.metrics.record_inbound_request(200);
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "health_score": health_score,
            "providers": {
                "total": total,
                "healthy": healthy,
                "degraded": degraded,
                "unhealthy": unhealthy,
                "disabled": disabled,
            },
            "timestamp": now_rfc3339(),
        })),
    )
        .into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: AxumBytes,
    operation: Operation,
    path: &'static str,
) -> Response {
    let parsed: Option<Value> = serde_json::from_slice(&body).ok();
    let model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let stream = parsed
        .as_ref()
        .and_then(|v| v.get("stream"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let inbound = Inbound {
        operation,
        model,
        stream,
        path: path.to_string(),
        forward_headers: vec![("content-type".to_string(), content_type)],
        body: Bytes::from(body.to_vec()),
    };

    match state.router.route(inbound).await {
        Ok(RouteOutcome::Buffered { status, body, provenance, .. }) => {
            state.metrics.record_inbound_request(status);
            let body = attach_provenance(&body, &provenance);
            (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), body).into_response()
        }
        Ok(RouteOutcome::Stream { status, receiver, .. }) => {
            state.metrics.record_inbound_request(status);
            let stream = ReceiverStream::new(receiver).map(Ok::<Bytes, std::io::Error>);
            Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(stream))
                .expect("static status/headers always build a valid response")
        }
        Err(err) => {
            state.metrics.record_inbound_request(err.status_code());
            gateway_error_response(&err)
        }
    }
}

fn attach_provenance(body: &Bytes, provenance: &crate::dispatch::Provenance) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    if let Value::Object(map) = &mut value {
        map.insert(
            "_proxy_info".to_string(),
            json!({
                "upstream": provenance.upstream,
                "attempt": provenance.attempt,
                "elapsed_ms": provenance.elapsed.as_millis() as u64,
                "request_id": provenance.request_id.to_string(),
                "cached": provenance.cached,
            }),
        );
    }
    Bytes::from(serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec()))
}

fn gateway_error_response(err: &GatewayError) -> Response {
    let details = match err {
        GatewayError::AllUpstreamsUnavailable { attempts } => Some(json!(attempts
            .iter()
            .map(|a| json!({
                "upstream": a.upstream_name,
                "error_class": a.error_class,
                "message": a.message,
            }))
            .collect::<Vec<_>>())),
        _ => None,
    };
    error_envelope(
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY),
        err.error_type(),
        &err.to_string(),
        details,
    )
}

fn error_envelope(status: StatusCode, error_type: &str, message: &str, details: Option<Value>) -> Response {
    let request_id = RequestId::new();
    let mut error = json!({
        "message": message,
        "type": error_type,
        "code": status.as_u16(),
        "timestamp": now_rfc3339(),
        "request_id": request_id.to_string(),
    });
    if let (Some(details), Value::Object(map)) = (details, &mut error) {
        map.insert("details".to_string(), details);
    }
    (status, Json(json!({ "error": error }))).into_response()
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
