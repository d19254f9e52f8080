//! Router / Fallback Engine (C6) and its HTTP surface. `dispatch` holds the
//! transport-agnostic `route()` algorithm from SPEC_FULL.md §4.6; `http`
//! adapts it to axum; `auth` is the constant-time inbound key check.

pub mod auth;
mod dispatch;
mod http;

pub use dispatch::{GatewayRouter, Inbound, Provenance, RouteOutcome, RouterConfig, StrategyKind};
pub use http::{build_app, AppState};
