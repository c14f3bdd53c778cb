//! Status server handlers

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::defaults::PROMETHEUS_NAMESPACE;
use crate::state::StateManager;
use crate::telemetry::MetricsRegistry;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub state: Arc<StateManager>,
    pub registry: Arc<MetricsRegistry>,
    pub pretty_json: bool,
}

impl ApiState {
    pub fn new(state: Arc<StateManager>, registry: Arc<MetricsRegistry>, pretty_json: bool) -> Self {
        Self {
            state,
            registry,
            pretty_json,
        }
    }
}

/// GET /_status
///
/// Health flag plus the runtime state of every probe and remediation
/// action. 200 while healthy, 500 once unhealthy, so load balancers can
/// act on the status code alone.
pub async fn get_status(State(api): State<ApiState>) -> Response {
    let status = api.state.status();
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let body = if api.pretty_json {
        serde_json::to_string_pretty(&status)
    } else {
        serde_json::to_string(&status)
    };

    match body {
        Ok(body) => (
            code,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize status");
            (StatusCode::INTERNAL_SERVER_ERROR, "status unavailable").into_response()
        }
    }
}

/// GET /metrics
///
/// Every counter and gauge pushed through the registry, in Prometheus text
/// format (version 0.0.4).
pub async fn get_metrics(State(api): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        api.registry.render_prometheus(PROMETHEUS_NAMESPACE),
    )
}
