//! Rate limit decision endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::ratelimit::{
    check_request, GateDecision, GateResponse, LimiterKind, LimiterRegistry, RequestMeta,
};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Shared state for the HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The limiters requests are checked against
    pub registry: Arc<LimiterRegistry>,
    /// Ignore the peer address when resolving the client identifier
    pub behind_proxy: bool,
}

impl AppState {
    pub fn new(registry: Arc<LimiterRegistry>, behind_proxy: bool) -> Self {
        Self {
            registry,
            behind_proxy,
        }
    }
}

/// Query parameters accepted by the check endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct CheckParams {
    /// Explicit identifier, bypassing resolution from the request
    pub identifier: Option<String>,
}

/// Build the router for the decision service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ratelimit/{limiter}", get(check_rate_limit))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "backend": state.registry.backend(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Decide whether the calling request may proceed under the named limiter.
#[instrument(skip(state, params, peer, headers))]
async fn check_rate_limit(
    State(state): State<AppState>,
    Path(limiter): Path<String>,
    Query(params): Query<CheckParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let rate_limiter = match limiter
        .parse::<LimiterKind>()
        .ok()
        .and_then(|kind| state.registry.get(kind))
    {
        Some(rate_limiter) => rate_limiter,
        None => {
            warn!(limiter = %limiter, "Received check for unknown limiter");
            let body = serde_json::json!({
                "success": false,
                "error": format!("unknown limiter: {}", limiter),
            });
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        }
    };

    let peer = if state.behind_proxy { None } else { Some(peer) };
    let meta = RequestMeta::from_headers(&headers, peer);
    let identifier = params
        .identifier
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let decision = check_request(rate_limiter, &meta, identifier).await;

    debug!(
        limiter = %limiter,
        allowed = decision.is_allowed(),
        "Rate limit decision made"
    );

    decision_response(decision, rate_limiter.config().max_requests())
}

fn decision_response(decision: GateDecision, limit: u64) -> Response {
    let status = if decision.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(GateResponse::from(decision))).into_response();
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));

    match decision {
        GateDecision::Allowed {
            remaining,
            reset_time,
        } => {
            headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
            headers.insert(RESET_HEADER, HeaderValue::from(reset_time.div_ceil(1000)));
        }
        GateDecision::Denied { retry_after } => {
            headers.insert(REMAINING_HEADER, HeaderValue::from(0u64));
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }

    response
}
