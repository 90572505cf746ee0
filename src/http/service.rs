//! Decision service: exposes the limiter over HTTP/JSON.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ratelimit::{PolicyTable, RateLimitPolicy, RateLimiter, Verdict};

/// Shared state for the decision service handlers.
#[derive(Clone)]
pub struct AppState {
    /// The rate limiter instance
    pub limiter: Arc<RateLimiter>,
    /// Policies by endpoint class
    pub policies: Arc<PolicyTable>,
}

impl AppState {
    /// Create state from a limiter and a policy table.
    pub fn new(limiter: Arc<RateLimiter>, policies: PolicyTable) -> Self {
        Self {
            limiter,
            policies: Arc::new(policies),
        }
    }
}

/// Body of `POST /v1/check`.
///
/// Exactly one of `class` and `policy` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Opaque key, usually `"<class>:<client>"`
    pub key: String,
    /// Endpoint class whose configured policy applies
    #[serde(default)]
    pub class: Option<String>,
    /// Inline policy
    #[serde(default)]
    pub policy: Option<PolicyBody>,
}

/// Unvalidated inline policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyBody {
    pub limit: u64,
    pub window_ms: u64,
}

/// Response of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    #[serde(flatten)]
    pub verdict: Verdict,
    /// Limit of the policy that was applied
    pub limit: u64,
    /// Window of the policy that was applied, in milliseconds
    pub window_ms: i64,
}

/// Errors returned to service callers.
#[derive(Debug)]
enum ServiceError {
    BadRequest(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::BadRequest(message) => {
                warn!(error = %message, "Rejected check request");
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}

/// Build the decision service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/policies", get(list_policies))
        .route("/v1/check", post(check))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "records": state.limiter.record_count(),
    }))
}

async fn list_policies(State(state): State<AppState>) -> Json<PolicyTable> {
    Json(state.policies.as_ref().clone())
}

async fn check(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ServiceError> {
    let policy = resolve_policy(&state.policies, &request)?;
    let verdict = state.limiter.check(&request.key, &policy);

    debug!(
        key = %request.key,
        allowed = verdict.allowed,
        remaining = verdict.remaining,
        "Rate limit decision made"
    );

    Ok(Json(CheckResponse {
        verdict,
        limit: policy.limit(),
        window_ms: policy.window_ms(),
    }))
}

fn resolve_policy(
    policies: &PolicyTable,
    request: &CheckRequest,
) -> Result<RateLimitPolicy, ServiceError> {
    match (&request.class, &request.policy) {
        (Some(class), None) => policies
            .get(class)
            .copied()
            .ok_or_else(|| ServiceError::BadRequest(format!("unknown class: {}", class))),
        (None, Some(body)) => RateLimitPolicy::new(body.limit, body.window_ms)
            .map_err(|e| ServiceError::BadRequest(e.to_string())),
        (Some(_), Some(_)) => Err(ServiceError::BadRequest(
            "class and policy are mutually exclusive".to_string(),
        )),
        (None, None) => Err(ServiceError::BadRequest(
            "either class or policy is required".to_string(),
        )),
    }
}
