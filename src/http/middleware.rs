//! Axum middleware that throttles routes by endpoint class and client.
//!
//! ```ignore
//! let guard = RateLimitGuard::preset(limiter, &policies, PolicyPreset::Auth);
//! let app = Router::new()
//!     .route("/login", post(login))
//!     .route_layer(axum::middleware::from_fn_with_state(guard, enforce_rate_limit));
//! ```

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::ratelimit::{PolicyPreset, PolicyTable, RateLimitKey, RateLimitPolicy, RateLimiter, Verdict};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client identifier used when nothing better is available.
const UNKNOWN_CLIENT: &str = "unknown";

/// Middleware state: which limiter, endpoint class and policy to apply.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    class: Arc<str>,
    policy: RateLimitPolicy,
}

impl RateLimitGuard {
    /// Guard routes of `class` with an explicit policy.
    pub fn new(limiter: Arc<RateLimiter>, class: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            class: Arc::from(class.into()),
            policy,
        }
    }

    /// Guard routes with a preset class, honouring overrides in `policies`.
    pub fn preset(limiter: Arc<RateLimiter>, policies: &PolicyTable, preset: PolicyPreset) -> Self {
        Self::new(limiter, preset.as_str(), policies.preset(preset))
    }

    /// The endpoint class this guard throttles.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// The policy this guard applies.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

/// Check the request against the guard's limiter.
///
/// Denied requests get a `429 Too Many Requests` with `Retry-After`;
/// admitted requests are forwarded and carry `X-RateLimit-*` headers.
pub async fn enforce_rate_limit(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = RateLimitKey::new(guard.class(), client_identifier(request.headers(), peer));
    let verdict = guard.limiter.check(&key.to_string_key(), &guard.policy);

    if !verdict.allowed {
        debug!(
            key = %key,
            retry_after_ms = verdict.retry_after_ms,
            "Request throttled"
        );
        return too_many_requests(&guard.policy, &verdict);
    }

    trace!(key = %key, remaining = verdict.remaining, "Request admitted");

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &guard.policy, &verdict);
    response
}

/// Derive the client identifier for a request.
///
/// Takes the first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
/// address, falling back to `"unknown"`.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header_value(&X_FORWARDED_FOR)
        .or_else(|| header_value(&X_REAL_IP))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn too_many_requests(policy: &RateLimitPolicy, verdict: &Verdict) -> Response {
    let body = serde_json::json!({
        "error": "Too many requests",
        "retry_after_secs": verdict.retry_after_secs(),
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(verdict.retry_after_secs()));
    apply_rate_limit_headers(headers, policy, verdict);
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, policy: &RateLimitPolicy, verdict: &Verdict) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(policy.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(epoch_secs_ceil(verdict.reset_at)));
}

fn epoch_secs_ceil(epoch_ms: i64) -> i64 {
    epoch_ms.div_euclid(1000) + i64::from(epoch_ms.rem_euclid(1000) > 0)
}
