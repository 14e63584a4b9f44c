//! Cost-aware rate limiting using GCRA (Generic Cell Rate Algorithm).
//!
//! Each endpoint has a token cost (e.g. health=1, negotiate=20,
//! tools/execute=30). Every client IP gets 600 tokens per minute.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::middleware::Next;
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use parley_types::error::{ErrorBody, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Token budget per client IP per minute.
const TOKENS_PER_MINUTE: u32 = 600;

fn cost(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

pub fn operation_cost(method: &str, path: &str) -> NonZeroU32 {
    match (method, path) {
        (_, "/health") => cost(1),
        ("GET", "/.well-known/agent-card") => cost(1),
        ("POST", "/discover") => cost(2),
        ("GET", "/tools") => cost(2),
        ("POST", "/negotiate") => cost(20),
        ("POST", "/message") => cost(10),
        ("POST", "/notify") => cost(10),
        ("POST", "/tools/execute") => cost(30),
        ("POST", "/session/revoke") => cost(5),
        ("GET", "/stream") => cost(20),
        _ => cost(5),
    }
}

pub type KeyedRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

pub fn create_rate_limiter() -> Arc<KeyedRateLimiter> {
    Arc::new(RateLimiter::keyed(Quota::per_minute(cost(
        TOKENS_PER_MINUTE,
    ))))
}

/// GCRA rate limiting middleware.
///
/// Extracts the client IP from `ConnectInfo`, computes the cost for the
/// requested operation, and checks the GCRA limiter. Returns 429 if the
/// client has exhausted its token budget.
pub async fn gcra_rate_limit(
    axum::extract::State(limiter): axum::extract::State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let cost = operation_cost(&method, &path);

    if limiter.check_key_n(&ip, cost).map_or(true, |r| r.is_err()) {
        tracing::warn!(ip = %ip, cost = cost.get(), path = %path, "GCRA rate limit exceeded");
        let body = ErrorBody {
            kind: ErrorKind::InvalidInput,
            message: "Rate limit exceeded".to_string(),
            details: Some(serde_json::json!({ "retry_after_secs": 60 })),
        };
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", "60")
            .body(Body::from(serde_json::to_string(&body).unwrap_or_default()))
            .unwrap_or_default();
    }

    next.run(request).await
}
