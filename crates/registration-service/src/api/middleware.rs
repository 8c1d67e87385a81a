//! Rate limiting and request logging middleware.

use crate::error::RegistrationError;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Instant};
use tracing::{debug, info_span, warn, Span};

/// Route that opens sessions and mints OAuth states.
pub const START_ROUTE: &str = "/registration/start";

/// Process-wide rate limiter (not keyed by client).
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const FALLBACK_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(60) {
    Some(n) => n,
    None => unreachable!(),
};

fn limiter(per_minute: u32) -> Arc<Limiter> {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(FALLBACK_PER_MINUTE));
    Arc::new(RateLimiter::direct(quota))
}

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    /// Every registration route
    pub global: Arc<Limiter>,
    /// New registrations only; each one holds a session for its TTL
    pub start: Arc<Limiter>,
}

impl RateLimitState {
    pub fn new(global_per_minute: u32, start_per_minute: u32) -> Self {
        Self {
            global: limiter(global_per_minute),
            start: limiter(start_per_minute),
        }
    }

    /// A limit high enough that tests never hit it.
    pub fn permissive() -> Self {
        Self::new(10_000, 10_000)
    }
}

/// Route template of a request, e.g. `/registration/status/:token`.
///
/// Registration tokens travel in the status path, so logs use the
/// template rather than the raw URI.
pub fn route_label(request: &Request) -> &str {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or("unmatched")
}

/// Span for `TraceLayer` that never records the raw path.
pub fn request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        route = route_label(request),
    )
}

/// Reject requests over the start or global limit with 429.
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, RegistrationError> {
    let route = route_label(&request);

    if route == START_ROUTE && rate_limit.start.check().is_err() {
        warn!(route, "Registration start rate limit exceeded");
        return Err(RegistrationError::RateLimitExceeded);
    }

    if rate_limit.global.check().is_err() {
        warn!(route, "Global rate limit exceeded");
        return Err(RegistrationError::RateLimitExceeded);
    }

    Ok(next.run(request).await)
}

/// Log method, route, status and latency. Bodies carry secrets and paths
/// carry registration tokens, so neither is logged.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let route = route_label(&request).to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        warn!(%method, %route, %status, ?duration, "Request failed");
    } else {
        debug!(%method, %route, %status, ?duration, "Request handled");
    }

    response
}
