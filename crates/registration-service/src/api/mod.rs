//! HTTP API for the registration service.

mod handlers;
mod middleware;
mod types;

pub use handlers::*;
pub use middleware::{
    logging_middleware, rate_limit_middleware, request_span, route_label, RateLimitState,
    START_ROUTE,
};
pub use types::*;

use crate::orchestrator::RegistrationOrchestrator;
use axum::{
    http::{header::CONTENT_TYPE, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RegistrationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: RegistrationOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Create the API router with the default rate limit.
pub fn create_router(state: AppState) -> Router {
    create_router_with_rate_limit(state, RateLimitState::new(120, 20))
}

/// Create the API router with a custom rate limit.
pub fn create_router_with_rate_limit(state: AppState, rate_limit: RateLimitState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let registration = Router::new()
        .route(START_ROUTE, post(handlers::start_registration))
        .route("/registration/authorize", post(handlers::authorize_platform))
        .route("/registration/connect", post(handlers::connect_platform))
        .route("/registration/complete", post(handlers::complete_registration))
        .route("/registration/abandon", post(handlers::abandon_registration))
        .route("/registration/status/:token", get(handlers::get_status))
        .layer(axum_middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));

    Router::new()
        // Health check (no rate limiting)
        .route("/health", get(handlers::health))
        .merge(registration)
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}
