//! HTTP request handlers.

use super::types::{
    AbandonResponse, AuthorizeRequest, AuthorizeResponse, CompleteResponse, ConnectRequest,
    ConnectResponse, HealthResponse, StartRequest, StartResponse, StatusResponse, TokenRequest,
};
use super::AppState;
use crate::error::RegistrationError;
use crate::validation::parse_platforms;
use axum::{
    extract::{Path, State},
    Json,
};
use registration_store::{Platform, SessionId};
use tracing::info;

fn parse_platform(name: &str) -> Result<Platform, RegistrationError> {
    name.parse().map_err(RegistrationError::Validation)
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.orchestrator.active_sessions().await,
        platforms: state.orchestrator.platforms(),
    })
}

/// Begin a registration.
pub async fn start_registration(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, RegistrationError> {
    let platforms = parse_platforms(&request.selected_integrations)?;
    info!(platforms = ?platforms, "Registration start requested");

    let started = state
        .orchestrator
        .start(request.details(), platforms, request.platform_params)
        .await?;

    Ok(Json(StartResponse {
        registration_token: started.session_id.to_string(),
        expires_at: started.expires_at.to_rfc3339(),
        oauth_urls: started.oauth_urls,
        deferred: started.deferred,
    }))
}

/// Issue a fresh authorize URL for one platform.
pub async fn authorize_platform(
    State(state): State<AppState>,
    Json(request): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, RegistrationError> {
    let platform = parse_platform(&request.platform)?;
    let id = SessionId::from(request.registration_token);

    let url = state
        .orchestrator
        .authorize(&id, platform, request.platform_params)
        .await?;

    Ok(Json(AuthorizeResponse { platform, url }))
}

/// Relay an OAuth callback.
pub async fn connect_platform(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, RegistrationError> {
    let platform = parse_platform(&request.platform)?;
    let id = SessionId::from(request.registration_token);

    let outcome = state
        .orchestrator
        .connect(
            &id,
            platform,
            &request.oauth_code,
            &request.oauth_state,
            request.platform_params,
        )
        .await?;

    Ok(Json(ConnectResponse {
        platform: outcome.platform,
        connected: true,
        connected_platforms: outcome.connected_platforms,
        all_connected: outcome.all_connected,
        status: outcome.status,
    }))
}

/// Provision the tenant.
pub async fn complete_registration(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<CompleteResponse>, RegistrationError> {
    let id = SessionId::from(request.registration_token);
    let completed = state.orchestrator.complete(&id).await?;

    Ok(Json(CompleteResponse {
        tenant: completed.tenant,
        admin_user: completed.admin_user,
        subscription: completed.subscription,
        tokens: completed.tokens,
    }))
}

/// Discard a registration.
pub async fn abandon_registration(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<AbandonResponse>, RegistrationError> {
    let id = SessionId::from(request.registration_token);
    let abandoned = state.orchestrator.abandon(&id).await?;

    Ok(Json(AbandonResponse {
        registration_token: id.to_string(),
        abandoned,
    }))
}

/// Registration progress.
pub async fn get_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<StatusResponse>, RegistrationError> {
    let view = state.orchestrator.status(&SessionId::from(token)).await?;

    Ok(Json(StatusResponse {
        registration_token: view.session_id.to_string(),
        status: view.status,
        selected_platforms: view.selected_platforms,
        connected_platforms: view.connected_platforms,
        missing_platforms: view.missing_platforms,
        all_connected: view.all_connected,
        expires_at: view.expires_at.to_rfc3339(),
        failure_reason: view.failure_reason,
    }))
}
