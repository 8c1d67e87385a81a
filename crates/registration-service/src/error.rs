//! Error types for the registration service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use oauth_adapters::OAuthError;
use registration_store::{Platform, SessionStatus, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Registration error types.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Email already registered: {0}")]
    EmailTaken(String),

    #[error("Registration not found")]
    NotFound,

    #[error("Registration expired, start again")]
    Expired,

    #[error("Registration failed: {0}")]
    Failed(String),

    #[error("OAuth state mismatch for {platform}")]
    Csrf { platform: Platform },

    #[error("{platform} rejected the authorization: {message}")]
    Provider { platform: Platform, message: String },

    #[error("Integrations not connected: {missing:?}")]
    IncompleteIntegrations { missing: Vec<Platform> },

    #[error("Registration completion already in progress")]
    CompletionInProgress,

    #[error("Tenant provisioning failed: {0}")]
    Provisioning(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistrationError {
    /// Whether the client can retry the same step without restarting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistrationError::Csrf { .. }
                | RegistrationError::Provider { .. }
                | RegistrationError::IncompleteIntegrations { .. }
                | RegistrationError::CompletionInProgress
                | RegistrationError::Provisioning(_)
                | RegistrationError::RateLimitExceeded
        )
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            RegistrationError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            RegistrationError::SubdomainTaken(_) => (StatusCode::CONFLICT, "SUBDOMAIN_TAKEN"),
            RegistrationError::EmailTaken(_) => (StatusCode::CONFLICT, "EMAIL_TAKEN"),
            RegistrationError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            RegistrationError::Expired => (StatusCode::GONE, "EXPIRED"),
            RegistrationError::Failed(_) => (StatusCode::GONE, "REGISTRATION_FAILED"),
            RegistrationError::Csrf { .. } => (StatusCode::BAD_REQUEST, "CSRF_STATE_MISMATCH"),
            RegistrationError::Provider { .. } => (StatusCode::BAD_GATEWAY, "PROVIDER_REJECTED"),
            RegistrationError::IncompleteIntegrations { .. } => {
                (StatusCode::CONFLICT, "INCOMPLETE_INTEGRATIONS")
            }
            RegistrationError::CompletionInProgress => {
                (StatusCode::CONFLICT, "COMPLETION_IN_PROGRESS")
            }
            RegistrationError::Provisioning(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PROVISIONING_FAILED")
            }
            RegistrationError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED")
            }
            RegistrationError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<Platform>,
    pub retryable: bool,
}

impl IntoResponse for RegistrationError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let platform = match &self {
            RegistrationError::Csrf { platform } | RegistrationError::Provider { platform, .. } => {
                Some(*platform)
            }
            _ => None,
        };
        let missing = match &self {
            RegistrationError::IncompleteIntegrations { missing } => missing.clone(),
            _ => Vec::new(),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            platform,
            missing,
            retryable: self.is_retryable(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for RegistrationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => RegistrationError::Validation(msg),
            StoreError::NotFound(_) => RegistrationError::NotFound,
            StoreError::Expired(_) => RegistrationError::Expired,
            StoreError::Terminal { status, .. } => match status {
                SessionStatus::Expired => RegistrationError::Expired,
                SessionStatus::Failed => {
                    RegistrationError::Failed("registration can no longer proceed".into())
                }
                _ => RegistrationError::NotFound,
            },
            StoreError::PlatformNotSelected(platform) => RegistrationError::Validation(format!(
                "{} was not selected for this registration",
                platform
            )),
            StoreError::StateMismatch(platform) => RegistrationError::Csrf { platform },
            StoreError::Incomplete { missing } => {
                RegistrationError::IncompleteIntegrations { missing }
            }
            StoreError::CompletionInProgress(_) => RegistrationError::CompletionInProgress,
            StoreError::StateCollision => {
                RegistrationError::Internal("could not allocate OAuth state".into())
            }
        }
    }
}

impl From<OAuthError> for RegistrationError {
    fn from(e: OAuthError) -> Self {
        match e {
            OAuthError::Csrf { platform } => RegistrationError::Csrf { platform },
            OAuthError::ProviderRejected { platform, message } => {
                RegistrationError::Provider { platform, message }
            }
            e @ (OAuthError::MissingParam { .. } | OAuthError::InvalidParam { .. }) => {
                RegistrationError::Validation(e.to_string())
            }
            OAuthError::Config(msg) => RegistrationError::Internal(msg),
        }
    }
}
