//! API request and response types.

use crate::credentials::LoginTokens;
use crate::provisioner::{AdminUser, Subscription, Tenant};
use registration_store::{Platform, PlatformParams, RegistrationDetails, SessionStatus};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to begin a registration.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub company_name: String,
    pub subdomain: String,
    pub admin_first_name: String,
    pub admin_last_name: String,
    pub admin_email: String,
    pub admin_password: SecretString,

    /// Platform names, e.g. `["etsy", "shopify"]`
    pub selected_integrations: Vec<String>,

    /// Per-platform parameters known up front (Shopify shop domain)
    #[serde(default)]
    pub platform_params: BTreeMap<Platform, PlatformParams>,
}

impl StartRequest {
    pub fn details(&self) -> RegistrationDetails {
        RegistrationDetails {
            company_name: self.company_name.clone(),
            subdomain: self.subdomain.clone(),
            admin_first_name: self.admin_first_name.clone(),
            admin_last_name: self.admin_last_name.clone(),
            admin_email: self.admin_email.clone(),
            admin_password: self.admin_password.clone(),
        }
    }
}

/// Response after starting a registration.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub registration_token: String,
    pub expires_at: String,
    pub oauth_urls: BTreeMap<Platform, String>,
    pub deferred: Vec<Platform>,
}

/// Request for a fresh authorize URL.
#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub registration_token: String,
    pub platform: String,
    #[serde(default)]
    pub platform_params: PlatformParams,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub platform: Platform,
    pub url: String,
}

/// OAuth callback parameters relayed by the client.
#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub registration_token: String,
    pub platform: String,
    pub oauth_code: String,
    pub oauth_state: String,
    #[serde(default)]
    pub platform_params: PlatformParams,
}

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub platform: Platform,
    pub connected: bool,
    pub connected_platforms: Vec<Platform>,
    pub all_connected: bool,
    pub status: SessionStatus,
}

/// Request carrying only the registration token.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub registration_token: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub tenant: Tenant,
    pub admin_user: AdminUser,
    pub subscription: Subscription,
    pub tokens: LoginTokens,
}

#[derive(Debug, Serialize)]
pub struct AbandonResponse {
    pub registration_token: String,
    pub abandoned: bool,
}

/// Registration progress.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub registration_token: String,
    pub status: SessionStatus,
    pub selected_platforms: Vec<Platform>,
    pub connected_platforms: Vec<Platform>,
    pub missing_platforms: Vec<Platform>,
    pub all_connected: bool,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub platforms: Vec<Platform>,
}
