//! Etsy Open API v3 OAuth (authorization code + PKCE).

use crate::error::OAuthError;
use crate::pkce::{generate_code_challenge, generate_code_verifier, generate_state};
use crate::provider::{AuthorizationRequest, OAuthProvider, TokenGrant};
use async_trait::async_trait;
use chrono::Utc;
use registration_store::{PendingAuthorization, Platform, PlatformParams, SessionId};
use reqwest::Client;
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

pub const ETSY_AUTHORIZE_URL: &str = "https://www.etsy.com/oauth/connect";
pub const ETSY_TOKEN_URL: &str = "https://api.etsy.com/v3/public/oauth/token";

/// Scopes a print-on-demand seller grants at signup.
pub const DEFAULT_ETSY_SCOPES: &[&str] = &["shops_r", "listings_r", "listings_w", "transactions_r"];

/// Etsy app registration.
#[derive(Debug, Clone)]
pub struct EtsyConfig {
    /// Etsy app keystring
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    /// Timeout for the token endpoint call
    pub timeout: Duration,
}

impl EtsyConfig {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes: DEFAULT_ETSY_SCOPES.iter().map(|s| s.to_string()).collect(),
            authorize_url: ETSY_AUTHORIZE_URL.into(),
            token_url: ETSY_TOKEN_URL.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtsyTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Etsy OAuth adapter.
#[derive(Clone)]
pub struct EtsyAdapter {
    client: Client,
    config: EtsyConfig,
}

impl EtsyAdapter {
    pub fn new(config: EtsyConfig) -> Result<Self, OAuthError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OAuthError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }
}

/// Etsy access tokens are prefixed with the numeric user id:
/// `<user_id>.<opaque>`.
fn etsy_user_id(access_token: &str) -> Option<&str> {
    let (prefix, rest) = access_token.split_once('.')?;
    if prefix.is_empty() || rest.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(prefix)
}

#[async_trait]
impl OAuthProvider for EtsyAdapter {
    fn platform(&self) -> Platform {
        Platform::Etsy
    }

    fn build_authorization_url(
        &self,
        session_id: &SessionId,
        params: &PlatformParams,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let state = generate_state();
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        let scope = self.config.scopes.join(" ");

        let url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.config.authorize_url,
            encode(&self.config.client_id),
            encode(&self.config.redirect_uri),
            encode(&scope),
            encode(&state),
            encode(&challenge),
        );

        debug!(session_id = %session_id, "Built Etsy authorize URL");

        Ok(AuthorizationRequest {
            url,
            pending: PendingAuthorization {
                platform: Platform::Etsy,
                state,
                pkce_verifier: Some(verifier),
                params: params.clone(),
                issued_at: Utc::now(),
            },
        })
    }

    #[instrument(skip_all)]
    async fn request_token(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<TokenGrant, OAuthError> {
        let verifier = pending
            .pkce_verifier
            .as_deref()
            .ok_or(OAuthError::MissingParam {
                platform: Platform::Etsy,
                param: "code_verifier",
            })?;

        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code", code),
            ("code_verifier", verifier),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| OAuthError::transport(Platform::Etsy, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Etsy token exchange rejected: {}", body);
            return Err(OAuthError::rejected(
                Platform::Etsy,
                format!("token endpoint returned {}", status),
            ));
        }

        let token: EtsyTokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::rejected(Platform::Etsy, e.to_string()))?;

        let account_id = etsy_user_id(&token.access_token)
            .ok_or_else(|| {
                OAuthError::rejected(Platform::Etsy, "access token carries no user id")
            })?
            .to_string();

        Ok(TokenGrant {
            access_token: Secret::new(token.access_token),
            refresh_token: token.refresh_token.map(Secret::new),
            expires_in: token.expires_in,
            scopes: self.config.scopes.clone(),
            account_id,
        })
    }
}
