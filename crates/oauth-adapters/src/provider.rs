//! The adapter contract every OAuth platform implements.

use crate::error::OAuthError;
use crate::pkce::{constant_time_eq, token_ref};
use async_trait::async_trait;
use chrono::Utc;
use registration_store::{
    ConnectionRecord, PendingAuthorization, Platform, PlatformParams, SessionId,
};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// An authorize URL together with the state it embeds.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub pending: PendingAuthorization,
}

/// Tokens returned by a provider's token endpoint.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_in: Option<u64>,
    pub scopes: Vec<String>,
    /// Provider-side account the tokens belong to
    pub account_id: String,
}

/// OAuth handshake for one e-commerce platform.
///
/// Implementors supply URL construction and the raw token request;
/// [`OAuthProvider::exchange_code`] wraps the latter with state
/// verification so no implementation can reach the network with a
/// forged callback.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn platform(&self) -> Platform;

    /// Build an authorize URL with a fresh state (and PKCE pair if the
    /// provider uses one).
    fn build_authorization_url(
        &self,
        session_id: &SessionId,
        params: &PlatformParams,
    ) -> Result<AuthorizationRequest, OAuthError>;

    /// Provider-specific callback checks run before the token request.
    fn verify_callback(
        &self,
        _pending: &PendingAuthorization,
        _params: &PlatformParams,
    ) -> Result<(), OAuthError> {
        Ok(())
    }

    /// Call the provider's token endpoint.
    async fn request_token(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<TokenGrant, OAuthError>;

    /// Verify the returned state, then exchange the code for a connection.
    async fn exchange_code(
        &self,
        pending: &PendingAuthorization,
        code: &str,
        returned_state: &str,
        params: &PlatformParams,
    ) -> Result<ConnectionRecord, OAuthError> {
        let platform = self.platform();

        if pending.platform != platform
            || !constant_time_eq(pending.state.as_bytes(), returned_state.as_bytes())
        {
            warn!(%platform, "OAuth state mismatch, refusing token exchange");
            return Err(OAuthError::Csrf { platform });
        }

        if code.trim().is_empty() {
            return Err(OAuthError::MissingParam {
                platform,
                param: "code",
            });
        }

        self.verify_callback(pending, params)?;

        let grant = self.request_token(pending, code).await?;
        info!(%platform, account = %grant.account_id, "Authorization code exchanged");

        Ok(ConnectionRecord {
            platform,
            oauth_state: pending.state.clone(),
            pkce_verifier: pending.pkce_verifier.clone(),
            connected_at: Utc::now(),
            provider_account_id: grant.account_id,
            token_ref: token_ref(&grant.access_token),
            scopes: grant.scopes,
        })
    }
}

/// Adapters indexed by platform.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Platform, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for its platform.
    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.insert(provider.platform(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn OAuthProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn OAuthProvider>> {
        self.providers.get(&platform).cloned()
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.providers.contains_key(&platform)
    }

    /// Platforms with a registered adapter, in stable order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.providers.keys().copied().collect();
        platforms.sort();
        platforms
    }
}
