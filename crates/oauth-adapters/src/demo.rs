//! Offline stand-in for a real provider, for local development.
//!
//! The authorize URL points straight back at the configured callback with
//! `code=demo`, and the token request fabricates a grant without any
//! network I/O. State verification still runs, since it lives in
//! [`OAuthProvider::exchange_code`].

use crate::error::OAuthError;
use crate::pkce::generate_state;
use crate::provider::{AuthorizationRequest, OAuthProvider, TokenGrant};
use async_trait::async_trait;
use chrono::Utc;
use registration_store::{
    random_token, PendingAuthorization, Platform, PlatformParams, SessionId,
};
use secrecy::Secret;
use tracing::warn;
use urlencoding::encode;

/// Code the demo authorize URL hands back.
pub const DEMO_CODE: &str = "demo";

pub struct DemoAdapter {
    platform: Platform,
    redirect_uri: String,
}

impl DemoAdapter {
    pub fn new(platform: Platform, redirect_uri: impl Into<String>) -> Self {
        warn!(%platform, "Demo OAuth adapter enabled; provider validation is bypassed");
        Self {
            platform,
            redirect_uri: redirect_uri.into(),
        }
    }
}

#[async_trait]
impl OAuthProvider for DemoAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn build_authorization_url(
        &self,
        _session_id: &SessionId,
        params: &PlatformParams,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let state = generate_state();
        let separator = if self.redirect_uri.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}platform={}&code={}&state={}",
            self.redirect_uri,
            separator,
            self.platform,
            DEMO_CODE,
            encode(&state)
        );

        Ok(AuthorizationRequest {
            url,
            pending: PendingAuthorization {
                platform: self.platform,
                state,
                pkce_verifier: None,
                params: params.clone(),
                issued_at: Utc::now(),
            },
        })
    }

    async fn request_token(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<TokenGrant, OAuthError> {
        if code != DEMO_CODE {
            return Err(OAuthError::rejected(self.platform, "unknown demo code"));
        }

        let account_id = pending
            .params
            .shop
            .clone()
            .unwrap_or_else(|| format!("demo-{}-account", self.platform));

        Ok(TokenGrant {
            access_token: Secret::new(random_token(24)),
            refresh_token: None,
            expires_in: None,
            scopes: vec!["demo".into()],
            account_id,
        })
    }
}
