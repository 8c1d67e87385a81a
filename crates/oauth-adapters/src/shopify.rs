//! Shopify authorization code grant (offline access tokens).

use crate::error::OAuthError;
use crate::pkce::{constant_time_eq, generate_state};
use crate::provider::{AuthorizationRequest, OAuthProvider, TokenGrant};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use registration_store::{PendingAuthorization, Platform, PlatformParams, SessionId};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

/// Scopes a print-on-demand seller grants at signup.
pub const DEFAULT_SHOPIFY_SCOPES: &[&str] = &[
    "read_products",
    "write_products",
    "read_orders",
    "write_fulfillments",
];

const SHOP_SUFFIX: &str = ".myshopify.com";

/// Shopify app registration.
#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    /// App API key
    pub client_id: String,
    /// App API secret key
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Timeout for the token endpoint call
    pub timeout: Duration,
    /// Send token requests here instead of `https://{shop}`
    pub admin_base_url: Option<String>,
    /// Require a valid `hmac` on relayed callbacks
    pub verify_hmac: bool,
}

impl ShopifyConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret.into()),
            redirect_uri: redirect_uri.into(),
            scopes: DEFAULT_SHOPIFY_SCOPES.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(10),
            admin_base_url: None,
            verify_hmac: true,
        }
    }
}

/// Normalize a shop domain to `name.myshopify.com`.
///
/// Accepts a bare shop name, a full domain, or a URL.
pub fn normalize_shop_domain(input: &str) -> Result<String, String> {
    let mut shop = input.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = shop.strip_prefix(scheme) {
            shop = rest.to_string();
        }
    }
    let shop = shop.trim_end_matches('/');

    if shop.is_empty() {
        return Err("Shop domain must not be empty".into());
    }

    let name = shop.strip_suffix(SHOP_SUFFIX).unwrap_or(shop);
    if name.contains('.') {
        return Err(format!("Not a myshopify.com domain: {}", input.trim()));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !valid || name.len() > 60 {
        return Err(format!("Invalid shop name: {}", name));
    }

    Ok(format!("{}{}", name, SHOP_SUFFIX))
}

/// Hex HMAC-SHA256 Shopify attaches to its redirects.
///
/// The message is every query parameter except `hmac` and `signature`,
/// sorted by key and joined as `key=value&...`.
pub fn callback_signature(
    secret: &SecretString,
    query: &BTreeMap<String, String>,
) -> Result<String, OAuthError> {
    let message = query
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "hmac" | "signature"))
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| OAuthError::Config(e.to_string()))?;
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Serialize)]
struct ShopifyTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ShopifyTokenResponse {
    access_token: String,
    #[serde(default)]
    scope: String,
}

/// Shopify OAuth adapter.
#[derive(Clone)]
pub struct ShopifyAdapter {
    client: Client,
    config: ShopifyConfig,
}

impl ShopifyAdapter {
    pub fn new(config: ShopifyConfig) -> Result<Self, OAuthError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OAuthError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn shop_from(&self, params: &PlatformParams) -> Result<String, OAuthError> {
        let raw = params.shop.as_deref().ok_or(OAuthError::MissingParam {
            platform: Platform::Shopify,
            param: "shop",
        })?;

        normalize_shop_domain(raw).map_err(|message| OAuthError::InvalidParam {
            platform: Platform::Shopify,
            message,
        })
    }

    /// Check the relayed redirect was signed with our app secret and
    /// belongs to this authorization.
    fn verify_signature(
        &self,
        pending: &PendingAuthorization,
        callback: &BTreeMap<String, String>,
    ) -> Result<(), OAuthError> {
        let csrf = OAuthError::Csrf {
            platform: Platform::Shopify,
        };

        let Some(provided) = callback.get("hmac") else {
            warn!("Shopify callback relayed without an hmac");
            return Err(csrf);
        };

        let expected = callback_signature(&self.config.client_secret, callback)?;
        if !constant_time_eq(
            expected.as_bytes(),
            provided.to_ascii_lowercase().as_bytes(),
        ) {
            warn!("Shopify callback hmac mismatch");
            return Err(csrf);
        }

        if let Some(state) = callback.get("state") {
            if !constant_time_eq(state.as_bytes(), pending.state.as_bytes()) {
                warn!("Signed Shopify callback carries another state");
                return Err(csrf);
            }
        }

        Ok(())
    }

    fn token_url(&self, shop: &str) -> String {
        match &self.config.admin_base_url {
            Some(base) => format!("{}/admin/oauth/access_token", base.trim_end_matches('/')),
            None => format!("https://{}/admin/oauth/access_token", shop),
        }
    }
}

#[async_trait]
impl OAuthProvider for ShopifyAdapter {
    fn platform(&self) -> Platform {
        Platform::Shopify
    }

    fn build_authorization_url(
        &self,
        session_id: &SessionId,
        params: &PlatformParams,
    ) -> Result<AuthorizationRequest, OAuthError> {
        let shop = self.shop_from(params)?;
        let state = generate_state();
        let scope = self.config.scopes.join(",");

        let url = format!(
            "https://{}/admin/oauth/authorize?client_id={}&scope={}&redirect_uri={}&state={}",
            shop,
            encode(&self.config.client_id),
            encode(&scope),
            encode(&self.config.redirect_uri),
            encode(&state),
        );

        debug!(session_id = %session_id, %shop, "Built Shopify authorize URL");

        Ok(AuthorizationRequest {
            url,
            pending: PendingAuthorization {
                platform: Platform::Shopify,
                state,
                pkce_verifier: None,
                params: PlatformParams::shop(shop),
                issued_at: Utc::now(),
            },
        })
    }

    /// The callback must be signed by Shopify and come from the shop the
    /// state was minted for.
    fn verify_callback(
        &self,
        pending: &PendingAuthorization,
        params: &PlatformParams,
    ) -> Result<(), OAuthError> {
        if self.config.verify_hmac {
            self.verify_signature(pending, &params.callback)?;
        }

        let returned = params
            .shop
            .as_deref()
            .or_else(|| params.callback.get("shop").map(String::as_str));
        let Some(returned) = returned else {
            return Ok(());
        };

        let returned = normalize_shop_domain(returned).map_err(|message| {
            OAuthError::InvalidParam {
                platform: Platform::Shopify,
                message,
            }
        })?;

        if pending.params.shop.as_deref() != Some(returned.as_str()) {
            warn!(shop = %returned, "Shopify callback from unexpected shop");
            return Err(OAuthError::Csrf {
                platform: Platform::Shopify,
            });
        }

        Ok(())
    }

    #[instrument(skip_all)]
    async fn request_token(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<TokenGrant, OAuthError> {
        let shop = self.shop_from(&pending.params)?;

        let request = ShopifyTokenRequest {
            client_id: &self.config.client_id,
            client_secret: self.config.client_secret.expose_secret(),
            code,
        };

        let response = self
            .client
            .post(self.token_url(&shop))
            .json(&request)
            .send()
            .await
            .map_err(|e| OAuthError::transport(Platform::Shopify, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, %shop, "Shopify token exchange rejected: {}", body);
            return Err(OAuthError::rejected(
                Platform::Shopify,
                format!("token endpoint returned {}", status),
            ));
        }

        let token: ShopifyTokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::rejected(Platform::Shopify, e.to_string()))?;

        let scopes = token
            .scope
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(TokenGrant {
            access_token: Secret::new(token.access_token),
            refresh_token: None,
            expires_in: None,
            scopes,
            account_id: shop,
        })
    }
}
