//! Configuration for the registration service.

use anyhow::{Context, Result};
use oauth_adapters::{
    DemoAdapter, EtsyAdapter, EtsyConfig, ProviderRegistry, ShopifyAdapter, ShopifyConfig,
    ETSY_AUTHORIZE_URL, ETSY_TOKEN_URL,
};
use registration_store::{Platform, DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};
use secrecy::SecretString;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Registration session lifetime
    #[serde(default)]
    pub session: SessionConfig,

    /// Etsy app credentials; Etsy is disabled when absent
    #[serde(default)]
    pub etsy: Option<EtsyProviderConfig>,

    /// Shopify app credentials; Shopify is disabled when absent
    #[serde(default)]
    pub shopify: Option<ShopifyProviderConfig>,

    /// Shared OAuth settings
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Login token issuance
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Tenant provisioning defaults
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Time a registration may stay open, from creation
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How often expired sessions are reclaimed
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtsyProviderConfig {
    /// Etsy app keystring
    pub client_id: String,

    pub redirect_uri: String,

    /// Space or comma separated scopes; adapter defaults when unset
    #[serde(default)]
    pub scopes: Option<String>,

    #[serde(default = "default_etsy_authorize_url")]
    pub authorize_url: String,

    #[serde(default = "default_etsy_token_url")]
    pub token_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyProviderConfig {
    /// App API key
    pub client_id: String,

    /// App API secret key
    pub client_secret: SecretString,

    pub redirect_uri: String,

    /// Space or comma separated scopes; adapter defaults when unset
    #[serde(default)]
    pub scopes: Option<String>,

    /// Reject relayed callbacks without a valid Shopify `hmac`
    #[serde(default = "default_verify_callback_hmac")]
    pub verify_callback_hmac: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Timeout for provider token endpoints
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Replace every provider with the offline demo adapter
    #[serde(default)]
    pub demo_mode: bool,

    /// Callback the demo adapter redirects to
    #[serde(default = "default_demo_redirect_uri")]
    pub demo_redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// JWT signing key for login tokens; a random key is generated when unset
    #[serde(default)]
    pub signing_secret: Option<SecretString>,

    #[serde(default = "default_access_ttl", with = "humantime_serde")]
    pub access_ttl: Duration,

    #[serde(default = "default_refresh_ttl", with = "humantime_serde")]
    pub refresh_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Plan a new tenant starts on
    #[serde(default = "default_plan")]
    pub default_plan: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Global requests per minute
    #[serde(default = "default_global_rpm")]
    pub global_per_minute: u32,

    /// New registrations per minute
    #[serde(default = "default_start_rpm")]
    pub start_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// Default implementations
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            demo_mode: false,
            demo_redirect_uri: default_demo_redirect_uri(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            access_ttl: default_access_ttl(),
            refresh_ttl: default_refresh_ttl(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_per_minute: default_global_rpm(),
            start_per_minute: default_start_rpm(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_session_ttl() -> Duration {
    DEFAULT_SESSION_TTL
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_etsy_authorize_url() -> String {
    ETSY_AUTHORIZE_URL.into()
}

fn default_etsy_token_url() -> String {
    ETSY_TOKEN_URL.into()
}

fn default_verify_callback_hmac() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_demo_redirect_uri() -> String {
    "http://localhost:3000/register/callback".into()
}

fn default_access_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_refresh_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_plan() -> String {
    "starter".into()
}

fn default_global_rpm() -> u32 {
    120
}

fn default_start_rpm() -> u32 {
    20
}

fn default_log_level() -> String {
    "info".into()
}

/// Split a space or comma separated scope list.
fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(false),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Build the OAuth adapters for every platform that can be served.
    ///
    /// Demo mode serves every platform offline. Otherwise a platform is
    /// only enabled when its credentials are configured.
    pub fn provider_registry(&self) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();

        if self.oauth.demo_mode {
            for platform in Platform::ALL {
                registry.register(Arc::new(DemoAdapter::new(
                    platform,
                    self.oauth.demo_redirect_uri.clone(),
                )));
            }
            return Ok(registry);
        }

        match &self.etsy {
            Some(etsy) => {
                let mut config = EtsyConfig::new(&etsy.client_id, &etsy.redirect_uri);
                if let Some(scopes) = etsy.scopes.as_deref() {
                    config.scopes = parse_scopes(scopes);
                }
                config.authorize_url = etsy.authorize_url.clone();
                config.token_url = etsy.token_url.clone();
                config.timeout = self.oauth.request_timeout;

                let adapter = EtsyAdapter::new(config).context("Failed to build Etsy adapter")?;
                registry.register(Arc::new(adapter));
                info!("Etsy integration enabled");
            }
            None => warn!("Etsy credentials not configured, Etsy integration disabled"),
        }

        match &self.shopify {
            Some(shopify) => {
                let mut config = ShopifyConfig::new(
                    &shopify.client_id,
                    "",
                    &shopify.redirect_uri,
                );
                config.client_secret = shopify.client_secret.clone();
                if let Some(scopes) = shopify.scopes.as_deref() {
                    config.scopes = parse_scopes(scopes);
                }
                config.timeout = self.oauth.request_timeout;
                config.verify_hmac = shopify.verify_callback_hmac;
                if !config.verify_hmac {
                    warn!("Shopify callback hmac verification disabled");
                }

                let adapter =
                    ShopifyAdapter::new(config).context("Failed to build Shopify adapter")?;
                registry.register(Arc::new(adapter));
                info!("Shopify integration enabled");
            }
            None => warn!("Shopify credentials not configured, Shopify integration disabled"),
        }

        Ok(registry)
    }
}
