//! Registration session data model.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// E-commerce platforms a tenant can connect during signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Etsy,
    Shopify,
}

impl Platform {
    /// Every supported platform.
    pub const ALL: [Platform; 2] = [Platform::Etsy, Platform::Shopify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Etsy => "etsy",
            Platform::Shopify => "shopify",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etsy" => Ok(Platform::Etsy),
            "shopify" => Ok(Platform::Shopify),
            other => Err(format!("Unsupported platform: {}", other)),
        }
    }
}

/// Registration session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for one or more integrations
    Pending,
    /// Every selected platform is connected
    Ready,
    /// Tenant provisioned; the session no longer exists
    Completed,
    /// Past its deadline
    Expired,
    /// Unrecoverable failure
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Ready => "ready",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Opaque, unguessable session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from 256 bits of randomness.
    pub fn generate() -> Self {
        Self(random_token(32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// URL-safe random token of `len` bytes of entropy.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Provider-specific inputs collected during the integration step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformParams {
    /// Shopify store domain (e.g. "acme.myshopify.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop: Option<String>,

    /// Query parameters of the provider redirect, relayed verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub callback: BTreeMap<String, String>,
}

impl PlatformParams {
    pub fn shop(shop: impl Into<String>) -> Self {
        Self {
            shop: Some(shop.into()),
            ..Self::default()
        }
    }
}

/// Company and administrator details captured at signup.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationDetails {
    pub company_name: String,
    pub subdomain: String,
    pub admin_first_name: String,
    pub admin_last_name: String,
    pub admin_email: String,
    pub admin_password: SecretString,
}

/// An authorize URL that has been handed out and not yet redeemed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub platform: Platform,
    /// CSRF nonce embedded in the authorize URL
    pub state: String,
    /// PKCE code verifier, for providers that require PKCE
    pub pkce_verifier: Option<String>,
    /// Parameters the URL was built with
    #[serde(default)]
    pub params: PlatformParams,
    pub issued_at: DateTime<Utc>,
}

/// A completed OAuth connection for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub platform: Platform,
    pub oauth_state: String,
    pub pkce_verifier: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Shop id or domain on the provider side
    pub provider_account_id: String,
    /// Opaque reference to the token; never the token itself
    pub token_ref: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// One in-progress tenant signup attempt.
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub details: RegistrationDetails,
    pub selected_platforms: BTreeSet<Platform>,
    pub authorizations: BTreeMap<Platform, PendingAuthorization>,
    pub connections: BTreeMap<Platform, ConnectionRecord>,
    pub status: SessionStatus,
    /// Set while a `complete()` call owns the session
    pub completing: bool,
    pub failure_reason: Option<String>,
}

impl RegistrationSession {
    /// Create a new pending session.
    pub fn new(
        details: RegistrationDetails,
        selected_platforms: BTreeSet<Platform>,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            created_at,
            expires_at: created_at + ttl,
            details,
            selected_platforms,
            authorizations: BTreeMap::new(),
            connections: BTreeMap::new(),
            status: SessionStatus::Pending,
            completing: false,
            failure_reason: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn connected_platforms(&self) -> Vec<Platform> {
        self.connections.keys().copied().collect()
    }

    /// Selected platforms that have no connection yet.
    pub fn missing_platforms(&self) -> Vec<Platform> {
        self.selected_platforms
            .iter()
            .filter(|p| !self.connections.contains_key(p))
            .copied()
            .collect()
    }

    pub fn all_connected(&self) -> bool {
        self.selected_platforms
            .iter()
            .all(|p| self.connections.contains_key(p))
    }

    /// Promote PENDING to READY once every selected platform is connected.
    ///
    /// Returns true if the status changed.
    pub fn refresh_status(&mut self) -> bool {
        if self.status == SessionStatus::Pending && self.all_connected() {
            self.status = SessionStatus::Ready;
            return true;
        }
        false
    }

    /// Every OAuth state currently held by this session.
    pub fn live_states(&self) -> impl Iterator<Item = &str> {
        self.authorizations.values().map(|a| a.state.as_str())
    }
}
