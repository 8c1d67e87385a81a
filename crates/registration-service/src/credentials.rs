//! Login credentials handed back when a registration completes.
//!
//! Tokens are HS256 JWTs signed with the configured secret.

use crate::error::RegistrationError;
use crate::provisioner::{AdminUser, Tenant};
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use registration_store::random_token;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by a login token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginClaims {
    /// Admin user id
    pub sub: Uuid,
    pub tenant_id: Uuid,
    pub subdomain: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Tokens for the new tenant's administrator.
#[derive(Debug, Clone, Serialize)]
pub struct LoginTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Signs and verifies login tokens.
#[derive(Clone)]
pub struct CredentialIssuer {
    secret: SecretString,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(secret: SecretString, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Issuer with a random key. Tokens do not survive a restart.
    pub fn ephemeral(access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self::new(Secret::new(random_token(32)), access_ttl, refresh_ttl)
    }

    fn sign(&self, claims: &LoginClaims) -> Result<String, RegistrationError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .map_err(|e| RegistrationError::Internal(format!("Token signing failed: {}", e)))
    }

    fn claims(
        &self,
        tenant: &Tenant,
        admin: &AdminUser,
        kind: TokenKind,
        ttl: Duration,
    ) -> LoginClaims {
        let iat = Utc::now().timestamp();
        LoginClaims {
            sub: admin.id,
            tenant_id: tenant.id,
            subdomain: tenant.subdomain.clone(),
            kind,
            iat,
            exp: iat + ttl.as_secs() as i64,
            jti: random_token(16),
        }
    }

    /// Issue an access/refresh token pair for a tenant administrator.
    pub fn issue(
        &self,
        tenant: &Tenant,
        admin: &AdminUser,
    ) -> Result<LoginTokens, RegistrationError> {
        let access = self.claims(tenant, admin, TokenKind::Access, self.access_ttl);
        let refresh = self.claims(tenant, admin, TokenKind::Refresh, self.refresh_ttl);

        Ok(LoginTokens {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".into(),
            expires_in: self.access_ttl.as_secs(),
        })
    }

    /// Verify a token's signature and expiry.
    pub fn verify(&self, token: &str) -> Result<LoginClaims, RegistrationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<LoginClaims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => {
                RegistrationError::Validation("login token expired".into())
            }
            _ => RegistrationError::Validation("invalid login token".into()),
        })?;

        Ok(data.claims)
    }
}
