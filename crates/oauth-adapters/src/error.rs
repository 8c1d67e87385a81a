//! OAuth adapter errors.

use registration_store::Platform;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OAuthError {
    /// Returned state does not match the one minted for this session and
    /// platform. The token endpoint is never contacted.
    #[error("OAuth state mismatch for {platform}")]
    Csrf { platform: Platform },

    /// The provider refused the exchange, timed out or answered garbage.
    #[error("{platform} rejected the authorization: {message}")]
    ProviderRejected { platform: Platform, message: String },

    #[error("{platform} requires the '{param}' parameter")]
    MissingParam {
        platform: Platform,
        param: &'static str,
    },

    #[error("Invalid {platform} parameter: {message}")]
    InvalidParam { platform: Platform, message: String },

    #[error("Adapter configuration error: {0}")]
    Config(String),
}

impl OAuthError {
    pub(crate) fn rejected(platform: Platform, message: impl Into<String>) -> Self {
        OAuthError::ProviderRejected {
            platform,
            message: message.into(),
        }
    }

    /// Map a transport failure onto a provider rejection.
    pub(crate) fn transport(platform: Platform, err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "token endpoint timed out".to_string()
        } else {
            err.to_string()
        };
        Self::rejected(platform, message)
    }

    /// Platform the error is scoped to, if any.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            OAuthError::Csrf { platform }
            | OAuthError::ProviderRejected { platform, .. }
            | OAuthError::MissingParam { platform, .. }
            | OAuthError::InvalidParam { platform, .. } => Some(*platform),
            OAuthError::Config(_) => None,
        }
    }
}
