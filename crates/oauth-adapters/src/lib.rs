//! OAuth handshake adapters for the platforms a tenant can connect.
//!
//! Each adapter builds authorize URLs and redeems authorization codes.
//! Access tokens never leave an adapter: connections carry an opaque
//! reference instead.

mod demo;
mod error;
mod etsy;
mod pkce;
mod provider;
mod shopify;

pub use demo::{DemoAdapter, DEMO_CODE};
pub use error::OAuthError;
pub use etsy::{EtsyAdapter, EtsyConfig, DEFAULT_ETSY_SCOPES, ETSY_AUTHORIZE_URL, ETSY_TOKEN_URL};
pub use pkce::{
    constant_time_eq, generate_code_challenge, generate_code_verifier, generate_state, token_ref,
};
pub use provider::{AuthorizationRequest, OAuthProvider, ProviderRegistry, TokenGrant};
pub use shopify::{
    callback_signature, normalize_shop_domain, ShopifyAdapter, ShopifyConfig,
    DEFAULT_SHOPIFY_SCOPES,
};
