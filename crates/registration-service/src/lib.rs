//! Tenant registration service.
//!
//! Walks a new print-on-demand seller through signup:
//! - Collects company and administrator details
//! - Connects the seller's Etsy and Shopify shops over OAuth
//! - Provisions the tenant once every selected shop is connected
//!
//! In-flight registrations live in memory only and expire after 30 minutes.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod provisioner;
pub mod validation;

pub use config::Config;
pub use credentials::{CredentialIssuer, LoginClaims, LoginTokens, TokenKind};
pub use error::{ErrorResponse, RegistrationError};
pub use orchestrator::{
    CompletedRegistration, ConnectOutcome, RegistrationOrchestrator, RegistrationStatusView,
    StartedRegistration,
};
pub use provisioner::{
    InMemoryTenantDirectory, ProvisionedTenant, ProvisioningError, ProvisioningRequest,
    SubdomainAvailabilityChecker, TenantProvisioner,
};
