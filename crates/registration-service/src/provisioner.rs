//! Tenant provisioning collaborators.
//!
//! The orchestrator hands a fully connected registration to a
//! [`TenantProvisioner`], which must create the tenant, its admin user, the
//! subscription and the integration bindings as one unit. The in-memory
//! [`InMemoryTenantDirectory`] backs local runs and tests.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use registration_store::{Platform, RegistrationSession};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Provisioning failures.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The subdomain or admin email was claimed after the session started.
    #[error("Tenant conflict: {0}")]
    Conflict(String),

    /// The backing system could not be reached. Nothing was written.
    #[error("Provisioning backend unavailable: {0}")]
    Unavailable(String),
}

/// Pre-flight uniqueness checks run when a registration starts.
#[async_trait]
pub trait SubdomainAvailabilityChecker: Send + Sync {
    async fn is_available(&self, subdomain: &str) -> Result<bool, ProvisioningError>;

    async fn email_in_use(&self, _email: &str) -> Result<bool, ProvisioningError> {
        Ok(false)
    }
}

/// Creates tenants atomically.
#[async_trait]
pub trait TenantProvisioner: Send + Sync {
    /// Create every tenant record or none of them.
    async fn create_tenant(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisionedTenant, ProvisioningError>;
}

/// Administrator account to create alongside the tenant.
#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: SecretString,
}

/// A platform connection to bind to the new tenant.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationBinding {
    pub platform: Platform,
    pub provider_account_id: String,
    pub token_ref: String,
    pub scopes: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Everything needed to provision one tenant.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub company_name: String,
    pub subdomain: String,
    pub admin: AdminAccount,
    pub integrations: Vec<IntegrationBinding>,
    pub plan: String,
}

impl ProvisioningRequest {
    pub fn from_session(session: &RegistrationSession, plan: &str) -> Self {
        let details = &session.details;

        let integrations = session
            .connections
            .values()
            .map(|c| IntegrationBinding {
                platform: c.platform,
                provider_account_id: c.provider_account_id.clone(),
                token_ref: c.token_ref.clone(),
                scopes: c.scopes.clone(),
                connected_at: c.connected_at,
            })
            .collect();

        Self {
            company_name: details.company_name.clone(),
            subdomain: details.subdomain.clone(),
            admin: AdminAccount {
                first_name: details.admin_first_name.clone(),
                last_name: details.admin_last_name.clone(),
                email: details.admin_email.clone(),
                password: details.admin_password.clone(),
            },
            integrations,
            plan: plan.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub status: TenantStatus,
    pub plan: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminUser {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// Result of a successful provisioning call.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedTenant {
    pub tenant: Tenant,
    pub admin_user: AdminUser,
    pub subscription: Subscription,
    pub integrations: Vec<IntegrationBinding>,
}

/// Hash the admin password with Argon2id, returning the PHC string.
fn hash_password(password: &SecretString) -> Result<String, ProvisioningError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ProvisioningError::Unavailable(format!("Password hashing failed: {}", e)))
}

fn verify_password(password: &SecretString, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Stored password hash is malformed");
            false
        }
    }
}

struct StoredTenant {
    provisioned: ProvisionedTenant,
    password_hash: String,
}

#[derive(Default)]
struct Directory {
    by_subdomain: HashMap<String, StoredTenant>,
    /// admin email -> subdomain
    emails: HashMap<String, String>,
}

/// In-memory tenant directory.
///
/// Serves as both the availability checker and the provisioner, so the
/// pre-flight check and the final write see the same data.
#[derive(Default)]
pub struct InMemoryTenantDirectory {
    inner: RwLock<Directory>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tenant_count(&self) -> usize {
        self.inner.read().await.by_subdomain.len()
    }

    pub async fn find(&self, subdomain: &str) -> Option<ProvisionedTenant> {
        self.inner
            .read()
            .await
            .by_subdomain
            .get(subdomain)
            .map(|t| t.provisioned.clone())
    }

    /// Check an admin login against the stored password hash.
    pub async fn verify_admin_password(&self, subdomain: &str, password: &SecretString) -> bool {
        let directory = self.inner.read().await;
        let Some(stored) = directory.by_subdomain.get(subdomain) else {
            return false;
        };

        verify_password(password, &stored.password_hash)
    }
}

#[async_trait]
impl SubdomainAvailabilityChecker for InMemoryTenantDirectory {
    async fn is_available(&self, subdomain: &str) -> Result<bool, ProvisioningError> {
        Ok(!self.inner.read().await.by_subdomain.contains_key(subdomain))
    }

    async fn email_in_use(&self, email: &str) -> Result<bool, ProvisioningError> {
        Ok(self.inner.read().await.emails.contains_key(email))
    }
}

#[async_trait]
impl TenantProvisioner for InMemoryTenantDirectory {
    async fn create_tenant(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisionedTenant, ProvisioningError> {
        // Argon2 is CPU-bound; keep it off the runtime and outside the lock
        let password = request.admin.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| {
                ProvisioningError::Unavailable(format!("Password hashing aborted: {}", e))
            })??;

        // Check and insert under one write lock
        let mut directory = self.inner.write().await;

        if directory.by_subdomain.contains_key(&request.subdomain) {
            return Err(ProvisioningError::Conflict(format!(
                "subdomain {} is taken",
                request.subdomain
            )));
        }
        if directory.emails.contains_key(&request.admin.email) {
            return Err(ProvisioningError::Conflict(format!(
                "email {} is registered",
                request.admin.email
            )));
        }

        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: request.company_name.clone(),
            subdomain: request.subdomain.clone(),
            status: TenantStatus::Active,
            plan: request.plan.clone(),
            created_at: now,
        };
        let admin_user = AdminUser {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            email: request.admin.email.clone(),
            first_name: request.admin.first_name.clone(),
            last_name: request.admin.last_name.clone(),
            role: "admin".into(),
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            plan: request.plan.clone(),
            status: "trialing".into(),
            started_at: now,
        };

        let provisioned = ProvisionedTenant {
            tenant,
            admin_user,
            subscription,
            integrations: request.integrations.clone(),
        };

        directory
            .emails
            .insert(request.admin.email.clone(), request.subdomain.clone());
        directory.by_subdomain.insert(
            request.subdomain.clone(),
            StoredTenant {
                password_hash,
                provisioned: provisioned.clone(),
            },
        );

        info!(
            tenant_id = %provisioned.tenant.id,
            subdomain = %request.subdomain,
            integrations = request.integrations.len(),
            "Tenant provisioned"
        );

        Ok(provisioned)
    }
}
