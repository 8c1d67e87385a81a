//! Registration workflow.
//!
//! A registration moves through four steps:
//!
//! 1. `start` validates the company and admin details, checks the
//!    subdomain and email are free, opens a session and mints one
//!    authorize URL per selected platform.
//! 2. `connect` redeems the authorization code a provider redirected back
//!    with, once per platform, in any order.
//! 3. `complete` provisions the tenant once every platform is connected
//!    and hands back login credentials.
//! 4. `abandon` discards the session at any point.
//!
//! Provider round-trips and provisioning happen outside the store's
//! per-session lock; the store re-validates state when results come back.

use crate::credentials::{CredentialIssuer, LoginTokens};
use crate::error::RegistrationError;
use crate::provisioner::{
    AdminUser, ProvisionedTenant, ProvisioningError, ProvisioningRequest, Subscription,
    SubdomainAvailabilityChecker, Tenant, TenantProvisioner,
};
use crate::validation::validate_details;
use chrono::{DateTime, Utc};
use oauth_adapters::{AuthorizationRequest, OAuthError, OAuthProvider, ProviderRegistry};
use registration_store::{
    Platform, PlatformParams, RegistrationDetails, RegistrationSession, SessionId,
    SessionStatus, SessionStore, StoreError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Attempts at minting a state value the store has not seen.
const MAX_STATE_ATTEMPTS: usize = 3;

/// Result of `start`.
#[derive(Debug, Clone)]
pub struct StartedRegistration {
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
    pub oauth_urls: BTreeMap<Platform, String>,
    /// Selected platforms still waiting on parameters (Shopify shop domain)
    pub deferred: Vec<Platform>,
}

/// Result of `connect`.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub platform: Platform,
    pub connected_platforms: Vec<Platform>,
    pub all_connected: bool,
    pub status: SessionStatus,
}

/// Result of `complete`.
#[derive(Debug, Clone)]
pub struct CompletedRegistration {
    pub tenant: Tenant,
    pub admin_user: AdminUser,
    pub subscription: Subscription,
    pub tokens: LoginTokens,
}

/// Read-only view of a session for polling clients.
#[derive(Debug, Clone)]
pub struct RegistrationStatusView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub selected_platforms: Vec<Platform>,
    pub connected_platforms: Vec<Platform>,
    pub missing_platforms: Vec<Platform>,
    pub all_connected: bool,
    pub expires_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl From<RegistrationSession> for RegistrationStatusView {
    fn from(session: RegistrationSession) -> Self {
        Self {
            connected_platforms: session.connected_platforms(),
            missing_platforms: session.missing_platforms(),
            all_connected: session.all_connected(),
            selected_platforms: session.selected_platforms.iter().copied().collect(),
            session_id: session.id,
            status: session.status,
            expires_at: session.expires_at,
            failure_reason: session.failure_reason,
        }
    }
}

/// Drives registrations from signup to a provisioned tenant.
pub struct RegistrationOrchestrator {
    store: Arc<dyn SessionStore>,
    providers: ProviderRegistry,
    availability: Arc<dyn SubdomainAvailabilityChecker>,
    provisioner: Arc<dyn TenantProvisioner>,
    credentials: CredentialIssuer,
    default_plan: String,
}

impl RegistrationOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        providers: ProviderRegistry,
        availability: Arc<dyn SubdomainAvailabilityChecker>,
        provisioner: Arc<dyn TenantProvisioner>,
        credentials: CredentialIssuer,
    ) -> Self {
        Self {
            store,
            providers,
            availability,
            provisioner,
            credentials,
            default_plan: "starter".into(),
        }
    }

    /// Set the plan new tenants start on.
    pub fn with_default_plan(mut self, plan: impl Into<String>) -> Self {
        self.default_plan = plan.into();
        self
    }

    /// Platforms this deployment can connect.
    pub fn platforms(&self) -> Vec<Platform> {
        self.providers.platforms()
    }

    /// Number of registrations currently open.
    pub async fn active_sessions(&self) -> usize {
        self.store.len().await
    }

    fn provider(&self, platform: Platform) -> Result<Arc<dyn OAuthProvider>, RegistrationError> {
        self.providers.get(platform).ok_or_else(|| {
            RegistrationError::Validation(format!("{} integration is not enabled", platform))
        })
    }

    /// Session lookup that rejects sessions which can no longer progress.
    async fn live_session(&self, id: &SessionId) -> Result<RegistrationSession, RegistrationError> {
        let session = self.store.get(id).await?;
        match session.status {
            SessionStatus::Expired => Err(RegistrationError::Expired),
            SessionStatus::Failed => Err(RegistrationError::Failed(
                session
                    .failure_reason
                    .unwrap_or_else(|| "registration can no longer proceed".into()),
            )),
            SessionStatus::Completed => Err(RegistrationError::NotFound),
            SessionStatus::Pending | SessionStatus::Ready => Ok(session),
        }
    }

    /// Mint an authorize URL and record its pending authorization.
    async fn issue_authorization(
        &self,
        id: &SessionId,
        provider: &dyn OAuthProvider,
        params: &PlatformParams,
    ) -> Result<String, OAuthOrStore> {
        for _ in 0..MAX_STATE_ATTEMPTS {
            let AuthorizationRequest { url, pending } =
                provider.build_authorization_url(id, params)?;

            match self.store.begin_authorization(id, pending).await {
                Ok(()) => return Ok(url),
                Err(StoreError::StateCollision) => {
                    warn!(session_id = %id, platform = %provider.platform(), "OAuth state collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::StateCollision.into())
    }

    /// Begin a registration.
    #[instrument(skip_all, fields(subdomain = %details.subdomain))]
    pub async fn start(
        &self,
        details: RegistrationDetails,
        platforms: BTreeSet<Platform>,
        params: BTreeMap<Platform, PlatformParams>,
    ) -> Result<StartedRegistration, RegistrationError> {
        if platforms.is_empty() {
            return Err(RegistrationError::Validation(
                "Select at least one integration".into(),
            ));
        }
        for platform in &platforms {
            self.provider(*platform)?;
        }

        let details = validate_details(details)?;

        // Pre-flight uniqueness, before any session exists
        let available = self
            .availability
            .is_available(&details.subdomain)
            .await
            .map_err(|e| RegistrationError::Provisioning(e.to_string()))?;
        if !available {
            return Err(RegistrationError::SubdomainTaken(details.subdomain));
        }
        let email_in_use = self
            .availability
            .email_in_use(&details.admin_email)
            .await
            .map_err(|e| RegistrationError::Provisioning(e.to_string()))?;
        if email_in_use {
            return Err(RegistrationError::EmailTaken(details.admin_email));
        }

        let session = self.store.create(details, platforms.clone()).await?;

        let mut oauth_urls = BTreeMap::new();
        let mut deferred = Vec::new();
        let empty = PlatformParams::default();

        for platform in platforms {
            let provider = self.provider(platform)?;
            let platform_params = params.get(&platform).unwrap_or(&empty);

            match self
                .issue_authorization(&session.id, provider.as_ref(), platform_params)
                .await
            {
                Ok(url) => {
                    oauth_urls.insert(platform, url);
                }
                Err(OAuthOrStore::OAuth(OAuthError::MissingParam { .. })) => {
                    deferred.push(platform);
                }
                Err(e) => {
                    // Don't leave a half-initialised session behind
                    self.store.delete(&session.id).await?;
                    return Err(e.into());
                }
            }
        }

        info!(
            session_id = %session.id,
            platforms = ?oauth_urls.keys().collect::<Vec<_>>(),
            deferred = ?deferred,
            "Registration started"
        );

        Ok(StartedRegistration {
            session_id: session.id,
            expires_at: session.expires_at,
            oauth_urls,
            deferred,
        })
    }

    /// Mint a fresh authorize URL for one platform.
    ///
    /// Replaces any earlier URL for that platform; its state stops being
    /// accepted.
    #[instrument(skip_all, fields(session_id = %id, %platform))]
    pub async fn authorize(
        &self,
        id: &SessionId,
        platform: Platform,
        params: PlatformParams,
    ) -> Result<String, RegistrationError> {
        let session = self.live_session(id).await?;
        if !session.selected_platforms.contains(&platform) {
            return Err(StoreError::PlatformNotSelected(platform).into());
        }

        let provider = self.provider(platform)?;
        let url = self
            .issue_authorization(id, provider.as_ref(), &params)
            .await?;

        info!(session_id = %id, %platform, "Authorization URL issued");
        Ok(url)
    }

    /// Record the result of an OAuth callback.
    #[instrument(skip_all, fields(session_id = %id, %platform))]
    pub async fn connect(
        &self,
        id: &SessionId,
        platform: Platform,
        code: &str,
        state: &str,
        params: PlatformParams,
    ) -> Result<ConnectOutcome, RegistrationError> {
        let session = self.live_session(id).await?;
        if !session.selected_platforms.contains(&platform) {
            return Err(StoreError::PlatformNotSelected(platform).into());
        }

        let provider = self.provider(platform)?;
        let pending = session.authorizations.get(&platform).ok_or_else(|| {
            warn!(session_id = %id, %platform, "Callback without an outstanding authorization");
            RegistrationError::Csrf { platform }
        })?;

        let record = provider
            .exchange_code(pending, code, state, &params)
            .await
            .map_err(|e| {
                warn!(session_id = %id, %platform, error = %e, "OAuth exchange failed");
                RegistrationError::from(e)
            })?;

        let session = self.store.record_connection(id, record).await?;

        info!(
            session_id = %id,
            %platform,
            status = %session.status,
            "Integration connected"
        );

        Ok(ConnectOutcome {
            platform,
            connected_platforms: session.connected_platforms(),
            all_connected: session.all_connected(),
            status: session.status,
        })
    }

    /// Provision the tenant for a fully connected registration.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn complete(&self, id: &SessionId) -> Result<CompletedRegistration, RegistrationError> {
        let session = self.store.begin_completion(id).await?;
        let claim = CompletionClaim::new(self.store.clone(), id.clone());
        let request = ProvisioningRequest::from_session(&session, &self.default_plan);

        let provisioned = match self.provisioner.create_tenant(&request).await {
            Ok(provisioned) => provisioned,
            Err(ProvisioningError::Conflict(reason)) => {
                warn!(session_id = %id, %reason, "Tenant conflict, registration failed");
                if let Err(e) = self.store.mark_failed(id, &reason).await {
                    warn!(session_id = %id, error = %e, "Could not mark registration failed");
                }
                claim.disarm();
                return Err(RegistrationError::SubdomainTaken(request.subdomain));
            }
            Err(e @ ProvisioningError::Unavailable(_)) => {
                error!(session_id = %id, error = %e, "Tenant provisioning failed");
                if let Err(release) = claim.release().await {
                    warn!(session_id = %id, error = %release, "Could not release completion claim");
                }
                return Err(RegistrationError::Provisioning(e.to_string()));
            }
        };

        let ProvisionedTenant {
            tenant,
            admin_user,
            subscription,
            ..
        } = provisioned;

        if let Err(e) = self.store.delete(id).await {
            warn!(session_id = %id, error = %e, "Failed to discard completed session");
        }
        claim.disarm();

        let tokens = self.credentials.issue(&tenant, &admin_user)?;

        info!(
            session_id = %id,
            tenant_id = %tenant.id,
            subdomain = %tenant.subdomain,
            "Registration completed"
        );

        Ok(CompletedRegistration {
            tenant,
            admin_user,
            subscription,
            tokens,
        })
    }

    /// Discard a registration. Returns whether it still existed.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn abandon(&self, id: &SessionId) -> Result<bool, RegistrationError> {
        let existed = self.store.delete(id).await?;
        if existed {
            info!(session_id = %id, "Registration abandoned");
        }
        Ok(existed)
    }

    /// Current progress of a registration.
    pub async fn status(&self, id: &SessionId) -> Result<RegistrationStatusView, RegistrationError> {
        let session = self.store.get(id).await?;
        Ok(session.into())
    }
}

/// A session's completion claim.
///
/// Dropping an armed claim releases it in the background, so a
/// `complete()` cancelled mid-provisioning leaves the session retryable.
struct CompletionClaim {
    store: Arc<dyn SessionStore>,
    id: SessionId,
    armed: bool,
}

impl CompletionClaim {
    fn new(store: Arc<dyn SessionStore>, id: SessionId) -> Self {
        Self {
            store,
            id,
            armed: true,
        }
    }

    /// The store already settled the claim.
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Hand the claim back so another `complete()` may run.
    async fn release(mut self) -> Result<(), StoreError> {
        let result = self.store.end_completion(&self.id).await;
        self.armed = false;
        result
    }
}

impl Drop for CompletionClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = self.store.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(session_id = %id, "Completion abandoned, releasing claim");
                handle.spawn(async move {
                    if let Err(e) = store.end_completion(&id).await {
                        debug!(session_id = %id, error = %e, "Completion claim already gone");
                    }
                });
            }
            Err(_) => {
                error!(session_id = %id, "No runtime to release completion claim");
            }
        }
    }
}

/// Failure while issuing an authorize URL, kept unflattened so `start`
/// can defer platforms that are missing parameters.
#[derive(Debug)]
enum OAuthOrStore {
    OAuth(OAuthError),
    Store(StoreError),
}

impl From<OAuthError> for OAuthOrStore {
    fn from(e: OAuthError) -> Self {
        OAuthOrStore::OAuth(e)
    }
}

impl From<StoreError> for OAuthOrStore {
    fn from(e: StoreError) -> Self {
        OAuthOrStore::Store(e)
    }
}

impl From<OAuthOrStore> for RegistrationError {
    fn from(e: OAuthOrStore) -> Self {
        match e {
            OAuthOrStore::OAuth(e) => e.into(),
            OAuthOrStore::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::InMemoryTenantDirectory;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use mockall::mock;
    use oauth_adapters::{generate_state, TokenGrant};
    use registration_store::{
        Clock, InMemorySessionStore, ManualClock, PendingAuthorization, DEFAULT_SESSION_TTL,
    };
    use secrecy::Secret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Provider double that counts token endpoint calls.
    ///
    /// The authorization code doubles as the provider account id; the code
    /// `reject` is refused.
    struct CountingProvider {
        platform: Platform,
        needs_shop: bool,
        token_calls: AtomicUsize,
        /// Token requests wait here until every party has arrived
        rendezvous: Option<Arc<Barrier>>,
    }

    impl CountingProvider {
        fn new(platform: Platform) -> Arc<Self> {
            Arc::new(Self {
                platform,
                needs_shop: platform == Platform::Shopify,
                token_calls: AtomicUsize::new(0),
                rendezvous: None,
            })
        }

        fn gated(platform: Platform, rendezvous: Arc<Barrier>) -> Arc<Self> {
            Arc::new(Self {
                platform,
                needs_shop: platform == Platform::Shopify,
                token_calls: AtomicUsize::new(0),
                rendezvous: Some(rendezvous),
            })
        }

        fn calls(&self) -> usize {
            self.token_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OAuthProvider for CountingProvider {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn build_authorization_url(
            &self,
            _session_id: &SessionId,
            params: &PlatformParams,
        ) -> Result<AuthorizationRequest, OAuthError> {
            if self.needs_shop && params.shop.is_none() {
                return Err(OAuthError::MissingParam {
                    platform: self.platform,
                    param: "shop",
                });
            }

            let state = generate_state();
            Ok(AuthorizationRequest {
                url: format!("https://{}.test/authorize?state={}", self.platform, state),
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
            _pending: &PendingAuthorization,
            code: &str,
        ) -> Result<TokenGrant, OAuthError> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(rendezvous) = &self.rendezvous {
                rendezvous.wait().await;
            }
            if code == "reject" {
                return Err(OAuthError::ProviderRejected {
                    platform: self.platform,
                    message: "invalid_grant".into(),
                });
            }

            Ok(TokenGrant {
                access_token: Secret::new(format!("token-for-{}", code)),
                refresh_token: None,
                expires_in: None,
                scopes: vec![],
                account_id: code.to_string(),
            })
        }
    }

    /// Provisioner that fails a set number of times before delegating.
    struct FlakyProvisioner {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        inner: InMemoryTenantDirectory,
    }

    impl FlakyProvisioner {
        fn failing(times: usize) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(times),
                calls: AtomicUsize::new(0),
                inner: InMemoryTenantDirectory::new(),
            })
        }
    }

    #[async_trait]
    impl TenantProvisioner for FlakyProvisioner {
        async fn create_tenant(
            &self,
            request: &ProvisioningRequest,
        ) -> Result<ProvisionedTenant, ProvisioningError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProvisioningError::Unavailable("database offline".into()));
            }
            self.inner.create_tenant(request).await
        }
    }

    /// Provisioner whose first call never returns.
    struct HangOnceProvisioner {
        calls: AtomicUsize,
        inner: InMemoryTenantDirectory,
    }

    #[async_trait]
    impl TenantProvisioner for HangOnceProvisioner {
        async fn create_tenant(
            &self,
            request: &ProvisioningRequest,
        ) -> Result<ProvisionedTenant, ProvisioningError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            self.inner.create_tenant(request).await
        }
    }

    /// Provisioner that lets the session expire and get swept, then
    /// reports a conflict.
    struct SweptThenConflict {
        store: Arc<InMemorySessionStore>,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl TenantProvisioner for SweptThenConflict {
        async fn create_tenant(
            &self,
            request: &ProvisioningRequest,
        ) -> Result<ProvisionedTenant, ProvisioningError> {
            self.clock.advance(ChronoDuration::minutes(31));
            assert_eq!(self.store.sweep().await, 1);
            Err(ProvisioningError::Conflict(format!(
                "subdomain {} is taken",
                request.subdomain
            )))
        }
    }

    mock! {
        pub Availability {}

        #[async_trait]
        impl SubdomainAvailabilityChecker for Availability {
            async fn is_available(&self, subdomain: &str) -> Result<bool, ProvisioningError>;
            async fn email_in_use(&self, email: &str) -> Result<bool, ProvisioningError>;
        }
    }

    struct Harness {
        orchestrator: RegistrationOrchestrator,
        store: Arc<InMemorySessionStore>,
        clock: Arc<ManualClock>,
        etsy: Arc<CountingProvider>,
        shopify: Arc<CountingProvider>,
    }

    fn harness_with(
        availability: Arc<dyn SubdomainAvailabilityChecker>,
        provisioner: Arc<dyn TenantProvisioner>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::with_clock(
            DEFAULT_SESSION_TTL,
            clock.clone(),
        ));
        let etsy = CountingProvider::new(Platform::Etsy);
        let shopify = CountingProvider::new(Platform::Shopify);
        let providers = ProviderRegistry::new()
            .with(etsy.clone())
            .with(shopify.clone());

        let orchestrator = RegistrationOrchestrator::new(
            store.clone(),
            providers,
            availability,
            provisioner,
            CredentialIssuer::ephemeral(Duration::from_secs(900), Duration::from_secs(3600)),
        );

        Harness {
            orchestrator,
            store,
            clock,
            etsy,
            shopify,
        }
    }

    fn harness() -> Harness {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        harness_with(directory.clone(), directory)
    }

    fn details(subdomain: &str) -> RegistrationDetails {
        RegistrationDetails {
            company_name: "Acme Prints".into(),
            subdomain: subdomain.into(),
            admin_first_name: "Ada".into(),
            admin_last_name: "Lovelace".into(),
            admin_email: format!("ada@{}.test", subdomain),
            admin_password: Secret::new("correct horse".into()),
        }
    }

    fn both() -> BTreeSet<Platform> {
        BTreeSet::from([Platform::Etsy, Platform::Shopify])
    }

    fn shop_params() -> BTreeMap<Platform, PlatformParams> {
        BTreeMap::from([(Platform::Shopify, PlatformParams::shop("acme"))])
    }

    fn state_of(url: &str) -> String {
        url.split("state=").nth(1).unwrap().to_string()
    }

    async fn start_both(h: &Harness, subdomain: &str) -> StartedRegistration {
        h.orchestrator
            .start(details(subdomain), both(), shop_params())
            .await
            .unwrap()
    }

    async fn connect(
        h: &Harness,
        started: &StartedRegistration,
        platform: Platform,
        code: &str,
    ) -> Result<ConnectOutcome, RegistrationError> {
        let state = state_of(&started.oauth_urls[&platform]);
        h.orchestrator
            .connect(
                &started.session_id,
                platform,
                code,
                &state,
                PlatformParams::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_start_issues_url_per_platform() {
        let h = harness();
        let started = start_both(&h, "acme").await;

        assert_eq!(started.oauth_urls.len(), 2);
        assert!(started.deferred.is_empty());
        assert_ne!(
            state_of(&started.oauth_urls[&Platform::Etsy]),
            state_of(&started.oauth_urls[&Platform::Shopify])
        );
        assert_eq!(
            started.expires_at - h.clock.now(),
            ChronoDuration::minutes(30)
        );

        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Pending);
        assert!(status.connected_platforms.is_empty());
    }

    #[tokio::test]
    async fn test_full_registration() {
        let h = harness();
        let started = start_both(&h, "acme").await;

        let outcome = connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        assert!(!outcome.all_connected);
        assert_eq!(outcome.status, SessionStatus::Pending);

        let outcome = connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();
        assert!(outcome.all_connected);
        assert_eq!(outcome.status, SessionStatus::Ready);

        let completed = h.orchestrator.complete(&started.session_id).await.unwrap();
        assert_eq!(completed.tenant.subdomain, "acme");
        assert_eq!(completed.admin_user.email, "ada@acme.test");
        assert_eq!(completed.subscription.plan, "starter");
        assert!(!completed.tokens.access_token.is_empty());

        assert!(matches!(
            h.orchestrator.status(&started.session_id).await,
            Err(RegistrationError::NotFound)
        ));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_complete_with_missing_integration() {
        let h = harness();
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();

        let result = h.orchestrator.complete(&started.session_id).await;
        match result {
            Err(RegistrationError::IncompleteIntegrations { missing }) => {
                assert_eq!(missing, vec![Platform::Shopify]);
            }
            other => panic!("expected incomplete integrations, got {:?}", other.map(|_| ())),
        }

        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Pending);
        assert_eq!(status.connected_platforms, vec![Platform::Etsy]);
    }

    #[tokio::test]
    async fn test_csrf_mismatch_skips_token_exchange() {
        let h = harness();
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();

        let result = h
            .orchestrator
            .connect(
                &started.session_id,
                Platform::Shopify,
                "acme.myshopify.com",
                "forged-state",
                PlatformParams::default(),
            )
            .await;

        assert!(matches!(
            result,
            Err(RegistrationError::Csrf {
                platform: Platform::Shopify
            })
        ));
        assert_eq!(h.shopify.calls(), 0);

        // Etsy progress is untouched and the genuine callback still works
        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert_eq!(status.connected_platforms, vec![Platform::Etsy]);
        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unselected_platform_rejected() {
        let h = harness();
        let started = h
            .orchestrator
            .start(
                details("acme"),
                BTreeSet::from([Platform::Etsy]),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        let result = h
            .orchestrator
            .connect(
                &started.session_id,
                Platform::Shopify,
                "code",
                "state",
                PlatformParams::default(),
            )
            .await;

        assert!(matches!(result, Err(RegistrationError::Validation(_))));
        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert!(status.connected_platforms.is_empty());
        assert_eq!(h.shopify.calls(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_latest() {
        let h = harness();
        let started = h
            .orchestrator
            .start(
                details("acme"),
                BTreeSet::from([Platform::Etsy]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        connect(&h, &started, Platform::Etsy, "first-shop").await.unwrap();

        // A used state cannot be replayed
        assert!(matches!(
            connect(&h, &started, Platform::Etsy, "first-shop").await,
            Err(RegistrationError::Csrf { .. })
        ));

        let url = h
            .orchestrator
            .authorize(&started.session_id, Platform::Etsy, PlatformParams::default())
            .await
            .unwrap();
        h.orchestrator
            .connect(
                &started.session_id,
                Platform::Etsy,
                "second-shop",
                &state_of(&url),
                PlatformParams::default(),
            )
            .await
            .unwrap();

        let session = h.store.get(&started.session_id).await.unwrap();
        assert_eq!(session.connections.len(), 1);
        assert_eq!(
            session.connections[&Platform::Etsy].provider_account_id,
            "second-shop"
        );
    }

    #[tokio::test]
    async fn test_connect_order_does_not_matter() {
        let h = harness();
        let started = start_both(&h, "acme").await;

        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();
        let outcome = connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();

        assert_eq!(outcome.status, SessionStatus::Ready);
        assert_eq!(
            outcome.connected_platforms,
            vec![Platform::Etsy, Platform::Shopify]
        );
    }

    #[tokio::test]
    async fn test_provider_rejection_is_retryable() {
        let h = harness();
        let started = start_both(&h, "acme").await;

        assert!(matches!(
            connect(&h, &started, Platform::Etsy, "reject").await,
            Err(RegistrationError::Provider {
                platform: Platform::Etsy,
                ..
            })
        ));

        // Same authorization is still outstanding
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        assert_eq!(h.etsy.calls(), 2);
    }

    #[tokio::test]
    async fn test_provisioning_failure_can_be_retried() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let provisioner = FlakyProvisioner::failing(1);
        let h = harness_with(directory, provisioner.clone());
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.complete(&started.session_id).await,
            Err(RegistrationError::Provisioning(_))
        ));
        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Ready);
        assert_eq!(provisioner.inner.tenant_count().await, 0);

        let completed = h.orchestrator.complete(&started.session_id).await.unwrap();
        assert_eq!(completed.tenant.subdomain, "acme");
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.inner.tenant_count().await, 1);

        // Retrying did not repeat any OAuth exchange
        assert_eq!(h.etsy.calls(), 1);
        assert_eq!(h.shopify.calls(), 1);
    }

    #[tokio::test]
    async fn test_conflict_during_provisioning_fails_session() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let h = harness_with(directory.clone(), directory.clone());

        let first = start_both(&h, "acme").await;
        let second = h
            .orchestrator
            .start(
                details("acme"),
                BTreeSet::from([Platform::Etsy]),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        connect(&h, &first, Platform::Etsy, "etsy-shop-1").await.unwrap();
        connect(&h, &first, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();
        h.orchestrator.complete(&first.session_id).await.unwrap();

        connect(&h, &second, Platform::Etsy, "etsy-shop-2").await.unwrap();
        assert!(matches!(
            h.orchestrator.complete(&second.session_id).await,
            Err(RegistrationError::SubdomainTaken(_))
        ));

        let status = h.orchestrator.status(&second.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(matches!(
            h.orchestrator
                .authorize(&second.session_id, Platform::Etsy, PlatformParams::default())
                .await,
            Err(RegistrationError::Failed(_))
        ));
        assert_eq!(directory.tenant_count().await, 1);
    }

    #[tokio::test]
    async fn test_expired_session_rejected_before_sweep() {
        let h = harness();
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();

        h.clock
            .advance(ChronoDuration::minutes(30) + ChronoDuration::seconds(1));

        assert!(matches!(
            connect(&h, &started, Platform::Shopify, "acme.myshopify.com").await,
            Err(RegistrationError::Expired)
        ));
        assert!(matches!(
            h.orchestrator.complete(&started.session_id).await,
            Err(RegistrationError::Expired)
        ));
        assert_eq!(h.shopify.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_details_create_nothing() {
        let h = harness();
        let mut bad = details("acme");
        bad.admin_email = "not-an-email".into();

        assert!(matches!(
            h.orchestrator.start(bad, both(), shop_params()).await,
            Err(RegistrationError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator
                .start(details("acme"), BTreeSet::new(), BTreeMap::new())
                .await,
            Err(RegistrationError::Validation(_))
        ));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_taken_subdomain_checked_before_session() {
        let mut availability = MockAvailability::new();
        availability
            .expect_is_available()
            .times(1)
            .returning(|_| Ok(false));
        availability.expect_email_in_use().never();

        let h = harness_with(
            Arc::new(availability),
            Arc::new(InMemoryTenantDirectory::new()),
        );

        assert!(matches!(
            h.orchestrator.start(details("ACME"), both(), shop_params()).await,
            Err(RegistrationError::SubdomainTaken(subdomain)) if subdomain == "acme"
        ));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_email_in_use_rejected() {
        let mut availability = MockAvailability::new();
        availability.expect_is_available().returning(|_| Ok(true));
        availability
            .expect_email_in_use()
            .times(1)
            .returning(|_| Ok(true));

        let h = harness_with(
            Arc::new(availability),
            Arc::new(InMemoryTenantDirectory::new()),
        );

        assert!(matches!(
            h.orchestrator.start(details("acme"), both(), shop_params()).await,
            Err(RegistrationError::EmailTaken(_))
        ));
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_shopify_deferred_until_shop_known() {
        let h = harness();
        let started = h
            .orchestrator
            .start(details("acme"), both(), BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(started.deferred, vec![Platform::Shopify]);
        assert!(started.oauth_urls.contains_key(&Platform::Etsy));

        assert!(matches!(
            h.orchestrator
                .authorize(&started.session_id, Platform::Shopify, PlatformParams::default())
                .await,
            Err(RegistrationError::Validation(_))
        ));

        let url = h
            .orchestrator
            .authorize(
                &started.session_id,
                Platform::Shopify,
                PlatformParams::shop("acme"),
            )
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .connect(
                &started.session_id,
                Platform::Shopify,
                "acme.myshopify.com",
                &state_of(&url),
                PlatformParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.connected_platforms, vec![Platform::Shopify]);
    }

    #[tokio::test]
    async fn test_second_complete_rejected_while_in_progress() {
        let h = harness();
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();

        h.store.begin_completion(&started.session_id).await.unwrap();

        assert!(matches!(
            h.orchestrator.complete(&started.session_id).await,
            Err(RegistrationError::CompletionInProgress)
        ));
    }

    #[tokio::test]
    async fn test_abandon_is_idempotent() {
        let h = harness();
        let started = start_both(&h, "acme").await;

        assert!(h.orchestrator.abandon(&started.session_id).await.unwrap());
        assert!(!h.orchestrator.abandon(&started.session_id).await.unwrap());
        assert!(matches!(
            connect(&h, &started, Platform::Etsy, "etsy-shop-1").await,
            Err(RegistrationError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_disabled_platform_rejected() {
        let h = harness();
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let orchestrator = RegistrationOrchestrator::new(
            h.store.clone(),
            ProviderRegistry::new().with(h.etsy.clone()),
            directory.clone(),
            directory,
            CredentialIssuer::ephemeral(Duration::from_secs(60), Duration::from_secs(60)),
        );

        assert!(matches!(
            orchestrator.start(details("acme"), both(), shop_params()).await,
            Err(RegistrationError::Validation(_))
        ));
        assert_eq!(orchestrator.platforms(), vec![Platform::Etsy]);
    }

    #[tokio::test]
    async fn test_cancelled_completion_can_be_retried() {
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let provisioner = Arc::new(HangOnceProvisioner {
            calls: AtomicUsize::new(0),
            inner: InMemoryTenantDirectory::new(),
        });
        let h = harness_with(directory, provisioner.clone());
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();

        // Caller gives up while provisioning is in flight
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            h.orchestrator.complete(&started.session_id),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.store.get(&started.session_id).await.unwrap().completing {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("completion claim was not released");

        let status = h.orchestrator.status(&started.session_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Ready);

        let completed = h.orchestrator.complete(&started.session_id).await.unwrap();
        assert_eq!(completed.tenant.subdomain, "acme");
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.etsy.calls(), 1);
        assert_eq!(h.shopify.calls(), 1);
    }

    #[tokio::test]
    async fn test_conflict_after_sweep_still_reports_taken_subdomain() {
        let h = harness();
        let started = start_both(&h, "acme").await;
        connect(&h, &started, Platform::Etsy, "etsy-shop-1").await.unwrap();
        connect(&h, &started, Platform::Shopify, "acme.myshopify.com")
            .await
            .unwrap();

        let directory = Arc::new(InMemoryTenantDirectory::new());
        let orchestrator = RegistrationOrchestrator::new(
            h.store.clone(),
            ProviderRegistry::new()
                .with(h.etsy.clone())
                .with(h.shopify.clone()),
            directory,
            Arc::new(SweptThenConflict {
                store: h.store.clone(),
                clock: h.clock.clone(),
            }),
            CredentialIssuer::ephemeral(Duration::from_secs(60), Duration::from_secs(60)),
        );

        match orchestrator.complete(&started.session_id).await {
            Err(RegistrationError::SubdomainTaken(subdomain)) => assert_eq!(subdomain, "acme"),
            other => panic!("expected SubdomainTaken, got {:?}", other.map(|c| c.tenant)),
        }
        assert!(matches!(
            h.orchestrator.status(&started.session_id).await,
            Err(RegistrationError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_connects_do_not_hold_session_during_exchange() {
        // Both token requests must be in flight at once to get past the barrier
        let rendezvous = Arc::new(Barrier::new(2));
        let etsy = CountingProvider::gated(Platform::Etsy, rendezvous.clone());
        let shopify = CountingProvider::gated(Platform::Shopify, rendezvous);

        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::with_clock(
            DEFAULT_SESSION_TTL,
            clock.clone(),
        ));
        let directory = Arc::new(InMemoryTenantDirectory::new());
        let orchestrator = Arc::new(RegistrationOrchestrator::new(
            store.clone(),
            ProviderRegistry::new().with(etsy.clone()).with(shopify.clone()),
            directory.clone(),
            directory,
            CredentialIssuer::ephemeral(Duration::from_secs(60), Duration::from_secs(60)),
        ));

        let started = orchestrator
            .start(details("acme"), both(), shop_params())
            .await
            .unwrap();

        let tasks: Vec<_> = [
            (Platform::Etsy, "etsy-shop-1"),
            (Platform::Shopify, "acme.myshopify.com"),
        ]
        .into_iter()
        .map(|(platform, code)| {
            let orchestrator = orchestrator.clone();
            let id = started.session_id.clone();
            let state = state_of(&started.oauth_urls[&platform]);
            tokio::spawn(async move {
                orchestrator
                    .connect(&id, platform, code, &state, PlatformParams::default())
                    .await
            })
        })
        .collect();

        let outcomes = tokio::time::timeout(Duration::from_secs(5), join_connects(tasks))
            .await
            .expect("connects serialized across the token exchange");
        for outcome in outcomes {
            outcome.unwrap();
        }

        let session = store.get(&started.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.connections.len(), 2);
        assert_eq!(etsy.calls(), 1);
        assert_eq!(shopify.calls(), 1);
    }

    async fn join_connects(
        tasks: Vec<tokio::task::JoinHandle<Result<ConnectOutcome, RegistrationError>>>,
    ) -> Vec<Result<ConnectOutcome, RegistrationError>> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        outcomes
    }
}
