//! Session store trait and its in-process implementation.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::types::*;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Default lifetime of a registration session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Keyed, time-boxed store of in-flight registrations.
///
/// Every mutation is applied under mutual exclusion for the session it
/// touches. Implementations never hold that exclusion across caller I/O:
/// each method is a short read-modify-write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a new session with the store's TTL.
    async fn create(
        &self,
        details: RegistrationDetails,
        selected_platforms: BTreeSet<Platform>,
    ) -> Result<RegistrationSession, StoreError>;

    /// Look up a live session.
    async fn get(&self, id: &SessionId) -> Result<RegistrationSession, StoreError>;

    /// Record a freshly minted authorize URL for one platform.
    ///
    /// Replaces any earlier pending authorization for that platform and
    /// rejects a state value that is live anywhere in the store.
    async fn begin_authorization(
        &self,
        id: &SessionId,
        pending: PendingAuthorization,
    ) -> Result<(), StoreError>;

    /// Record a successful connection, consuming the pending authorization
    /// whose state it carries. Promotes PENDING to READY when complete.
    async fn record_connection(
        &self,
        id: &SessionId,
        record: ConnectionRecord,
    ) -> Result<RegistrationSession, StoreError>;

    /// Claim the session for provisioning. Only one claim may be held.
    async fn begin_completion(&self, id: &SessionId) -> Result<RegistrationSession, StoreError>;

    /// Release a completion claim after a failed provisioning attempt.
    async fn end_completion(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Move the session to the terminal FAILED state.
    async fn mark_failed(&self, id: &SessionId, reason: &str) -> Result<(), StoreError>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError>;

    /// Remove every session past its deadline. Returns how many went.
    async fn sweep(&self) -> usize;

    /// Number of sessions currently held.
    async fn len(&self) -> usize;
}

struct SessionSlot {
    session: RegistrationSession,
    removed: bool,
}

struct SessionEntry {
    expires_at: DateTime<Utc>,
    slot: Mutex<SessionSlot>,
}

/// In-process session store.
///
/// Sessions live in a map of individually locked entries; the map lock is
/// only held to find, insert or remove an entry. A separate index maps
/// every outstanding OAuth state to its owner so nonces stay unique
/// across sessions. Pair with [`crate::SessionSweeper`] to reclaim
/// abandoned sessions.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    states: Mutex<HashMap<String, (SessionId, Platform)>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl InMemorySessionStore {
    /// Create a store that uses the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a store with an explicit time source.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| {
            warn!("Session TTL {:?} out of range, using default", ttl);
            chrono::Duration::minutes(30)
        });

        info!("In-memory session store initialized (ttl={})", ttl);

        Self {
            sessions: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    async fn entry(&self, id: &SessionId) -> Result<Arc<SessionEntry>, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Check the slot can still be mutated, flagging it EXPIRED if the
    /// deadline has passed.
    fn ensure_live(&self, slot: &mut SessionSlot) -> Result<(), StoreError> {
        let id = slot.session.id.to_string();

        if slot.removed {
            return Err(StoreError::NotFound(id));
        }

        if slot.session.is_expired_at(self.clock.now()) {
            slot.session.status = SessionStatus::Expired;
            return Err(StoreError::Expired(id));
        }

        if slot.session.status.is_terminal() {
            return Err(StoreError::Terminal {
                id,
                status: slot.session.status,
            });
        }

        Ok(())
    }

    /// Drop state index entries owned by `id`.
    async fn release_states<'a>(&self, id: &SessionId, states: impl Iterator<Item = &'a str>) {
        let mut index = self.states.lock().await;
        for state in states {
            if index.get(state).is_some_and(|(owner, _)| owner == id) {
                index.remove(state);
            }
        }
    }

    /// Mark a detached entry as removed and free its states.
    async fn retire(&self, entry: &SessionEntry) {
        let mut slot = entry.slot.lock().await;
        slot.removed = true;
        let id = slot.session.id.clone();
        let states: Vec<String> = slot.session.live_states().map(String::from).collect();
        slot.session.authorizations.clear();
        drop(slot);

        self.release_states(&id, states.iter().map(String::as_str))
            .await;
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    #[instrument(skip(self, details), fields(subdomain = %details.subdomain))]
    async fn create(
        &self,
        details: RegistrationDetails,
        selected_platforms: BTreeSet<Platform>,
    ) -> Result<RegistrationSession, StoreError> {
        if selected_platforms.is_empty() {
            return Err(StoreError::Validation(
                "At least one integration must be selected".into(),
            ));
        }

        let session =
            RegistrationSession::new(details, selected_platforms, self.clock.now(), self.ttl);
        let entry = Arc::new(SessionEntry {
            expires_at: session.expires_at,
            slot: Mutex::new(SessionSlot {
                session: session.clone(),
                removed: false,
            }),
        });

        self.sessions.write().await.insert(session.id.clone(), entry);

        debug!(
            session_id = %session.id,
            expires_at = %session.expires_at,
            "Registration session created"
        );

        Ok(session)
    }

    async fn get(&self, id: &SessionId) -> Result<RegistrationSession, StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;

        if slot.removed {
            return Err(StoreError::NotFound(id.to_string()));
        }

        if slot.session.is_expired_at(self.clock.now()) {
            slot.session.status = SessionStatus::Expired;
            return Err(StoreError::Expired(id.to_string()));
        }

        Ok(slot.session.clone())
    }

    #[instrument(skip(self, pending), fields(platform = %pending.platform))]
    async fn begin_authorization(
        &self,
        id: &SessionId,
        pending: PendingAuthorization,
    ) -> Result<(), StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;
        self.ensure_live(&mut slot)?;

        let platform = pending.platform;
        if !slot.session.selected_platforms.contains(&platform) {
            return Err(StoreError::PlatformNotSelected(platform));
        }

        {
            let mut index = self.states.lock().await;
            if index.contains_key(&pending.state) {
                warn!(session_id = %id, %platform, "OAuth state collision");
                return Err(StoreError::StateCollision);
            }
            index.insert(pending.state.clone(), (id.clone(), platform));

            if let Some(previous) = slot.session.authorizations.get(&platform) {
                if index
                    .get(&previous.state)
                    .is_some_and(|(owner, _)| owner == id)
                {
                    index.remove(&previous.state);
                }
            }
        }

        slot.session.authorizations.insert(platform, pending);
        debug!(session_id = %id, %platform, "Authorization issued");

        Ok(())
    }

    #[instrument(skip(self, record), fields(platform = %record.platform))]
    async fn record_connection(
        &self,
        id: &SessionId,
        record: ConnectionRecord,
    ) -> Result<RegistrationSession, StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;
        self.ensure_live(&mut slot)?;

        let platform = record.platform;
        if !slot.session.selected_platforms.contains(&platform) {
            return Err(StoreError::PlatformNotSelected(platform));
        }

        // The state must still be outstanding; a consumed or superseded
        // state cannot be redeemed twice.
        match slot.session.authorizations.get(&platform) {
            Some(pending) if pending.state == record.oauth_state => {}
            _ => return Err(StoreError::StateMismatch(platform)),
        }

        if let Some(pending) = slot.session.authorizations.remove(&platform) {
            self.release_states(id, std::iter::once(pending.state.as_str()))
                .await;
        }

        let replaced = slot.session.connections.insert(platform, record).is_some();
        let became_ready = slot.session.refresh_status();

        info!(
            session_id = %id,
            %platform,
            replaced,
            status = %slot.session.status,
            "Integration connected"
        );
        if became_ready {
            info!(session_id = %id, "All integrations connected, registration ready");
        }

        Ok(slot.session.clone())
    }

    async fn begin_completion(&self, id: &SessionId) -> Result<RegistrationSession, StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;
        self.ensure_live(&mut slot)?;

        if slot.session.status != SessionStatus::Ready {
            return Err(StoreError::Incomplete {
                missing: slot.session.missing_platforms(),
            });
        }

        if slot.session.completing {
            return Err(StoreError::CompletionInProgress(id.to_string()));
        }

        slot.session.completing = true;
        Ok(slot.session.clone())
    }

    async fn end_completion(&self, id: &SessionId) -> Result<(), StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;

        if slot.removed {
            return Err(StoreError::NotFound(id.to_string()));
        }

        slot.session.completing = false;
        Ok(())
    }

    async fn mark_failed(&self, id: &SessionId, reason: &str) -> Result<(), StoreError> {
        let entry = self.entry(id).await?;
        let mut slot = entry.slot.lock().await;

        if slot.removed {
            return Err(StoreError::NotFound(id.to_string()));
        }

        slot.session.status = SessionStatus::Failed;
        slot.session.completing = false;
        slot.session.failure_reason = Some(reason.to_string());
        let states: Vec<String> = slot.session.live_states().map(String::from).collect();
        slot.session.authorizations.clear();
        drop(slot);

        self.release_states(id, states.iter().map(String::as_str))
            .await;

        warn!(session_id = %id, reason, "Registration failed");
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let entry = self.sessions.write().await.remove(id);

        match entry {
            Some(entry) => {
                self.retire(&entry).await;
                debug!(session_id = %id, "Registration session deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self) -> usize {
        let now = self.clock.now();

        let expired: Vec<Arc<SessionEntry>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, entry)| now > entry.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for entry in &expired {
            {
                let mut slot = entry.slot.lock().await;
                if !slot.session.status.is_terminal() {
                    slot.session.status = SessionStatus::Expired;
                }
            }
            self.retire(entry).await;
        }

        if !expired.is_empty() {
            debug!("Swept {} expired registration sessions", expired.len());
        }

        expired.len()
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
