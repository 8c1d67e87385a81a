//! Periodic reclamation of expired registration sessions.
//!
//! Abandoned signups are never explicitly closed by the browser, so this
//! task is the only thing that frees them.

use crate::store::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that removes sessions past their deadline.
pub struct SessionSweeper {
    store: Arc<dyn SessionStore>,
    interval: Duration,
}

impl SessionSweeper {
    pub fn new(store: Arc<dyn SessionStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run a single sweep cycle.
    pub async fn sweep_once(&self) -> usize {
        self.store.sweep().await
    }

    /// Run the sweeper indefinitely, sleeping between cycles.
    pub async fn run(&self) {
        info!("Starting session sweeper, interval: {:?}", self.interval);

        loop {
            tokio::time::sleep(self.interval).await;

            let removed = self.sweep_once().await;
            if removed > 0 {
                info!("Session sweep removed {} expired registrations", removed);
            } else {
                debug!("Session sweep found nothing to remove");
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Spawn the session sweeper as a background task.
///
/// Abort the returned handle to stop it.
pub fn spawn_sweeper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let sweeper = SessionSweeper::new(store, interval);

    tokio::spawn(async move {
        sweeper.run().await;
    })
}
