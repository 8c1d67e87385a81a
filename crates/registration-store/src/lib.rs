//! In-flight tenant registration sessions.
//!
//! A registration session tracks one signup attempt from the moment the
//! company details are submitted until the tenant is provisioned. Sessions
//! are deliberately ephemeral: they carry a hard deadline, are never
//! written to durable storage and are reclaimed by a background sweeper
//! once abandoned.

mod clock;
mod error;
mod store;
mod sweeper;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use store::{InMemorySessionStore, SessionStore, DEFAULT_SESSION_TTL};
pub use sweeper::{spawn_sweeper, SessionSweeper, DEFAULT_SWEEP_INTERVAL};
pub use types::*;
