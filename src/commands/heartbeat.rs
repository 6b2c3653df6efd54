//! Link keep-alive bookkeeping.
//!
//! The board drops a host that stays silent, so while a session is up the
//! host sends an empty generic message whenever the link has been idle for
//! [`HEARTBEAT_INTERVAL`]. Traffic in either direction counts as activity.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Idle time after which a heartbeat is sent.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Last-activity timestamp shared by the sender and the processing task.
#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    last_activity: Arc<Mutex<Instant>>,
}

impl HeartbeatTimer {
    /// Creates a timer whose last activity is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Records activity now.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time of the last recorded activity.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// When a heartbeat becomes due if nothing else happens.
    #[must_use]
    pub fn deadline(&self, interval: Duration) -> Instant {
        self.last_activity() + interval
    }

    /// Returns true once the link has been idle for `interval`.
    #[must_use]
    pub fn due(&self, interval: Duration) -> bool {
        Instant::now() >= self.deadline(interval)
    }
}

impl Default for HeartbeatTimer {
    fn default() -> Self {
        Self::new()
    }
}
