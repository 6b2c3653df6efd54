//! Rate-limited controller status delivery.
//!
//! Telemetry can arrive far faster than anyone needs to react to it. The
//! emitter folds every sample into a [`ControllerStatus`] and publishes the
//! state at most once per window. A change inside the window schedules one
//! trailing emission at the end of the window; further changes before it
//! fires only update the state it will carry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::{ControllerStatus, StatusSample};

/// Minimum spacing between status emissions (60 Hz, rounded up).
pub const STATUS_EMIT_INTERVAL: Duration = Duration::from_nanos(16_666_667);

/// Folds telemetry into controller status and publishes it rate-limited.
#[derive(Debug)]
pub struct StatusEmitter {
    status: ControllerStatus,
    window: Duration,
    last_emit: Option<Instant>,
    pending: Option<Instant>,
    emissions: u64,
    sender: Arc<watch::Sender<ControllerStatus>>,
}

impl StatusEmitter {
    /// Creates an emitter publishing on `sender`.
    #[must_use]
    pub fn new(sender: Arc<watch::Sender<ControllerStatus>>, window: Duration) -> Self {
        let status = *sender.borrow();
        Self {
            status,
            window,
            last_emit: None,
            pending: None,
            emissions: 0,
            sender,
        }
    }

    /// Latest folded state, whether or not it has been published.
    #[must_use]
    pub const fn status(&self) -> &ControllerStatus {
        &self.status
    }

    /// Number of emissions so far.
    #[must_use]
    pub const fn emissions(&self) -> u64 {
        self.emissions
    }

    /// When the scheduled trailing emission is due, if one is scheduled.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Folds a sample in at `now`.
    ///
    /// Returns the published state if this emitted immediately.
    pub fn apply(&mut self, sample: &StatusSample, now: Instant) -> Option<ControllerStatus> {
        if self.status.apply(sample) {
            self.offer(now)
        } else {
            None
        }
    }

    /// Sets both encoders to zero and publishes the change.
    pub fn reset_encoders(&mut self, now: Instant) -> Option<ControllerStatus> {
        self.status.reset_encoders();
        self.offer(now)
    }

    /// Publishes the pending state if its time has come.
    pub fn fire(&mut self, now: Instant) -> Option<ControllerStatus> {
        match self.pending {
            Some(due) if now >= due => {
                self.pending = None;
                Some(self.emit(now))
            }
            _ => None,
        }
    }

    fn offer(&mut self, now: Instant) -> Option<ControllerStatus> {
        if self.pending.is_some() {
            return None;
        }

        match self.last_emit {
            Some(last) if now < last + self.window => {
                self.pending = Some(last + self.window);
                None
            }
            _ => Some(self.emit(now)),
        }
    }

    fn emit(&mut self, now: Instant) -> ControllerStatus {
        self.last_emit = Some(now);
        self.emissions += 1;
        self.sender.send_replace(self.status);
        self.status
    }
}
