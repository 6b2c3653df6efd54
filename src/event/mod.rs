//! Event system for async message handling.
//!
//! Everything the driver sends, and every change of the link, is published
//! as an [`Event`] on a broadcast channel. Controller status travels
//! separately, rate-limited, through [`emitter::StatusEmitter`].

pub mod emitter;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::protocol::Prefix;
use crate::transport::DisconnectReason;
use crate::types::{DriverConfiguration, RecordKind, StatusSample, SyncConfiguration};

pub use emitter::{STATUS_EMIT_INTERVAL, StatusEmitter};

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Handshake completed.
    Connected { port: String, driver_id: String },
    /// Link lost or closed.
    Disconnected { reason: DisconnectReason },
    /// Free-form text from the driver.
    DriverMessage(String),
    /// Empty generic message.
    Heartbeat,
    /// Handshake response string.
    Handshake(String),
    /// Driver configuration received.
    Configuration(Box<DriverConfiguration>),
    /// Sync configuration received.
    Sync(Box<SyncConfiguration>),
    /// Driver identity string received.
    DriverId(String),
    /// Download stream completed (prefix byte included).
    StreamReceived(Bytes),
    /// Download stream missed its deadline.
    StreamTimedOut { received: usize, expected: usize },
    /// Download stream was cut short by a generic message.
    StreamInterrupted,
    /// Controller status sample received.
    Telemetry(StatusSample),
    /// The driver asked to close the link.
    DisconnectRequested,
    /// Acknowledgement or raw reply body for a prefix.
    Reply { prefix: Prefix, data: Bytes },
    /// A record failed its checksum.
    ChecksumMismatch { record: RecordKind, sum: u8 },
    /// A record could not be decoded.
    MalformedRecord { record: RecordKind, reason: String },
    /// A frame arrived while a different reply was expected.
    ProtocolMismatch { expected: Prefix, received: Prefix },
}

impl Event {
    /// Returns the prefix of the frame this event came from, if any.
    #[must_use]
    pub const fn prefix(&self) -> Option<Prefix> {
        match self {
            Self::DriverMessage(_) | Self::Heartbeat => Some(Prefix::Message),
            Self::Handshake(_) => Some(Prefix::Handshake),
            Self::Configuration(_) => Some(Prefix::DownloadConfig),
            Self::Sync(_) => Some(Prefix::DownloadSync),
            Self::DriverId(_) => Some(Prefix::DownloadId),
            Self::StreamReceived(_) | Self::StreamTimedOut { .. } | Self::StreamInterrupted => {
                Some(Prefix::DownloadStream)
            }
            Self::Telemetry(_) => Some(Prefix::Telemetry),
            Self::DisconnectRequested => Some(Prefix::Disconnect),
            Self::Reply { prefix, .. } => Some(*prefix),
            Self::ChecksumMismatch { record, .. } | Self::MalformedRecord { record, .. } => {
                match record {
                    RecordKind::Configuration => Some(Prefix::DownloadConfig),
                    RecordKind::Sync => Some(Prefix::DownloadSync),
                    RecordKind::Telemetry => Some(Prefix::Telemetry),
                }
            }
            Self::Connected { .. } | Self::Disconnected { .. } | Self::ProtocolMismatch { .. } => {
                None
            }
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: Option<EventFilter>,
}

impl Subscription {
    /// Receives the next event that passes the subscription's filter.
    ///
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().is_none_or(|f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("subscription lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific event types.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by frame prefix.
    pub prefixes: Option<Vec<Prefix>>,
    /// Also pass link events (connect, disconnect, protocol mismatch).
    pub link_events: bool,
}

impl EventFilter {
    /// Creates a filter for events from specific prefixes.
    #[must_use]
    pub const fn prefixes(prefixes: Vec<Prefix>) -> Self {
        Self {
            prefixes: Some(prefixes),
            link_events: false,
        }
    }

    /// Creates a filter that only passes link events.
    #[must_use]
    pub const fn link() -> Self {
        Self {
            prefixes: Some(Vec::new()),
            link_events: true,
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let Some(ref prefixes) = self.prefixes else {
            return true;
        };

        match event.prefix() {
            Some(prefix) => prefixes.contains(&prefix),
            None => self.link_events,
        }
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(&self, filter: EventFilter, timeout: Duration) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_dispatch() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe(None);

        dispatcher.dispatch(Event::Heartbeat);

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();

        assert!(matches!(event, Some(Event::Heartbeat)));
    }

    #[tokio::test]
    async fn test_filtered_subscription_skips_other_events() {
        let dispatcher = EventDispatcher::new(16);
        let mut sub = dispatcher.subscribe(Some(EventFilter::prefixes(vec![Prefix::DownloadId])));

        dispatcher.dispatch(Event::Heartbeat);
        dispatcher.dispatch(Event::DriverId("LED driver".into()));

        assert_eq!(sub.recv().await, Some(Event::DriverId("LED driver".into())));
    }

    #[test]
    fn test_event_filter() {
        let filter = EventFilter::prefixes(vec![Prefix::Message, Prefix::UploadConfig]);

        assert!(filter.matches(&Event::Heartbeat));
        assert!(filter.matches(&Event::Reply {
            prefix: Prefix::UploadConfig,
            data: Bytes::new(),
        }));
        assert!(!filter.matches(&Event::DisconnectRequested));
        assert!(!filter.matches(&Event::Disconnected {
            reason: DisconnectReason::Closed
        }));
        assert!(EventFilter::default().matches(&Event::StreamInterrupted));
    }

    #[test]
    fn test_link_filter() {
        let filter = EventFilter::link();
        assert!(filter.matches(&Event::ProtocolMismatch {
            expected: Prefix::DownloadConfig,
            received: Prefix::DownloadSync,
        }));
        assert!(!filter.matches(&Event::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let dispatcher = EventDispatcher::new(16);
        let waited = dispatcher
            .wait_for(EventFilter::link(), Duration::from_millis(50))
            .await;
        assert!(waited.is_none());
    }
}
