//! Frame dispatch by prefix.
//!
//! The router turns each decoded frame into an [`Event`] through a handler
//! table indexed by prefix, publishes it, and resolves the caller waiting
//! for that prefix, if any.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, oneshot};

use crate::error::Error;
use crate::event::{Event, EventDispatcher};
use crate::protocol::prefix::{PREFIX_COUNT, Prefix};
use crate::types::{BoardLayout, DriverConfiguration, StatusSample, SyncConfiguration};

/// Turns a frame body into an event.
pub type Handler = fn(&BoardLayout, Prefix, &[u8]) -> Event;

/// The reply a caller is waiting for.
#[derive(Debug)]
pub struct Expectation {
    /// Prefix the reply will carry.
    pub prefix: Prefix,
    waiter: Option<oneshot::Sender<Event>>,
}

impl Expectation {
    /// Expects `prefix` and returns the receiving end of its reply.
    #[must_use]
    pub fn new(prefix: Prefix) -> (Self, oneshot::Receiver<Event>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                prefix,
                waiter: Some(tx),
            },
            rx,
        )
    }

    /// Expects `prefix` without anyone waiting on the result.
    #[must_use]
    pub const fn detached(prefix: Prefix) -> Self {
        Self {
            prefix,
            waiter: None,
        }
    }

    /// Returns true while a caller is still waiting for the reply.
    #[must_use]
    pub fn is_awaited(&self) -> bool {
        self.waiter.as_ref().is_some_and(|w| !w.is_closed())
    }

    fn resolve(self, event: Event) {
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(event);
        }
    }
}

/// The single outstanding reply expectation, shared with the senders.
pub type PendingReply = Arc<Mutex<Option<Expectation>>>;

/// Dispatches decoded frames to their handlers.
pub struct CommandRouter {
    handlers: [Handler; PREFIX_COUNT],
    layout: BoardLayout,
    pending: PendingReply,
    dispatcher: EventDispatcher,
    dropped: Arc<AtomicU64>,
}

impl CommandRouter {
    /// Creates a router with the standard handler table.
    #[must_use]
    pub fn new(
        layout: BoardLayout,
        pending: PendingReply,
        dispatcher: EventDispatcher,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        let mut handlers: [Handler; PREFIX_COUNT] = [handle_reply; PREFIX_COUNT];
        handlers[Prefix::Message.index()] = handle_message;
        handlers[Prefix::Handshake.index()] = handle_handshake;
        handlers[Prefix::DownloadConfig.index()] = handle_configuration;
        handlers[Prefix::DownloadSync.index()] = handle_sync;
        handlers[Prefix::DownloadId.index()] = handle_driver_id;
        handlers[Prefix::DownloadStream.index()] = handle_stream;
        handlers[Prefix::Telemetry.index()] = handle_telemetry;
        handlers[Prefix::Disconnect.index()] = handle_disconnect;

        Self {
            handlers,
            layout,
            pending,
            dispatcher,
            dropped,
        }
    }

    /// Routes one decoded frame (prefix byte first).
    ///
    /// Returns the dispatched event, or `None` if the frame was dropped.
    pub async fn route(&self, frame: &[u8]) -> Option<Event> {
        let Some((&byte, body)) = frame.split_first() else {
            tracing::warn!("dropping empty frame");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let Some(prefix) = Prefix::from_byte(byte) else {
            tracing::warn!("dropping frame with unknown prefix {}", byte);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let resolved = {
            let mut pending = self.pending.lock().await;
            match pending.as_ref().map(|e| e.prefix) {
                Some(expected) if expected == prefix => pending.take(),
                Some(expected) if !prefix.is_async() => {
                    tracing::warn!(
                        "expected reply {:?} but received {:?}",
                        expected,
                        prefix
                    );
                    self.dispatcher.dispatch(Event::ProtocolMismatch {
                        expected,
                        received: prefix,
                    });
                    None
                }
                _ => None,
            }
        };

        let event = (self.handlers[prefix.index()])(&self.layout, prefix, body);

        if let Some(expectation) = resolved {
            expectation.resolve(event.clone());
        }
        self.dispatcher.dispatch(event.clone());
        Some(event)
    }

    /// Resolves the expectation for `prefix` with `event`.
    ///
    /// Returns false if nothing was expecting `prefix`.
    pub async fn fail_pending(&self, prefix: Prefix, event: Event) -> bool {
        let expectation = {
            let mut pending = self.pending.lock().await;
            if pending.as_ref().is_some_and(|e| e.prefix == prefix) {
                pending.take()
            } else {
                None
            }
        };

        match expectation {
            Some(expectation) => {
                expectation.resolve(event.clone());
                self.dispatcher.dispatch(event);
                true
            }
            None => {
                self.dispatcher.dispatch(event);
                false
            }
        }
    }

    /// Drops any outstanding expectation.
    pub async fn clear_pending(&self) {
        self.pending.lock().await.take();
    }
}

fn record_failure(err: Error) -> Event {
    match err {
        Error::ChecksumMismatch { record, sum } => {
            tracing::warn!("{} record had invalid checksum: {}", record, sum);
            Event::ChecksumMismatch { record, sum }
        }
        Error::InvalidRecord { record, reason } => {
            tracing::warn!("invalid {} record: {}", record, reason);
            Event::MalformedRecord { record, reason }
        }
        other => Event::DriverMessage(other.to_string()),
    }
}

fn handle_message(_: &BoardLayout, _: Prefix, body: &[u8]) -> Event {
    if body.is_empty() {
        Event::Heartbeat
    } else {
        let text = String::from_utf8_lossy(body);
        tracing::info!("driver message: {}", text);
        Event::DriverMessage(text.into_owned())
    }
}

fn handle_handshake(_: &BoardLayout, _: Prefix, body: &[u8]) -> Event {
    Event::Handshake(String::from_utf8_lossy(body).into_owned())
}

fn handle_configuration(layout: &BoardLayout, prefix: Prefix, body: &[u8]) -> Event {
    match DriverConfiguration::decode(layout, prefix.into(), body) {
        Ok(config) => Event::Configuration(Box::new(config)),
        Err(e) => record_failure(e),
    }
}

fn handle_sync(layout: &BoardLayout, prefix: Prefix, body: &[u8]) -> Event {
    match SyncConfiguration::decode(layout, prefix.into(), body) {
        Ok(sync) => Event::Sync(Box::new(sync)),
        Err(e) => record_failure(e),
    }
}

fn handle_driver_id(_: &BoardLayout, _: Prefix, body: &[u8]) -> Event {
    let id = String::from_utf8_lossy(body);
    Event::DriverId(id.trim_end_matches(['\0', ' ']).to_string())
}

fn handle_stream(_: &BoardLayout, prefix: Prefix, body: &[u8]) -> Event {
    let mut stream = Vec::with_capacity(body.len() + 1);
    stream.push(u8::from(prefix));
    stream.extend_from_slice(body);
    Event::StreamReceived(Bytes::from(stream))
}

fn handle_telemetry(_: &BoardLayout, _: Prefix, body: &[u8]) -> Event {
    match StatusSample::decode(body) {
        Ok(sample) => Event::Telemetry(sample),
        Err(e) => record_failure(e),
    }
}

fn handle_disconnect(_: &BoardLayout, _: Prefix, _: &[u8]) -> Event {
    Event::DisconnectRequested
}

fn handle_reply(_: &BoardLayout, prefix: Prefix, body: &[u8]) -> Event {
    Event::Reply {
        prefix,
        data: Bytes::copy_from_slice(body),
    }
}
