//! Transport layer for LED driver communication.
//!
//! A transport moves raw bytes; framing happens above it. Inbound bytes and
//! link loss are reported on a single channel handed out by
//! [`Transport::open`].

#[cfg(test)]
pub(crate) mod mock;
pub mod serial;

use std::fmt;
use std::io;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capacity of the inbound notification channel.
pub const INBOUND_CAPACITY: usize = 256;

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The port stopped responding or reported an I/O failure.
    ResourceUnavailable,
    /// The device disappeared (unplugged).
    DeviceNotFound,
    /// The board asked to disconnect.
    PeerRequested,
    /// The host closed the link.
    Closed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ResourceUnavailable => "port became unavailable",
            Self::DeviceNotFound => "device not found",
            Self::PeerRequested => "driver requested disconnect",
            Self::Closed => "closed by host",
        })
    }
}

/// Maps a read or write failure to the reason reported for the link loss.
#[must_use]
pub fn classify_io_error(err: &io::Error) -> DisconnectReason {
    match err.kind() {
        io::ErrorKind::NotFound => DisconnectReason::DeviceNotFound,
        _ => DisconnectReason::ResourceUnavailable,
    }
}

/// Notification from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived.
    Data(Bytes),
    /// The link went down; no further events follow.
    Closed(DisconnectReason),
}

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Opens the link and returns its inbound channel.
    ///
    /// Opening an already open transport closes it first, so the receiver
    /// from a previous open stops receiving.
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<TransportEvent>>>;

    /// Closes the link. Closing a closed transport is a no-op.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes raw bytes and returns how many were accepted.
    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<usize>>;

    /// Returns true while the link is open.
    fn is_open(&self) -> bool;

    /// Human-readable name of the link (for example the port path).
    fn name(&self) -> &str;
}

pub use serial::{DriverPort, PortFilter, SerialConfig, SerialTransport, discover_ports};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io_error() {
        let gone = io::Error::new(io::ErrorKind::NotFound, "unplugged");
        assert_eq!(classify_io_error(&gone), DisconnectReason::DeviceNotFound);

        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = io::Error::new(kind, "failure");
            assert_eq!(
                classify_io_error(&err),
                DisconnectReason::ResourceUnavailable
            );
        }
    }
}
