//! Error types for the leddriver library.

use thiserror::Error;

use crate::protocol::Prefix;
use crate::transport::DisconnectReason;
use crate::types::RecordKind;

/// The main error type for LED driver operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serial number pattern failed to compile.
    #[error("invalid serial number pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A record failed its additive checksum.
    #[error("{record} record had invalid checksum: {sum}")]
    ChecksumMismatch { record: RecordKind, sum: u8 },

    /// A record could not be packed or unpacked.
    #[error("invalid {record} record: {reason}")]
    InvalidRecord { record: RecordKind, reason: String },

    /// A stream transfer missed its deadline.
    #[error("stream timed out with {received} of {expected} bytes received")]
    StreamTimeout { received: usize, expected: usize },

    /// The board sent a message instead of completing a stream transfer.
    #[error("stream interrupted by a driver message")]
    StreamInterrupted,

    /// A stream is too long for its 32-bit length field.
    #[error("stream of {len} bytes exceeds the 32-bit length field")]
    StreamTooLong { len: usize },

    /// Fewer bytes were written than requested.
    #[error("only {written} of {expected} bytes were sent to the driver")]
    WriteIncomplete { written: usize, expected: usize },

    /// The link went down.
    #[error("driver disconnected: {0}")]
    Disconnected(DisconnectReason),

    /// A reply did not arrive in time.
    #[error("no reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// The peer did not answer the handshake like an LED driver.
    #[error("device on {port} is not an LED driver")]
    NotADriver { port: String },

    /// No candidate port completed the handshake.
    #[error("no LED driver found")]
    NoDriverFound,

    /// Another reply is still being awaited.
    #[error("still waiting for a reply to {0:?}")]
    ReplyPending(Prefix),

    /// The board answered with something other than the expected reply.
    #[error("unexpected reply to {expected:?}: {message}")]
    UnexpectedReply { expected: Prefix, message: String },

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

/// Frame-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Nothing between two delimiters.
    #[error("empty frame")]
    Empty,

    /// The byte stuffing could not have been produced by the encoder.
    #[error("malformed COBS frame ({len} bytes)")]
    Malformed { len: usize },
}

/// Result type alias for leddriver operations.
pub type Result<T> = std::result::Result<T, Error>;
