//! Receive-side byte assembly.
//!
//! Inbound bytes arrive in arbitrary chunks. In framed mode they are split
//! at the delimiter and COBS-decoded. After [`ReceiveAssembler::begin_stream`]
//! the assembler instead collects a fixed number of raw bytes: the payload
//! of a bulk download, which travels without framing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::error::FrameError;
use crate::protocol::frame::{self, FRAME_DELIMITER};

/// Base time allowed for a stream transfer.
pub const STREAM_TIMEOUT_BASE: Duration = Duration::from_secs(1);

/// First encoded byte of every generic-message frame.
///
/// The generic-message prefix is zero, so COBS always opens its frames with
/// a one-byte block.
pub const MESSAGE_LEAD_BYTE: u8 = 0x01;

/// Time allowed to receive a stream of `expected_len` bytes.
#[must_use]
pub fn stream_timeout(expected_len: usize) -> Duration {
    STREAM_TIMEOUT_BASE + Duration::from_millis((expected_len / 10) as u64)
}

/// Output of the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// A decoded frame: prefix byte followed by the body.
    Frame(Bytes),
    /// A completed stream, exactly the declared length.
    Stream(Bytes),
    /// A generic message arrived before the stream completed.
    Interrupted { received: usize, expected: usize },
    /// The stream deadline passed before the stream completed.
    TimedOut { received: usize, expected: usize },
    /// A frame failed to decode and was discarded.
    Dropped(FrameError),
}

#[derive(Debug, Clone, Copy)]
struct StreamTransfer {
    expected: usize,
    deadline: Instant,
}

/// Accumulates inbound bytes into frames or stream transfers.
#[derive(Debug)]
pub struct ReceiveAssembler {
    buffer: BytesMut,
    stream: Option<StreamTransfer>,
    dropped: Arc<AtomicU64>,
}

impl ReceiveAssembler {
    /// Creates an assembler in framed mode.
    ///
    /// Frames that fail to decode are counted in `dropped`.
    #[must_use]
    pub fn new(dropped: Arc<AtomicU64>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            stream: None,
            dropped,
        }
    }

    /// Switches to stream mode until `expected_len` raw bytes have arrived.
    ///
    /// Partially received framed bytes are discarded and counted as dropped.
    pub fn begin_stream(&mut self, expected_len: usize, deadline: Instant) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                "discarding {} partial frame bytes for stream",
                self.buffer.len()
            );
            self.buffer.clear();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!("expecting {} byte stream", expected_len);
        self.stream = Some(StreamTransfer {
            expected: expected_len,
            deadline,
        });
    }

    /// Returns true while a stream transfer is in progress.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Deadline of the stream transfer in progress, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.stream.map(|s| s.deadline)
    }

    /// Feeds inbound bytes and returns everything they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Assembled> {
        let mut out = Vec::new();
        let mut input = data;

        while !input.is_empty() {
            let Some(stream) = self.stream else {
                self.push_framed(input, &mut out);
                break;
            };

            let take = (stream.expected - self.buffer.len()).min(input.len());
            self.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];

            let received = self.buffer.len();
            if received < stream.expected && self.buffer.first() == Some(&MESSAGE_LEAD_BYTE) {
                tracing::debug!("stream interrupted after {} bytes", received);
                self.stream = None;
                out.push(Assembled::Interrupted {
                    received,
                    expected: stream.expected,
                });

                let collected = self.buffer.split().freeze();
                self.push_framed(&collected, &mut out);
            } else if received == stream.expected {
                tracing::debug!("stream complete: {} bytes", received);
                self.stream = None;
                out.push(Assembled::Stream(self.buffer.split().freeze()));
            }
        }

        out
    }

    /// Abandons a stream transfer whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Assembled> {
        let stream = self.stream?;
        if now < stream.deadline {
            return None;
        }

        let received = self.buffer.len();
        tracing::debug!(
            "stream timed out with {} of {} bytes",
            received,
            stream.expected
        );
        self.buffer.clear();
        self.stream = None;

        Some(Assembled::TimedOut {
            received,
            expected: stream.expected,
        })
    }

    /// Drops any buffered bytes and returns to framed mode.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream = None;
    }

    fn push_framed(&mut self, mut input: &[u8], out: &mut Vec<Assembled>) {
        while let Some(pos) = input.iter().position(|&b| b == FRAME_DELIMITER) {
            self.buffer.extend_from_slice(&input[..pos]);
            input = &input[pos + 1..];

            if self.buffer.is_empty() {
                continue;
            }

            let encoded = self.buffer.split();
            match frame::decode(&encoded) {
                Ok(decoded) => {
                    tracing::trace!("rx frame: {}", hex::encode(&decoded));
                    out.push(Assembled::Frame(decoded));
                }
                Err(e) => {
                    tracing::warn!("dropping frame: {}", e);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    out.push(Assembled::Dropped(e));
                }
            }
        }

        self.buffer.extend_from_slice(input);
    }
}
