//! Protocol definitions for LED driver communication.
//!
//! This module contains the low-level protocol pieces:
//! - COBS frame encoding/decoding
//! - The prefix table
//! - The additive record checksum
//! - Receive-side assembly of frames and streams
//! - Prefix-based dispatch of decoded frames

pub mod assembler;
pub mod checksum;
pub mod frame;
pub mod prefix;
pub mod router;

pub use assembler::{Assembled, ReceiveAssembler, STREAM_TIMEOUT_BASE, stream_timeout};
pub use frame::{FRAME_DELIMITER, decode as decode_frame, encode_frame};
pub use prefix::{PREFIX_COUNT, Prefix};
pub use router::{CommandRouter, Expectation, PendingReply};
