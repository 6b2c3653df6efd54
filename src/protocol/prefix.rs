//! Frame prefixes for the LED driver protocol.
//!
//! Every decoded frame starts with a one-byte prefix naming the operation it
//! belongs to. The same prefix is used in both directions: a request goes out
//! with the prefix of its operation and the board answers with that prefix.

/// Number of prefixes in the table.
pub const PREFIX_COUNT: usize = 19;

/// Operation prefixes (wire ids 0-18).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Prefix {
    /// Free-form text message, or an empty keep-alive.
    Message = 0,
    /// Magic string exchange identifying the board.
    Handshake = 1,
    /// Read the driver configuration record.
    DownloadConfig = 2,
    /// Write the driver configuration record.
    UploadConfig = 3,
    /// Read the sync configuration record.
    DownloadSync = 4,
    /// Write the sync configuration record.
    UploadSync = 5,
    /// Read a stored sequence.
    DownloadSeq = 6,
    /// Write a stored sequence.
    UploadSeq = 7,
    /// Read the driver identity string.
    DownloadId = 8,
    /// Set the board clock.
    UploadTime = 9,
    /// Announce a raw upload stream.
    UploadStream = 10,
    /// Request a raw download stream.
    DownloadStream = 11,
    /// Unsolicited controller status sample.
    Telemetry = 12,
    /// Calibration command.
    Calibration = 13,
    /// Link teardown, either direction.
    Disconnect = 14,
    /// Measure the confocal scan period.
    MeasurePeriod = 15,
    /// Drive a test current on a channel.
    TestCurrent = 16,
    /// Play an audio test tone.
    TestVolume = 17,
    /// Set the controller indicator outputs.
    SetOutput = 18,
}

impl Prefix {
    /// All prefixes in wire order.
    pub const ALL: [Self; PREFIX_COUNT] = [
        Self::Message,
        Self::Handshake,
        Self::DownloadConfig,
        Self::UploadConfig,
        Self::DownloadSync,
        Self::UploadSync,
        Self::DownloadSeq,
        Self::UploadSeq,
        Self::DownloadId,
        Self::UploadTime,
        Self::UploadStream,
        Self::DownloadStream,
        Self::Telemetry,
        Self::Calibration,
        Self::Disconnect,
        Self::MeasurePeriod,
        Self::TestCurrent,
        Self::TestVolume,
        Self::SetOutput,
    ];

    /// Parses a prefix from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        if (byte as usize) < PREFIX_COUNT {
            Some(Self::ALL[byte as usize])
        } else {
            None
        }
    }

    /// Position of this prefix in [`Prefix::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns true for prefixes the board may send at any time.
    ///
    /// Frames with these prefixes never count as an out-of-order reply.
    #[must_use]
    pub const fn is_async(self) -> bool {
        matches!(self, Self::Message | Self::Telemetry)
    }
}

impl From<Prefix> for u8 {
    fn from(prefix: Prefix) -> Self {
        prefix as Self
    }
}
