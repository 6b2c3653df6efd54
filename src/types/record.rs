//! Shared pieces of the checksummed binary records.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::checksum;

/// Which record a codec error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Driver configuration.
    Configuration,
    /// Sync configuration.
    Sync,
    /// Controller status sample.
    Telemetry,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::Sync => "sync",
            Self::Telemetry => "telemetry",
        })
    }
}

/// Shape of the driver hardware.
///
/// Both records repeat fields per board or per channel, so their layout
/// depends on these numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardLayout {
    /// Number of LED boards.
    pub boards: usize,
    /// LED channels on each board.
    pub channels_per_board: usize,
    /// Maximum characters in the driver name and channel ids.
    pub name_len: usize,
}

impl BoardLayout {
    /// Default number of boards.
    pub const DEFAULT_BOARDS: usize = 3;

    /// Default channels per board.
    pub const DEFAULT_CHANNELS_PER_BOARD: usize = 4;

    /// Default maximum identifier length.
    pub const DEFAULT_NAME_LEN: usize = 16;

    /// Creates a layout with the default identifier length.
    #[must_use]
    pub const fn new(boards: usize, channels_per_board: usize) -> Self {
        Self {
            boards,
            channels_per_board,
            name_len: Self::DEFAULT_NAME_LEN,
        }
    }

    /// Sets the maximum identifier length.
    #[must_use]
    pub const fn name_len(mut self, name_len: usize) -> Self {
        self.name_len = name_len;
        self
    }

    /// Total number of LED channels.
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.boards * self.channels_per_board
    }
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BOARDS, Self::DEFAULT_CHANNELS_PER_BOARD)
    }
}

/// Writes `value` padded with spaces to `len` bytes, then a NUL.
///
/// Longer values are cut at the last character boundary that fits.
pub(crate) fn put_padded_str(buf: &mut BytesMut, value: &str, len: usize) {
    let mut end = value.len().min(len);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&value.as_bytes()[..end]);
    buf.put_bytes(b' ', len - end);
    buf.put_u8(0);
}

/// Reads a NUL-terminated string and trims the padding.
pub(crate) fn get_padded_str(cursor: &mut &[u8], record: RecordKind) -> Result<String> {
    let Some(end) = cursor.iter().position(|&b| b == 0) else {
        return Err(Error::InvalidRecord {
            record,
            reason: "unterminated string".into(),
        });
    };
    let value = String::from_utf8_lossy(&cursor[..end])
        .trim_end()
        .to_string();
    cursor.advance(end + 1);
    Ok(value)
}

/// Checks the trailing checksum of a record received under `prefix`.
pub(crate) fn verify(bytes: &[u8], prefix: u8, record: RecordKind) -> Result<()> {
    if checksum::validate(bytes, prefix) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            record,
            sum: checksum::compute(bytes, prefix),
        })
    }
}

/// Appends the checksum for sending `buf` under `prefix`.
pub(crate) fn seal(buf: &mut BytesMut, prefix: u8) {
    let sum = checksum::checksum_byte(buf, prefix);
    buf.put_u8(sum);
}

/// Fails unless exactly `expected` bytes remain.
pub(crate) fn expect_remaining(cursor: &[u8], expected: usize, record: RecordKind) -> Result<()> {
    if cursor.len() == expected {
        Ok(())
    } else {
        Err(Error::InvalidRecord {
            record,
            reason: format!("expected {expected} more bytes, found {}", cursor.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_string() {
        let mut buf = BytesMut::new();
        put_padded_str(&mut buf, "LED", 6);
        assert_eq!(&buf[..], b"LED   \0");

        let mut cursor: &[u8] = &buf;
        assert_eq!(
            get_padded_str(&mut cursor, RecordKind::Configuration).unwrap(),
            "LED"
        );
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_padded_string_truncates_on_char_boundary() {
        let mut buf = BytesMut::new();
        put_padded_str(&mut buf, "aé", 2);
        assert_eq!(&buf[..], b"a \0");
    }

    #[test]
    fn test_unterminated_string() {
        let mut cursor: &[u8] = b"abc";
        assert!(matches!(
            get_padded_str(&mut cursor, RecordKind::Sync),
            Err(Error::InvalidRecord {
                record: RecordKind::Sync,
                ..
            })
        ));
    }

    #[test]
    fn test_verify_reports_sum() {
        let mut buf = BytesMut::from(&[1u8, 2, 3][..]);
        seal(&mut buf, 2);
        assert!(verify(&buf, 2, RecordKind::Configuration).is_ok());
        match verify(&buf, 3, RecordKind::Configuration) {
            Err(Error::ChecksumMismatch { sum, .. }) => assert_eq!(sum, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_default_layout() {
        let layout = BoardLayout::default();
        assert_eq!(layout.channel_count(), 12);
        assert_eq!(layout.name_len, 16);
        assert_eq!(BoardLayout::new(1, 2).name_len(8).name_len, 8);
    }
}
