//! Additive checksum for structured records.
//!
//! The sum covers the record bytes plus the frame prefix, so a record sent
//! under the wrong prefix fails validation even when its bytes are intact.
//! The sender appends one byte that brings the total to zero modulo 256.

/// Sums `bytes` and `prefix` modulo 256.
#[must_use]
pub fn compute(bytes: &[u8], prefix: u8) -> u8 {
    bytes
        .iter()
        .fold(prefix, |acc, &b| acc.wrapping_add(b))
}

/// Returns the byte to append so that [`validate`] succeeds.
#[must_use]
pub fn checksum_byte(bytes: &[u8], prefix: u8) -> u8 {
    compute(bytes, prefix).wrapping_neg()
}

/// Returns true when `bytes` (checksum included) sum to zero with `prefix`.
#[must_use]
pub fn validate(bytes: &[u8], prefix: u8) -> bool {
    compute(bytes, prefix) == 0
}
