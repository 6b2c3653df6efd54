//! COBS frame encoding and decoding.
//!
//! Every application payload is byte-stuffed so that the delimiter never
//! appears inside it, then terminated with a single delimiter:
//! ```text
//! ┌──────────────────────────────┬──────┐
//! │  COBS(prefix ++ body)        │ 0x00 │
//! │  no 0x00 bytes inside        │      │
//! └──────────────────────────────┴──────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Frame delimiter byte.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Encodes a payload with COBS byte stuffing.
///
/// The result never contains [`FRAME_DELIMITER`]; the terminator is not
/// appended (see [`encode_frame`]). An empty payload encodes to the single
/// code byte `0x01`.
#[must_use]
pub fn encode(payload: &[u8]) -> Bytes {
    Bytes::from(stuff(payload))
}

fn stuff(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return vec![0x01];
    }
    cobs::encode_vec(payload)
}

/// Encodes a payload and appends the frame delimiter.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let stuffed = stuff(payload);
    let mut buf = BytesMut::with_capacity(stuffed.len() + 1);
    buf.put_slice(&stuffed);
    buf.put_u8(FRAME_DELIMITER);
    buf.freeze()
}

/// Decodes a COBS-stuffed frame (without its delimiter).
///
/// # Errors
///
/// Returns a `FrameError` if:
/// - The frame is empty
/// - The frame contains a delimiter or its stuffing is inconsistent
pub fn decode(frame: &[u8]) -> Result<Bytes, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    if frame.contains(&FRAME_DELIMITER) {
        return Err(FrameError::Malformed { len: frame.len() });
    }
    if frame == [0x01] {
        return Ok(Bytes::new());
    }

    cobs::decode_vec(frame)
        .map(Bytes::from)
        .map_err(|()| FrameError::Malformed { len: frame.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(&encode(&[0x00])[..], &[0x01, 0x01]);
        assert_eq!(
            &encode(&[0x11, 0x22, 0x00, 0x33])[..],
            &[0x03, 0x11, 0x22, 0x02, 0x33]
        );
        assert_eq!(&encode(&[])[..], &[0x01]);
    }

    #[test]
    fn test_encode_frame_appends_delimiter() {
        let frame = encode_frame(&[0x00, b'h', b'i']);
        assert_eq!(&frame[..], &[0x01, 0x03, b'h', b'i', 0x00]);
        assert_eq!(
            frame.iter().filter(|&&b| b == FRAME_DELIMITER).count(),
            1
        );
    }

    #[test]
    fn test_empty_payload_frame() {
        assert_eq!(&encode_frame(&[])[..], &[0x01, FRAME_DELIMITER]);
        assert_eq!(decode(&[0x01]), Ok(Bytes::new()));
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert_eq!(decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn test_decode_rejects_truncated_block() {
        // Code byte promises four data bytes, only one follows.
        assert_eq!(
            decode(&[0x05, 0x01]),
            Err(FrameError::Malformed { len: 2 })
        );
    }

    #[test]
    fn test_decode_rejects_embedded_delimiter() {
        assert!(decode(&[0x02, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_round_trip_edge_payloads() {
        let all_zero = vec![0u8; 300];
        let long_block = vec![0xAB; 254];
        let longer_block = vec![0xCD; 255];
        let big: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        for payload in [vec![], all_zero, long_block, longer_block, big] {
            let encoded = encode(&payload);
            assert!(!encoded.contains(&FRAME_DELIMITER));
            assert_eq!(decode(&encoded).unwrap(), payload);
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            payload in prop_oneof![
                Just(Vec::new()),
                proptest::collection::vec(any::<u8>(), 0..1024),
            ]
        ) {
            let encoded = encode(&payload);
            prop_assert!(!encoded.contains(&FRAME_DELIMITER));
            prop_assert_eq!(decode(&encoded).unwrap(), Bytes::from(payload));
        }
    }
}
