//! Record framing for durable-log segment files.
//!
//! Each record is `[u64 BE frame length][u32 BE crc32][u64 BE commit]
//! [payload]`, where the frame length covers everything after itself and
//! the checksum covers `BE(commit) + payload`. The payload is the binary
//! event form of the log entry node.

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;

/// Bytes of framing per record in addition to the payload.
pub(crate) const RECORD_OVERHEAD: usize = 8 + 4 + 8;

/// Result of decoding one record frame.
pub(crate) enum RecordStatus {
    /// Frame read and checksum verified.
    Valid { commit: u64, payload: Vec<u8> },
    /// Frame read but the stored checksum does not match.
    Corrupted { calculated: u32, actual: u32 },
}

pub(crate) fn create_checksummer() -> Hasher {
    Hasher::new()
}

fn generate_checksum(checksummer: &Hasher, commit: u64, payload: &[u8]) -> u32 {
    let mut checksummer = checksummer.clone();
    checksummer.reset();
    checksummer.update(&commit.to_be_bytes()[..]);
    checksummer.update(payload);
    checksummer.finalize()
}

/// Appends one framed record to `buf`.
pub(crate) fn encode_record(
    buf: &mut BytesMut,
    commit: u64,
    payload: &[u8],
    checksummer: &Hasher,
) {
    let checksum = generate_checksum(checksummer, commit, payload);
    buf.put_u64((4 + 8 + payload.len()) as u64);
    buf.put_u32(checksum);
    buf.put_u64(commit);
    buf.put_slice(payload);
}

/// Decodes the record frame whose length-prefixed body is `frame`
/// (everything after the u64 length), verifying the checksum.
pub(crate) fn decode_record_body(frame: &[u8], checksummer: &Hasher) -> Option<RecordStatus> {
    if frame.len() < 12 {
        return None;
    }
    let actual = u32::from_be_bytes(frame[0..4].try_into().expect("4 bytes"));
    let commit = u64::from_be_bytes(frame[4..12].try_into().expect("8 bytes"));
    let payload = &frame[12..];
    let calculated = generate_checksum(checksummer, commit, payload);
    if calculated == actual {
        Some(RecordStatus::Valid {
            commit,
            payload: payload.to_vec(),
        })
    } else {
        Some(RecordStatus::Corrupted { calculated, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let checksummer = create_checksummer();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, 7, b"payload bytes", &checksummer);

        let frame_len = u64::from_be_bytes(buf[0..8].try_into().unwrap()) as usize;
        assert_eq!(frame_len, buf.len() - 8);

        match decode_record_body(&buf[8..], &checksummer) {
            Some(RecordStatus::Valid { commit, payload }) => {
                assert_eq!(commit, 7);
                assert_eq!(payload, b"payload bytes");
            }
            _ => panic!("expected valid record"),
        }
    }

    #[test]
    fn flipped_bit_is_detected() {
        let checksummer = create_checksummer();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, 7, b"payload bytes", &checksummer);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        assert!(matches!(
            decode_record_body(&buf[8..], &checksummer),
            Some(RecordStatus::Corrupted { .. })
        ));
    }
}
