//! Integrity: one-byte checksums for packets and segment frames.

/// Packet checksum: byte-wise XOR fold over the payload (header excluded).
/// An empty or all-zero payload folds to 0, which doubles as "not computed".
///
/// Some non-zero payloads also fold to 0 (`[1, 1]` does). Those are sent with a
/// stored 0 and so carry no protection: corruption in transit goes undetected.
pub fn packet_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |c, &b| c ^ b ^ (b << 4))
}

/// Verify a received packet checksum. A stored 0 always passes.
pub fn verify_packet(payload: &[u8], stored: u8) -> bool {
    stored == 0 || packet_checksum(payload) == stored
}

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Segment frame checksum: FNV-1a truncated to a byte at every step.
pub fn segment_checksum(payload: &[u8]) -> u8 {
    let prime = FNV_PRIME as u8;
    payload
        .iter()
        .fold(FNV_OFFSET_BASIS as u8, |c, &b| (c ^ b).wrapping_mul(prime))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_zero_payload_fold_to_zero() {
        assert_eq!(packet_checksum(&[]), 0);
        assert_eq!(packet_checksum(&[0u8; 64]), 0);
    }

    #[test]
    fn any_single_byte_change_changes_packet_checksum() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let base = packet_checksum(&payload);
        for i in 0..payload.len() {
            for flip in [0x01u8, 0x10, 0x80, 0xFF] {
                let mut tampered = payload.clone();
                tampered[i] ^= flip;
                assert_ne!(packet_checksum(&tampered), base, "byte {} flip {:#x}", i, flip);
            }
        }
    }

    #[test]
    fn zero_stored_checksum_always_verifies() {
        assert!(verify_packet(b"anything", 0));
        let sum = packet_checksum(b"hello");
        assert_ne!(sum, 0);
        assert!(verify_packet(b"hello", sum));
        assert!(!verify_packet(b"hellp", sum));
    }

    #[test]
    fn fold_to_zero_payload_is_unprotected() {
        assert_eq!(packet_checksum(&[1, 1]), 0);
        // [1, 1] corrupted to [1, 2] in transit still verifies.
        assert_ne!(packet_checksum(&[1, 2]), 0);
        assert!(verify_packet(&[1, 2], packet_checksum(&[1, 1])));
    }

    #[test]
    fn segment_checksum_matches_truncated_fnv1a() {
        // Full-width FNV-1a truncated at the end yields the same low byte.
        fn full(bytes: &[u8]) -> u8 {
            let mut h = FNV_OFFSET_BASIS;
            for &b in bytes {
                h ^= b as u32;
                h = h.wrapping_mul(FNV_PRIME);
            }
            h as u8
        }
        for sample in [&b""[..], b"a", b"segment payload", &[0xFF; 40]] {
            assert_eq!(segment_checksum(sample), full(sample));
        }
        assert_eq!(segment_checksum(&[]), 0xC5);
    }
}
