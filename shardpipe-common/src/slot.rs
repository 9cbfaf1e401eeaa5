//! # Hash Slots
//!
//! Purpose: Map keys onto the fixed 16384-slot keyspace used by sharded
//! Redis-compatible clusters.
//!
//! ## Design Principles
//! 1. **Wire Compatibility**: CRC16/XMODEM and the `{hash tag}` rule match the
//!    store exactly, so a key lands on the same slot the server computes.
//! 2. **Allocation-Free**: Hashing borrows the key and never copies it.
//! 3. **Total Function**: Every byte string, including the empty one, has a slot.

/// Number of hash slots in the cluster keyspace.
pub const SLOT_COUNT: u16 = 16384;

/// Highest valid slot number.
pub const MAX_SLOT: u16 = SLOT_COUNT - 1;

/// Returns the hash slot that owns `key`.
///
/// When the key contains a non-empty `{...}` section, only the bytes between
/// the first `{` and the next `}` are hashed, so related keys can be pinned to
/// one slot.
#[inline]
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) & MAX_SLOT
}

/// Returns the portion of `key` that participates in slot hashing.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let open = match key.iter().position(|&b| b == b'{') {
        Some(idx) => idx,
        None => return key,
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// CRC16/XMODEM (poly 0x1021, init 0), the checksum used for slot hashing.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_matches_reference_vector() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn known_key_slots() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"123456789"), 0x31C3);
    }

    #[test]
    fn hash_tag_pins_related_keys() {
        assert_eq!(
            key_slot(b"{user1000}.following"),
            key_slot(b"{user1000}.followers")
        );
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"user1000"));
    }

    #[test]
    fn empty_or_unclosed_tags_hash_whole_key() {
        assert_eq!(hash_tag(b"foo{}{bar}"), b"foo{}{bar}");
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
        assert_eq!(hash_tag(b"foo{{bar}}zap"), b"{bar");
        assert_eq!(hash_tag(b"foo{bar}{zap}"), b"bar");
    }

    #[test]
    fn slots_stay_in_range() {
        for idx in 0..2_000u32 {
            let key = format!("key:{}", idx);
            assert!(key_slot(key.as_bytes()) <= MAX_SLOT);
        }
        assert!(key_slot(b"") <= MAX_SLOT);
    }
}
