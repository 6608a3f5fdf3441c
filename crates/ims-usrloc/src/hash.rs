// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Case-sensitive string hash used for bucket selection.
//!
//! Matches the hash existing SIP servers use for AOR and contact tables, so a
//! given identity lands in the same slot across implementations.

/// Hashes `key` into a 32-bit value.
pub fn core_hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    let mut chunks = key.chunks_exact(4);
    for chunk in &mut chunks {
        let v = (signed(chunk[0]) << 24)
            .wrapping_add(signed(chunk[1]) << 16)
            .wrapping_add(signed(chunk[2]) << 8)
            .wrapping_add(signed(chunk[3]));
        h = mix(h, v);
    }
    let mut v: u32 = 0;
    for &b in chunks.remainder() {
        v = (v << 8).wrapping_add(signed(b));
    }
    h = mix(h, v);
    h.wrapping_add(h >> 11)
        .wrapping_add(h >> 13)
        .wrapping_add(h >> 23)
}

/// Hashes a string identity.
pub fn hash_str(key: &str) -> u32 {
    core_hash(key.as_bytes())
}

// Bytes are promoted as signed chars.
fn signed(b: u8) -> u32 {
    b as i8 as i32 as u32
}

fn mix(h: u32, v: u32) -> u32 {
    h.wrapping_add(v ^ (v >> 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_hashes_to_zero() {
        assert_eq!(core_hash(b""), 0);
    }

    #[test]
    fn is_deterministic_and_case_sensitive() {
        let a = hash_str("sip:alice@example.com");
        assert_eq!(a, hash_str("sip:alice@example.com"));
        assert_ne!(a, hash_str("sip:Alice@example.com"));
    }

    #[test]
    fn short_key_matches_manual_fold() {
        // "ab": one partial word v = 0x6162, h = v ^ (v >> 3)
        let v: u32 = 0x6162;
        let h = v ^ (v >> 3);
        let expected = h + (h >> 11) + (h >> 13) + (h >> 23);
        assert_eq!(core_hash(b"ab"), expected);
    }

    #[test]
    fn spreads_sequential_keys() {
        let mut slots = std::collections::HashSet::new();
        for i in 0..256 {
            slots.insert(hash_str(&format!("sip:user{}@example.com", i)) & 511);
        }
        assert!(slots.len() > 128);
    }
}
