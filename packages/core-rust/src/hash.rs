//! FNV-1a identity hash used to route identities onto registry shards.
//!
//! The hash is a plain 32-bit FNV-1a over the identity bytes. It is seed-free
//! and therefore stable for the lifetime of the process, which is all the
//! router contract requires; the algorithm itself is not part of the external
//! API and may change between releases.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes the 32-bit FNV-1a hash of an identity string.
#[must_use]
pub fn fnv1a_hash(identity: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in identity.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps an identity to a shard index in `[0, bucket_count)`.
///
/// Power-of-two counts take the cheap mask path; any other count falls back
/// to a modulo. A zero count is treated as one so the router can never
/// produce an out-of-range index.
#[must_use]
pub fn bucket_index(identity: &str, bucket_count: usize) -> usize {
    let count = bucket_count.max(1);
    let hash = fnv1a_hash(identity) as usize;
    if count.is_power_of_two() {
        hash & (count - 1)
    } else {
        hash % count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(fnv1a_hash("alice"), fnv1a_hash("alice"));
        assert_ne!(fnv1a_hash("alice"), fnv1a_hash("bob"));
    }

    #[test]
    fn empty_identity_hashes_to_offset_basis() {
        assert_eq!(fnv1a_hash(""), FNV_OFFSET_BASIS);
    }

    #[test]
    fn bucket_index_is_in_range() {
        for count in [1, 2, 3, 4, 7, 16, 64] {
            for id in ["alice", "bob", "room42", ""] {
                assert!(bucket_index(id, count) < count);
            }
        }
    }

    #[test]
    fn bucket_index_power_of_two_matches_modulo() {
        for id in ["alice", "bob", "carol", "dave"] {
            let masked = bucket_index(id, 16);
            let modulo = fnv1a_hash(id) as usize % 16;
            assert_eq!(masked, modulo);
        }
    }

    #[test]
    fn bucket_index_zero_count_is_clamped() {
        assert_eq!(bucket_index("alice", 0), 0);
    }

    #[test]
    fn bucket_index_spreads_identities() {
        // 256 sequential identities over 16 shards should touch most shards.
        let mut seen = [false; 16];
        for i in 0..256 {
            seen[bucket_index(&format!("client-{i}"), 16)] = true;
        }
        assert!(seen.iter().filter(|hit| **hit).count() >= 12);
    }
}
