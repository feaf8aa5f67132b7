//! Nonce derivation for the on-disk layout.
//!
//! Every nonce in the layout is derived from MurmurHash3 x64-128. The exact
//! recipe (seed folding, which 8 of the 16 output bytes are kept) is part of
//! the on-disk compatibility surface, so the hash is implemented here rather
//! than delegated to a swappable dependency.

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn load_u64_le(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    for (o, b) in out.iter_mut().zip(bytes) {
        *o = *b;
    }
    u64::from_le_bytes(out)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64-128, h1 then h2, each little-endian.
pub(crate) fn murmur3_128(data: &[u8], seed: u32) -> [u8; 16] {
    let mut h1 = u64::from(seed);
    let mut h2 = u64::from(seed);

    let mut chunks = data.chunks_exact(16);
    for block in chunks.by_ref() {
        let (lo, hi) = block.split_at(8);
        let mut k1 = load_u64_le(lo);
        let mut k2 = load_u64_le(hi);

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x3849_5ab5);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u64;
        let mut k2 = 0u64;
        for (i, &byte) in tail.iter().enumerate() {
            if i < 8 {
                k1 |= u64::from(byte) << (8 * i);
            } else {
                k2 |= u64::from(byte) << (8 * (i - 8));
            }
        }
        if tail.len() > 8 {
            k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
            h2 ^= k2;
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&h1.to_le_bytes());
    out[8..].copy_from_slice(&h2.to_le_bytes());
    out
}

/// Fold a 64-bit starting value into a 32-bit seed, hash, and keep the
/// little-endian u64 at bytes 4..12 of the output.
fn hash_stuff(start: u64, data: &[u8]) -> u64 {
    let folded = (start ^ (start >> 27)).to_le_bytes();
    let seed = u32::from_le_bytes([folded[0], folded[1], folded[2], folded[3]]);
    let hash = murmur3_128(data, seed);
    load_u64_le(&hash[4..12])
}

pub(crate) fn generate_primary_nonce(data: &[u8]) -> u64 {
    hash_stuff(0x5963_2929, data)
}

pub(crate) fn generate_secondary_nonce(seed: u64, data: &[u8]) -> u64 {
    hash_stuff(seed.wrapping_add(1), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_zero_seed() {
        // With no blocks and no tail the whole pipeline mixes zeros.
        assert_eq!([0; 16], murmur3_128(&[], 0));
    }

    #[test]
    fn test_deterministic() {
        let data = b"the same bytes every time";
        assert_eq!(murmur3_128(data, 42), murmur3_128(data, 42));
        assert_eq!(
            generate_secondary_nonce(7, data),
            generate_secondary_nonce(7, data)
        );
    }

    #[test]
    fn test_seed_changes_hash() {
        let data = b"seed sensitivity";
        assert_ne!(murmur3_128(data, 0), murmur3_128(data, 1));
        assert_ne!(
            generate_secondary_nonce(0, data),
            generate_secondary_nonce(1, data)
        );
    }

    #[test]
    fn test_data_changes_hash() {
        assert_ne!(murmur3_128(b"one", 0), murmur3_128(b"two", 0));
    }

    #[test]
    fn test_tail_lengths_are_distinct() {
        // Exercise the block path, the short tail, and the long tail.
        let data = [0x5Au8; 33];
        let mut hashes: Vec<[u8; 16]> = Vec::new();
        for len in [7, 8, 9, 15, 16, 17, 32, 33] {
            hashes.push(murmur3_128(&data[..len], 0));
        }
        for (i, a) in hashes.iter().enumerate() {
            for b in hashes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_primary_and_secondary_differ() {
        let data = b"nonce input";
        assert_ne!(
            generate_primary_nonce(data),
            generate_secondary_nonce(0x5963_2929, data)
        );
    }
}
