//! Seeded hash family shared by the index builder and the query engines.
//!
//! Hash *i* of a k-mer is the 64-bit xxh3 of its little-endian bytes with
//! seed *i*. The identity of this family is part of the index format
//! version: an index hashed with a different family is unreadable, which is
//! why swapping it requires a format version bump.

/// The *i*-th hash of a k-mer.
#[inline]
pub fn hash_kmer(kmer: u64, seed: u64) -> u64 {
    twox_hash::xxh3::hash64_with_seed(&kmer.to_le_bytes(), seed)
}

/// Append the `num_hashes` row hashes of each k-mer to `out`.
///
/// Layout: k-mer-major (`out[q * num_hashes + i]` = hash *i* of k-mer *q*),
/// matching the row-buffer layout the loaders fill.
pub fn fill_row_hashes(kmers: &[u64], num_hashes: usize, out: &mut Vec<u64>) {
    out.reserve(kmers.len() * num_hashes);
    for &kmer in kmers {
        for seed in 0..num_hashes as u64 {
            out.push(hash_kmer(kmer, seed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash_kmer(0x1234, 0), hash_kmer(0x1234, 0));
        assert_eq!(hash_kmer(u64::MAX, 7), hash_kmer(u64::MAX, 7));
    }

    #[test]
    fn test_seeds_differ() {
        let h0 = hash_kmer(42, 0);
        let h1 = hash_kmer(42, 1);
        let h2 = hash_kmer(42, 2);
        assert_ne!(h0, h1);
        assert_ne!(h1, h2);
        assert_ne!(h0, h2);
    }

    #[test]
    fn test_kmers_differ() {
        assert_ne!(hash_kmer(0, 0), hash_kmer(1, 0));
    }

    #[test]
    fn test_fill_row_hashes_layout() {
        let kmers = [3u64, 9u64];
        let mut out = Vec::new();
        fill_row_hashes(&kmers, 3, &mut out);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], hash_kmer(3, 0));
        assert_eq!(out[1], hash_kmer(3, 1));
        assert_eq!(out[2], hash_kmer(3, 2));
        assert_eq!(out[3], hash_kmer(9, 0));
        assert_eq!(out[5], hash_kmer(9, 2));
    }
}
