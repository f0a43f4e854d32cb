use kvssd_types::{Fingerprint, Key, Lpa, FP_MAX};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

const FP_SEED: u64 = 0x4b56_5353_445f_4650;

/// Per-request hashing state: the key hash, the stored fingerprint, and the
/// probe counter that drives collision retries.
#[derive(Clone, Copy, Debug)]
pub struct HashMeta {
    pub hash: u64,
    pub fp: Fingerprint,
    /// Retry count; each bump moves the probe to the next LPA candidate.
    pub cnt: u32,
}

impl HashMeta {
    pub fn new(key: &Key) -> Self {
        HashMeta {
            hash: xxh3_64(key.as_bytes()),
            fp: fingerprint(key),
            cnt: 0,
        }
    }

    /// LPA candidate for the current try: a linear probe over the hash,
    /// folded into `[1, nr_entries - 1]`. The reserved LPA `2` is stepped
    /// over deterministically so OOB sentinels stay unambiguous.
    pub fn lpa(&self, nr_entries: u32) -> Lpa {
        debug_assert!(nr_entries > 3);
        let candidate =
            ((self.hash.wrapping_add(u64::from(self.cnt))) % u64::from(nr_entries - 1)) as u32 + 1;
        if candidate == 2 {
            3
        } else {
            candidate
        }
    }
}

/// 32-bit stored fingerprint; `FP_MAX` is reserved for empty entries.
pub fn fingerprint(key: &Key) -> Fingerprint {
    let fp = xxh3_64_with_seed(key.as_bytes(), FP_SEED) as u32;
    if fp == FP_MAX {
        FP_MAX - 1
    } else {
        fp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_stay_in_range_and_avoid_sentinels() {
        let key = Key::new(b"some-key").unwrap();
        let mut h = HashMeta::new(&key);
        for cnt in 0..256 {
            h.cnt = cnt;
            let lpa = h.lpa(64);
            assert!((1..64).contains(&lpa));
            assert_ne!(lpa, 2);
        }
    }

    #[test]
    fn probe_sequence_moves_on_retry() {
        let key = Key::new(b"another").unwrap();
        let mut h = HashMeta::new(&key);
        let mut seen = std::collections::HashSet::new();
        for cnt in 0..8 {
            h.cnt = cnt;
            seen.insert(h.lpa(1024));
        }
        assert!(seen.len() >= 7, "probe sequence barely moves: {seen:?}");
    }

    #[test]
    fn fingerprint_is_stable_per_key() {
        let a = Key::new(b"alpha").unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&a));
        let b = Key::new(b"beta").unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), FP_MAX);
    }
}
