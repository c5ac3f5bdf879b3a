//! Space-efficient set fingerprinting for the cross-checks.
//!
//! A Bloom filter can prove an element was never added but can never prove
//! membership, which is the useful direction here: a table row whose entry
//! fingerprint the filter lacks is definitely missing from the index. False
//! negatives on the corruption side (filter hit for an entry that is in
//! fact absent) are bounded by the false positive rate.

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Bits budgeted per expected element. Ten bits gives roughly a 1% false
/// positive rate with seven probes.
const BITS_PER_ELEMENT: u64 = 10;
const PROBES: u64 = 7;

/// A fixed-size Bloom filter over byte strings, seeded per run so that
/// repeated verifications do not share blind spots.
pub struct Bloom {
    words: Vec<u64>,
    nbits: u64,
    seed: u64,
}

impl Bloom {
    /// A filter sized for `expected` elements. Never smaller than one word,
    /// however small the estimate.
    pub fn new(expected: u64, seed: u64) -> Self {
        let nbits = (expected.max(1) * BITS_PER_ELEMENT)
            .next_power_of_two()
            .max(64);
        Self {
            words: vec![0; (nbits / 64) as usize],
            nbits,
            seed,
        }
    }

    /// Two independent hashes combined per the standard double-hashing
    /// construction; the second is forced odd so successive probes cycle
    /// through distinct bits of a power-of-two table.
    fn probes(&self, data: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh3_64_with_seed(data, self.seed);
        let h2 = xxh3_64_with_seed(data, self.seed.wrapping_add(0x9e37_79b9_7f4a_7c15)) | 1;
        let mask = self.nbits - 1;
        (0..PROBES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & mask)
    }

    pub fn add(&mut self, data: &[u8]) {
        let probes: Vec<u64> = self.probes(data).collect();
        for bit in probes {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Whether the filter proves `data` was never added.
    pub fn lacks(&self, data: &[u8]) -> bool {
        self.probes(data)
            .any(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) == 0)
    }

    /// Fraction of bits set, a health indicator for the sizing estimate.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self.words.iter().map(|w| u64::from(w.count_ones())).sum();
        set as f64 / self.nbits as f64
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn added_elements_are_never_lacked() {
        let mut filter = Bloom::new(1000, 42);
        for i in 0..1000u32 {
            filter.add(&i.to_le_bytes());
        }
        for i in 0..1000u32 {
            assert!(!filter.lacks(&i.to_le_bytes()));
        }
    }

    proptest! {
        #[test]
        fn no_false_negatives_for_any_input(
            elements in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64), 1..50),
            seed in any::<u64>(),
        ) {
            let mut filter = Bloom::new(elements.len() as u64, seed);
            for element in &elements {
                filter.add(element);
            }
            for element in &elements {
                prop_assert!(!filter.lacks(element));
            }
        }
    }

    #[test]
    fn absent_elements_are_mostly_lacked() {
        let mut filter = Bloom::new(1000, 7);
        for i in 0..1000u32 {
            filter.add(&i.to_le_bytes());
        }
        let misses = (1000..11_000u32)
            .filter(|i| filter.lacks(&i.to_le_bytes()))
            .count();
        // ~1% expected false positive rate; require well under 5%.
        assert!(misses > 9500, "only {misses}/10000 lacked");
        assert!(filter.fill_ratio() < 0.6);
    }

    #[test]
    fn tiny_expected_counts_still_get_a_filter() {
        // Estimates this small round below one word of bits.
        for expected in 0..=6 {
            let mut filter = Bloom::new(expected, 3);
            filter.add(b"lonely");
            assert!(!filter.lacks(b"lonely"), "expected={expected}");
        }
    }

    #[test]
    fn empty_filter_lacks_everything() {
        let filter = Bloom::new(10, 0);
        assert!(filter.lacks(b"anything"));
        assert_eq!(filter.fill_ratio(), 0.0);
    }
}
