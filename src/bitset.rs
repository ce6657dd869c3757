//! Compact bitset representation for the tip side of a bipartition.
//!
//! # Overview
//! Every edge of an indexed tree carries one bitset with one bit per tip.
//! A bit is set when the corresponding tip lies below the edge (on the side of
//! its child node). Bit positions come from the tree's tip index, which sorts
//! tip names alphabetically, so two trees over the same taxa agree on them.
//!
//! # Example
//! For a tree with tips [A, B, C, D] mapped to ordinals [0, 1, 2, 3]:
//! - Split {A, C} | {B, D} → bitset `0b0101` (bits 0 and 2 set)
//! - Split {B, C, D} | {A} → bitset `0b1110` (bits 1, 2, 3 set)

/// A fixed-length bitset over tip ordinals.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily large trees.
/// Each u64 word holds 64 tip ordinals; bits past `len` are always zero so that
/// derived equality and hashing only look at meaningful positions.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset {
    words: Vec<u64>,
    len: usize,
}

impl Bitset {
    /// Creates a new bitset of `len` bits, all set to 0.
    ///
    /// # Example
    /// ```
    /// # use booster_support::bitset::Bitset;
    /// // For a tree with 100 tips, 2 words (128 bits) are allocated
    /// let bs = Bitset::zeros(100);
    /// assert_eq!(bs.len(), 100);
    /// assert_eq!(bs.count_ones(), 0);
    /// ```
    pub fn zeros(len: usize) -> Self {
        Bitset {
            words: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    /// Number of bits (tips) this bitset covers.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the bit at the given index to 1.
    ///
    /// # Example
    /// ```
    /// # use booster_support::bitset::Bitset;
    /// let mut bs = Bitset::zeros(8);
    /// bs.set(0);
    /// bs.set(5);
    /// assert!(bs.test(5));
    /// assert_eq!(bs.count_ones(), 2);
    /// ```
    #[inline]
    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.len, "bit {idx} out of range {}", self.len);
        let word = idx >> 6; // Equivalent to idx / 64
        let bit = idx & 63; // Equivalent to idx % 64
        self.words[word] |= 1u64 << bit;
    }

    /// Clears the bit at the given index.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < self.len, "bit {idx} out of range {}", self.len);
        self.words[idx >> 6] &= !(1u64 << (idx & 63));
    }

    /// Tests whether the bit at the given index is set.
    #[inline]
    pub fn test(&self, idx: usize) -> bool {
        idx < self.len && (self.words[idx >> 6] >> (idx & 63)) & 1 == 1
    }

    /// Resets every bit to 0, keeping the length.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// # Example
    /// ```
    /// # use booster_support::bitset::Bitset;
    /// let mut left = Bitset::zeros(4);
    /// left.set(0);   // {0}
    ///
    /// let mut right = Bitset::zeros(4);
    /// right.set(1);  // {1}
    ///
    /// left.or_assign(&right);  // {0} ∪ {1} = {0, 1}
    /// assert_eq!(left.count_ones(), 2);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    /// Counts the number of set bits (population count).
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Bitwise complement restricted to the first `len` bits.
    ///
    /// Input `0b0011` over 4 bits gives `0b1100`.
    pub fn complement(&self) -> Bitset {
        let mut out = Bitset {
            words: self.words.iter().map(|w| !w).collect(),
            len: self.len,
        };
        out.mask_tail();
        out
    }

    /// True when both bitsets describe the same split of the tip set,
    /// either side for side or one being the complement of the other.
    pub fn same_bipartition(&self, other: &Bitset) -> bool {
        if self.len != other.len {
            return false;
        }
        if self.words == other.words {
            return true;
        }
        let tail = self.tail_mask();
        let last = self.words.len().saturating_sub(1);
        self.words
            .iter()
            .zip(&other.words)
            .enumerate()
            .all(|(k, (a, b))| {
                let mask = if k == last { tail } else { u64::MAX };
                (a ^ b) & mask == mask
            })
    }

    /// Iterates over the indices of the set bits in increasing order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.test(i))
    }

    fn tail_mask(&self) -> u64 {
        match self.len & 63 {
            0 => u64::MAX,
            r => (1u64 << r) - 1,
        }
    }

    fn mask_tail(&mut self) {
        let mask = self.tail_mask();
        if let Some(last) = self.words.last_mut() {
            *last &= mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = Bitset::zeros(4);
        bs.set(0);
        bs.set(2);
        assert!(bs.test(0));
        assert!(!bs.test(1));
        assert!(bs.test(2));
        bs.clear(2);
        assert!(!bs.test(2));
        assert_eq!(bs.count_ones(), 1);
    }

    #[test]
    fn test_bitset_or() {
        let mut bs1 = Bitset::zeros(4);
        bs1.set(0);
        bs1.set(1);

        let mut bs2 = Bitset::zeros(4);
        bs2.set(2);
        bs2.set(3);

        bs1.or_assign(&bs2);
        assert_eq!(bs1.count_ones(), 4);
    }

    /// Tips A=0, B=1, C=2, D=3: {A,B} and {C,D} are the same split.
    #[test]
    fn test_same_bipartition() {
        let mut part_ab = Bitset::zeros(4);
        part_ab.set(0);
        part_ab.set(1);

        let mut part_cd = Bitset::zeros(4);
        part_cd.set(2);
        part_cd.set(3);

        let mut part_ac = Bitset::zeros(4);
        part_ac.set(0);
        part_ac.set(2);

        assert!(part_ab.same_bipartition(&part_cd));
        assert!(part_cd.same_bipartition(&part_ab));
        assert!(part_ab.same_bipartition(&part_ab.clone()));
        assert!(!part_ab.same_bipartition(&part_ac));
        assert_eq!(part_ab.complement(), part_cd);
    }

    #[test]
    fn test_large_tree() {
        // More than 64 tips: the tail of the second word must stay clean
        let mut bs = Bitset::zeros(100);
        bs.set(0);
        bs.set(63);
        bs.set(64);
        bs.set(99);
        assert_eq!(bs.count_ones(), 4);

        let comp = bs.complement();
        assert_eq!(comp.count_ones(), 96);
        assert!(bs.same_bipartition(&comp));
        assert_eq!(bs.iter_ones().collect::<Vec<_>>(), vec![0, 63, 64, 99]);
    }

    #[test]
    fn test_clear_all_keeps_length() {
        let mut bs = Bitset::zeros(70);
        bs.set(69);
        bs.clear_all();
        assert_eq!(bs.len(), 70);
        assert_eq!(bs.count_ones(), 0);
    }
}
