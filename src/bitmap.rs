use serde::{Deserialize, Serialize};

const WORD_BITS: u64 = 64;

/// Growable bitmap of group offsets relative to a checkpoint base.
///
/// Trailing zero words are trimmed after every mutation so two bitmaps with
/// the same set bits always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupBitmap {
    words: Vec<u64>,
}

impl GroupBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bits(bits: impl IntoIterator<Item = u64>) -> Self {
        let mut bitmap = Self::new();
        for bit in bits {
            bitmap.set(bit);
        }
        bitmap
    }

    pub fn set(&mut self, bit: u64) {
        let word = (bit / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % WORD_BITS);
    }

    pub fn is_set(&self, bit: u64) -> bool {
        let word = (bit / WORD_BITS) as usize;
        self.words
            .get(word)
            .is_some_and(|value| value & (1 << (bit % WORD_BITS)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|word| word.count_ones() as u64).sum()
    }

    pub fn highest_set(&self) -> Option<u64> {
        let (index, word) = self.words.iter().enumerate().rev().find(|(_, w)| **w != 0)?;
        Some(index as u64 * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros() as u64))
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| index as u64 * WORD_BITS + bit)
        })
    }

    /// Drops the lowest `count` bits and renumbers the rest (`bit - count`).
    pub fn shift_down(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        let remaining: Vec<u64> = self
            .iter_ones()
            .filter(|bit| *bit >= count)
            .map(|bit| bit - count)
            .collect();
        self.words.clear();
        for bit in remaining {
            self.set(bit);
        }
    }

    pub fn union_with(&mut self, other: &GroupBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, value) in self.words.iter_mut().zip(other.words.iter()) {
            *word |= value;
        }
        self.trim();
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifting_renumbers_offsets() {
        let mut bitmap = GroupBitmap::from_bits([1, 3, 70]);
        assert_eq!(bitmap.highest_set(), Some(70));
        bitmap.shift_down(2);
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![1, 68]);
        assert_eq!(bitmap.highest_set(), Some(68));
    }

    #[test]
    fn equality_ignores_trailing_words() {
        let mut wide = GroupBitmap::from_bits([2, 130]);
        wide.shift_down(100);
        assert_eq!(wide, GroupBitmap::from_bits([30]));
        let mut merged = GroupBitmap::new();
        merged.union_with(&GroupBitmap::from_bits([0]));
        merged.union_with(&GroupBitmap::from_bits([65]));
        assert_eq!(merged.count_ones(), 2);
        assert!(merged.is_set(65));
        assert!(!merged.is_set(64));
    }
}
