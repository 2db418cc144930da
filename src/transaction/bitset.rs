/// Immutable bitset of transaction ids
///
/// Updates return a new set; published sets are never modified in place,
/// so a reader holding an `Arc<BitSet>` never sees a half-applied change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u32) -> bool {
        let (word, bit) = Self::position(id);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    pub fn with(&self, id: u32) -> Self {
        let mut next = self.clone();
        next.insert(id);
        next
    }

    pub fn without(&self, id: u32) -> Self {
        let mut next = self.clone();
        next.remove(id);
        next
    }

    pub(crate) fn insert(&mut self, id: u32) {
        let (word, bit) = Self::position(id);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub(crate) fn remove(&mut self, id: u32) {
        let (word, bit) = Self::position(id);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << bit);
        }
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    /// Lowest id at or above `from` that is not in the set
    pub fn next_clear_bit(&self, from: u32) -> u32 {
        let mut id = from;
        while self.contains(id) {
            id += 1;
        }
        id
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| index as u32 * 64 + bit)
        })
    }

    fn position(id: u32) -> (usize, u32) {
        ((id / 64) as usize, id % 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_and_without_leave_original_untouched() {
        let empty = BitSet::new();
        let one = empty.with(3);
        let two = one.with(130);

        assert!(!empty.contains(3));
        assert!(one.contains(3));
        assert!(!one.contains(130));
        assert!(two.contains(130));
        assert_eq!(two.len(), 2);

        let back = two.without(130);
        assert_eq!(back, one);
        assert!(two.contains(130));
    }

    #[test]
    fn test_next_clear_bit() {
        let set = BitSet::new().with(1).with(2).with(4);
        assert_eq!(set.next_clear_bit(1), 3);
        assert_eq!(set.next_clear_bit(4), 5);
        assert_eq!(BitSet::new().next_clear_bit(1), 1);
    }

    #[test]
    fn test_iter_and_empty() {
        let set = BitSet::new().with(64).with(0).with(65);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 64, 65]);
        assert!(set.without(0).without(64).without(65).is_empty());
    }
}
