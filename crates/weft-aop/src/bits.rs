//! Compact bit-set used to select enhanceable-method indices

/// A growable bit-set over `u64` words.
///
/// Used as the cache key for enhancer builds, so it implements `Eq`/`Hash`
/// with trailing-zero-word normalisation: two sets with the same members
/// compare equal regardless of capacity history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    /// Empty set.
    pub fn new() -> BitSet {
        BitSet::default()
    }

    /// Set containing every index below `len`.
    pub fn all(len: usize) -> BitSet {
        let mut set = BitSet::new();
        for i in 0..len {
            set.insert(i);
        }
        set
    }

    /// Set containing exactly the given indices.
    pub fn of(indices: &[usize]) -> BitSet {
        let mut set = BitSet::new();
        for &i in indices {
            set.insert(i);
        }
        set
    }

    /// Add an index.
    pub fn insert(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    /// Remove an index.
    pub fn remove(&mut self, index: usize) {
        let word = index / 64;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << (index % 64));
        }
        self.normalize();
    }

    /// Membership test.
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .map(|w| w & (1 << (index % 64)) != 0)
            .unwrap_or(false)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            (0..64).filter_map(move |bit| {
                if w & (1u64 << bit) != 0 {
                    Some(wi * 64 + bit)
                } else {
                    None
                }
            })
        })
    }

    fn normalize(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains() {
        let set = BitSet::of(&[0, 3, 64, 130]);
        assert!(set.contains(0));
        assert!(set.contains(64));
        assert!(set.contains(130));
        assert!(!set.contains(1));
        assert!(!set.contains(129));
        assert_eq!(set.len(), 4);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 64, 130]);
    }

    #[test]
    fn test_equality_ignores_capacity() {
        let mut a = BitSet::of(&[1, 200]);
        a.remove(200);
        let b = BitSet::of(&[1]);
        assert_eq!(a, b);
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let hash = |s: &BitSet| {
            let mut h = DefaultHasher::new();
            s.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn test_all() {
        let set = BitSet::all(70);
        assert_eq!(set.len(), 70);
        assert!(set.contains(69));
        assert!(!set.contains(70));
    }
}
