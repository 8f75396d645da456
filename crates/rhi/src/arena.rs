//! Stable-index arena.
//!
//! # Overview
//!
//! [`StableIndexArena`] stores elements so that the index returned by
//! [`emplace`](StableIndexArena::emplace) keeps naming the same element until
//! it is [`remove`](StableIndexArena::remove)d, no matter how many other
//! elements come and go. Removal leaves a tombstone that the next insertion
//! reuses; storage never shrinks.
//!
//! Free slots are tracked by an allocation bitmap, one bit per slot, so the
//! first hole is found a word at a time.
//!
//! # Example
//!
//! ```
//! use forge_rhi::arena::StableIndexArena;
//!
//! let mut arena = StableIndexArena::new();
//! let a = arena.emplace("a");
//! let b = arena.emplace("b");
//! assert_eq!(arena.remove(a), "a");
//!
//! // `b` is unaffected and the hole at `a` is reused.
//! assert_eq!(*arena.at(b), "b");
//! assert_eq!(arena.emplace("c"), a);
//! ```

use crate::error::ArenaError;

const WORD_BITS: usize = u64::BITS as usize;

/// Container whose indices stay valid for the lifetime of each element.
///
/// Not internally synchronized.
#[derive(Debug, Clone)]
pub struct StableIndexArena<T> {
    slots: Vec<Option<T>>,
    /// Bit `i % 64` of word `i / 64` is set while slot `i` is allocated.
    allocated: Vec<u64>,
    len: usize,
}

impl<T> Default for StableIndexArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StableIndexArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            allocated: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            allocated: Vec::with_capacity(capacity.div_ceil(WORD_BITS)),
            len: 0,
        }
    }

    /// Inserts `value` into the first free slot, appending one if none is
    /// free, and returns its index.
    pub fn emplace(&mut self, value: T) -> usize {
        let index = self.first_free();
        if index == self.slots.len() {
            self.slots.push(Some(value));
            if index / WORD_BITS >= self.allocated.len() {
                self.allocated.push(0);
            }
        } else {
            debug_assert!(self.slots[index].is_none());
            self.slots[index] = Some(value);
        }
        self.allocated[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        self.len += 1;
        index
    }

    /// Removes the element at `index` and hands it back so the caller can
    /// release whatever it owns.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or not allocated.
    pub fn remove(&mut self, index: usize) -> T {
        if let Err(e) = self.check(index) {
            panic!("StableIndexArena::remove: {e}");
        }
        self.allocated[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        self.len -= 1;
        match self.slots[index].take() {
            Some(value) => value,
            None => unreachable!("allocated slot {index} holds no value"),
        }
    }

    /// Returns the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics with [`ArenaError::OutOfRange`] or [`ArenaError::UseAfterFree`].
    #[track_caller]
    pub fn at(&self, index: usize) -> &T {
        match self.try_at(index) {
            Ok(value) => value,
            Err(e) => panic!("StableIndexArena::at: {e}"),
        }
    }

    /// Mutable counterpart of [`at`](Self::at).
    #[track_caller]
    pub fn at_mut(&mut self, index: usize) -> &mut T {
        if let Err(e) = self.check(index) {
            panic!("StableIndexArena::at_mut: {e}");
        }
        match self.slots[index].as_mut() {
            Some(value) => value,
            None => unreachable!("allocated slot {index} holds no value"),
        }
    }

    /// Checked access.
    pub fn try_at(&self, index: usize) -> Result<&T, ArenaError> {
        self.check(index)?;
        self.slots[index]
            .as_ref()
            .ok_or(ArenaError::UseAfterFree { index })
    }

    /// Returns the element at `index` if it is allocated.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Whether `index` currently names an element.
    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        index < self.slots.len() && self.bit(index)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of slots, live or free. Indices are always below this.
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Iterates live elements with their indices, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i, value)))
    }

    /// Indices of all live elements, in index order.
    pub fn indices(&self) -> Vec<usize> {
        self.iter().map(|(i, _)| i).collect()
    }

    /// Removes every element and returns them. Slots are kept as holes.
    pub fn drain(&mut self) -> Vec<T> {
        self.allocated.iter_mut().for_each(|word| *word = 0);
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    fn check(&self, index: usize) -> Result<(), ArenaError> {
        if index >= self.slots.len() {
            return Err(ArenaError::OutOfRange {
                index,
                size: self.slots.len(),
            });
        }
        if !self.bit(index) {
            return Err(ArenaError::UseAfterFree { index });
        }
        Ok(())
    }

    #[inline]
    fn bit(&self, index: usize) -> bool {
        self.allocated[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn first_free(&self) -> usize {
        for (word_index, &word) in self.allocated.iter().enumerate() {
            if word != u64::MAX {
                let index = word_index * WORD_BITS + word.trailing_ones() as usize;
                // Bits past the last slot are zero, so this lands on `size()`
                // when the last word has room but no hole.
                return index.min(self.slots.len());
            }
        }
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emplace_appends_in_order() {
        let mut arena = StableIndexArena::new();
        assert!(arena.is_empty());
        assert_eq!(arena.emplace(10), 0);
        assert_eq!(arena.emplace(11), 1);
        assert_eq!(arena.emplace(12), 2);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.size(), 3);
        assert!(arena.capacity() >= 3);
    }

    #[test]
    fn test_remove_returns_payload_and_reuses_hole() {
        let mut arena = StableIndexArena::new();
        let a = arena.emplace(String::from("a"));
        let b = arena.emplace(String::from("b"));
        let c = arena.emplace(String::from("c"));

        assert_eq!(arena.remove(b), "b");
        assert!(!arena.is_valid(b));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.size(), 3);

        // The hole is reused before the arena grows.
        assert_eq!(arena.emplace(String::from("d")), b);
        assert_eq!(arena.at(a), "a");
        assert_eq!(arena.at(b), "d");
        assert_eq!(arena.at(c), "c");
        assert_eq!(arena.size(), 3);
    }

    #[test]
    fn test_lowest_hole_is_reused_first() {
        let mut arena = StableIndexArena::new();
        for i in 0..5 {
            arena.emplace(i);
        }
        arena.remove(3);
        arena.remove(1);
        assert_eq!(arena.emplace(100), 1);
        assert_eq!(arena.emplace(101), 3);
        assert_eq!(arena.emplace(102), 5);
    }

    #[test]
    fn test_try_at_errors() {
        let mut arena = StableIndexArena::new();
        let index = arena.emplace(1u32);
        assert_eq!(
            arena.try_at(4).unwrap_err(),
            ArenaError::OutOfRange { index: 4, size: 1 }
        );
        arena.remove(index);
        assert_eq!(
            arena.try_at(index).unwrap_err(),
            ArenaError::UseAfterFree { index }
        );
        assert!(arena.get(index).is_none());
    }

    #[test]
    #[should_panic(expected = "use after free")]
    fn test_at_panics_after_remove() {
        let mut arena = StableIndexArena::new();
        let index = arena.emplace(1u32);
        arena.remove(index);
        let _ = arena.at(index);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_at_panics_out_of_range() {
        let arena: StableIndexArena<u32> = StableIndexArena::new();
        let _ = arena.at(0);
    }

    #[test]
    #[should_panic(expected = "use after free")]
    fn test_double_remove_panics() {
        let mut arena = StableIndexArena::new();
        let index = arena.emplace(1u32);
        arena.remove(index);
        arena.remove(index);
    }

    #[test]
    fn test_iter_skips_holes() {
        let mut arena = StableIndexArena::new();
        for i in 0..4 {
            arena.emplace(i * 10);
        }
        arena.remove(0);
        arena.remove(2);
        let live: Vec<_> = arena.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(live, vec![(1, 10), (3, 30)]);
        assert_eq!(arena.indices(), vec![1, 3]);
    }

    #[test]
    fn test_bitmap_spans_multiple_words() {
        let mut arena = StableIndexArena::new();
        for i in 0..130 {
            assert_eq!(arena.emplace(i), i);
        }
        arena.remove(64);
        arena.remove(129);
        assert_eq!(arena.emplace(1000), 64);
        assert_eq!(arena.emplace(1001), 129);
        assert_eq!(arena.emplace(1002), 130);
        assert_eq!(*arena.at(63), 63);
        assert_eq!(*arena.at(65), 65);
    }

    #[test]
    fn test_indices_stable_under_churn() {
        // Deterministic pseudo-random traffic; every live index must keep
        // resolving to the value stored when it was returned.
        let mut arena = StableIndexArena::new();
        let mut live: Vec<(usize, u64)> = Vec::new();
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        for step in 0..2000u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            if live.is_empty() || state % 3 != 0 {
                let index = arena.emplace(step);
                assert!(live.iter().all(|&(i, _)| i != index));
                live.push((index, step));
            } else {
                let victim = (state as usize / 3) % live.len();
                let (index, value) = live.swap_remove(victim);
                assert_eq!(arena.remove(index), value);
            }
            for &(index, value) in &live {
                assert_eq!(*arena.at(index), value);
            }
        }
        assert_eq!(arena.len(), live.len());
    }

    #[test]
    fn test_drain_empties_but_keeps_slots() {
        let mut arena = StableIndexArena::new();
        arena.emplace('a');
        arena.emplace('b');
        let drained = arena.drain();
        assert_eq!(drained, vec!['a', 'b']);
        assert!(arena.is_empty());
        assert_eq!(arena.size(), 2);
        assert_eq!(arena.emplace('c'), 0);
    }

    #[test]
    fn test_at_mut_updates_in_place() {
        let mut arena = StableIndexArena::new();
        let index = arena.emplace(vec![1]);
        arena.at_mut(index).push(2);
        assert_eq!(arena.at(index), &vec![1, 2]);
    }
}
