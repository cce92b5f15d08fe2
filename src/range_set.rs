use std::{
    cmp,
    cmp::Ordering,
    collections::{btree_map, BTreeMap},
    ops::{
        Bound::{Excluded, Included},
        Range,
    },
};

use tinyvec::TinyVec;

/// A set of u64 values optimized for long runs and random insert/delete/contains
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).is_some_and(|(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        if let Some((start, end)) = self.pred(x) {
            match end.cmp(&x) {
                // Wholly contained
                Ordering::Greater => {
                    return false;
                }
                Ordering::Equal => {
                    // Extend existing
                    self.0.remove(&start);
                    let mut new_end = x + 1;
                    if let Some((next_start, next_end)) = self.succ(x) {
                        if next_start == new_end {
                            self.0.remove(&next_start);
                            new_end = next_end;
                        }
                    }
                    self.0.insert(start, new_end);
                    return true;
                }
                _ => {}
            }
        }
        let mut new_end = x + 1;
        if let Some((next_start, next_end)) = self.succ(x) {
            if next_start == new_end {
                self.0.remove(&next_start);
                new_end = next_end;
            }
        }
        self.0.insert(x, new_end);
        true
    }

    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // Wholly contained
                return false;
            } else if end >= x.start {
                // Extend overlapping predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        while let Some((next_start, next_end)) = self.succ(x.start) {
            if next_start > x.end {
                break;
            }
            // Overlaps with successor
            self.0.remove(&next_start);
            x.end = cmp::max(next_end, x.end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Find closest range to `x` that begins at or before it
    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Included(0), Included(x)))
            .next_back()
            .map(|(&x, &y)| (x, y))
    }

    /// Find the closest range to `x` that begins after it
    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Excluded(x), Included(u64::MAX)))
            .next()
            .map(|(&x, &y)| (x, y))
    }

    pub fn remove(&mut self, x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }

        let before = match self.pred(x.start) {
            Some((start, end)) if end > x.start => {
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                }
                // Short-circuit if we cannot possibly overlap with another range
                if end >= x.end {
                    return true;
                }
                true
            }
            Some(_) | None => false,
        };
        let mut after = false;
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            after = true;
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
                break;
            }
        }
        before || after
    }

    pub fn add(&mut self, other: &Self) {
        for (&start, &end) in &other.0 {
            self.insert(start..end);
        }
    }

    pub fn subtract(&mut self, other: &Self) {
        for (&start, &end) in &other.0 {
            self.remove(start..end);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn min(&self) -> Option<u64> {
        self.0.first_key_value().map(|(&start, _)| start)
    }

    pub fn max(&self) -> Option<u64> {
        self.0.last_key_value().map(|(_, &end)| end - 1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    pub fn elts(&self) -> EltIter<'_> {
        EltIter {
            inner: self.0.iter(),
            next: 0,
            end: 0,
        }
    }

    pub fn peek_min(&self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        Some(start..end)
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let result = self.peek_min()?;
        self.0.remove(&result.start);
        Some(result)
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl Iterator for Iter<'_> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.next()?;
        Some(start..end)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.next_back()?;
        Some(start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

pub struct EltIter<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
    next: u64,
    end: u64,
}

impl Iterator for EltIter<'_> {
    type Item = u64;
    fn next(&mut self) -> Option<u64> {
        if self.next == self.end {
            let (&start, &end) = self.inner.next()?;
            self.next = start;
            self.end = end;
        }
        let x = self.next;
        self.next += 1;
        Some(x)
    }
}

impl DoubleEndedIterator for EltIter<'_> {
    fn next_back(&mut self) -> Option<u64> {
        if self.next == self.end {
            let (&start, &end) = self.inner.next_back()?;
            self.next = start;
            self.end = end;
        }
        self.end -= 1;
        Some(self.end)
    }
}

/// A set of u64 values stored inline, for the handful of ranges an ACK frame
/// or a sent packet's acknowledged-range record carries
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArrayRangeSet(TinyVec<[Range<u64>; 4]>);

impl ArrayRangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.0.iter().any(|range| range.contains(&x))
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        // First range not wholly before the new one; everything from here that
        // touches the new range gets merged into it
        let start = self
            .0
            .iter()
            .position(|r| r.end >= range.start)
            .unwrap_or(self.0.len());
        let mut merged = range;
        let mut end = start;
        while end < self.0.len() && self.0[end].start <= merged.end {
            merged.start = merged.start.min(self.0[end].start);
            merged.end = merged.end.max(self.0[end].end);
            end += 1;
        }
        self.0.drain(start..end);
        self.0.insert(start, merged);
    }

    pub fn insert_one(&mut self, x: u64) {
        self.insert(x..x + 1);
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.0.len() {
            let r = self.0[i].clone();
            if r.start >= range.end {
                break;
            }
            if r.end <= range.start {
                i += 1;
                continue;
            }
            self.0.remove(i);
            if r.start < range.start {
                self.0.insert(i, r.start..range.start);
                i += 1;
            }
            if r.end > range.end {
                self.0.insert(i, range.end..r.end);
                i += 1;
            }
        }
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        if self.0.is_empty() {
            return None;
        }
        Some(self.0.remove(0))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.0.iter().cloned()
    }

    pub fn elts(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().flat_map(|r| r.clone())
    }

    pub fn min(&self) -> Option<u64> {
        self.0.first().map(|r| r.start)
    }

    pub fn max(&self) -> Option<u64> {
        self.0.last().map(|r| r.end - 1)
    }
}

impl FromIterator<Range<u64>> for ArrayRangeSet {
    fn from_iter<T: IntoIterator<Item = Range<u64>>>(iter: T) -> Self {
        let mut set = Self::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_and_split() {
        let mut set = RangeSet::new();
        assert!(set.insert(2..4));
        assert!(set.insert(6..8));
        assert_eq!(set.len(), 2);
        // Bridge the gap
        assert!(set.insert(4..6));
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek_min().unwrap(), 2..8);
        // Punch a hole
        assert!(set.remove(4..6));
        assert_eq!(set.iter().collect::<Vec<_>>(), &[2..4, 6..8]);
    }

    #[test]
    fn insert_one_extends() {
        let mut set = RangeSet::new();
        assert!(set.insert_one(5));
        assert!(!set.insert_one(5));
        assert!(set.insert_one(6));
        assert!(set.insert_one(4));
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek_min().unwrap(), 4..7);
    }

    #[test]
    fn insert_one_bridges() {
        let mut set = RangeSet::new();
        set.insert(0..2);
        set.insert(3..5);
        assert!(set.insert_one(2));
        assert_eq!(set.len(), 1);
        assert_eq!(set.peek_min().unwrap(), 0..5);
    }

    #[test]
    fn contains_and_bounds() {
        let mut set = RangeSet::new();
        set.insert(10..20);
        assert!(set.contains(10));
        assert!(set.contains(19));
        assert!(!set.contains(20));
        assert!(!set.contains(9));
        assert_eq!(set.min(), Some(10));
        assert_eq!(set.max(), Some(19));
    }

    #[test]
    fn subtract_partial_overlaps() {
        let mut a = RangeSet::new();
        a.insert(0..10);
        let mut b = RangeSet::new();
        b.insert(2..4);
        b.insert(6..12);
        a.subtract(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), &[0..2, 4..6]);
    }

    #[test]
    fn elts_iterates_members() {
        let mut set = RangeSet::new();
        set.insert(1..3);
        set.insert(5..7);
        assert_eq!(set.elts().collect::<Vec<_>>(), &[1, 2, 5, 6]);
        assert_eq!(set.elts().rev().collect::<Vec<_>>(), &[6, 5, 2, 1]);
    }

    #[test]
    fn pop_min_drains_in_order() {
        let mut set = RangeSet::new();
        set.insert(4..6);
        set.insert(0..2);
        assert_eq!(set.pop_min(), Some(0..2));
        assert_eq!(set.pop_min(), Some(4..6));
        assert_eq!(set.pop_min(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn array_insert_merges_neighbors() {
        let mut set = ArrayRangeSet::new();
        set.insert(0..2);
        set.insert(6..8);
        assert_eq!(set.len(), 2);
        // Adjacent on the left, overlapping on the right
        set.insert(2..7);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..8]);
        assert_eq!(set.min(), Some(0));
        assert_eq!(set.max(), Some(7));
    }

    #[test]
    fn array_insert_disjoint_stays_sorted() {
        let mut set = ArrayRangeSet::new();
        set.insert(8..10);
        set.insert(0..2);
        set.insert(4..5);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..2, 4..5, 8..10]);
        assert_eq!(set.elts().collect::<Vec<_>>(), &[0, 1, 4, 8, 9]);
        assert!(set.contains(4));
        assert!(!set.contains(5));
    }

    #[test]
    fn array_remove_splits_and_drops() {
        let mut set = ArrayRangeSet::new();
        set.insert(0..10);
        set.insert(12..14);
        // Punch a hole in the first range
        set.remove(2..4);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[0..2, 4..10, 12..14]);
        // Remove across several ranges
        set.remove(0..13);
        assert_eq!(set.iter().collect::<Vec<_>>(), &[13..14]);
        assert_eq!(set.pop_min(), Some(13..14));
        assert_eq!(set.pop_min(), None);
    }
}
