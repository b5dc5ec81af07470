/// Packet identifier tracking with sorted, merged half-open intervals.
///
/// Where the blast receiver kept a bitfield per chunk, a windowed fetch needs
/// to hand whole runs of identifiers back and forth (outstanding, in flight,
/// lost), so identifiers are kept as `[start, end)` runs:
///
/// ```text
/// {0,1,2,3,4, 6,7,8,9}  ==>  [0,5) [6,10)
/// ```
///
/// After every mutation the runs are sorted by start and no two runs touch or
/// overlap (`prev.end < next.start`).
///
/// Wire encoding:
///
/// ```text
/// [0]      Interval count (u8, at most 255)
/// [1..]    count x (start u64 LE, end u64 LE), ascending
/// ```

use std::fmt;
use std::iter::FusedIterator;

use bytes::BufMut;

use crate::error::{DecodeError, EncodeError};
use crate::reader::Reader;

/// Most intervals a single encoded set can carry.
pub const MAX_ENCODED_INTERVALS: usize = u8::MAX as usize;

/// Encoded size of one interval pair.
pub const ENCODED_INTERVAL_SIZE: usize = 16;

/// A half-open run `[start, end)`. Never empty inside an [`IntervalSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.start <= value && value < self.end
    }
}

/// Ordered set of `u64` identifiers stored as disjoint intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding one identifier.
    pub fn single(value: u64) -> Self {
        let mut set = Self::new();
        set.add(value);
        set
    }

    /// Set holding `[start, end)`. Empty when `end <= start`.
    pub fn from_range(start: u64, end: u64) -> Self {
        let mut set = Self::new();
        set.add_range(start, end);
        set
    }

    /// Add one identifier. `u64::MAX` cannot be represented and is ignored.
    pub fn add(&mut self, value: u64) {
        self.add_range(value, value.saturating_add(1));
    }

    /// Add `[start, end)`. No-op when `end <= start`.
    pub fn add_range(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        self.insert_sorted(Interval { start, end });
        self.merge();
    }

    /// Add every identifier of `other`.
    pub fn add_set(&mut self, other: &IntervalSet) {
        if other.is_empty() {
            return;
        }
        for &interval in &other.intervals {
            self.insert_sorted(interval);
        }
        self.merge();
    }

    /// Remove one identifier, splitting its interval if needed.
    pub fn subtract(&mut self, value: u64) {
        self.subtract_range(value, value.saturating_add(1));
    }

    /// Remove `[start, end)`. No-op when `end <= start`.
    pub fn subtract_range(&mut self, start: u64, end: u64) {
        if end <= start || self.intervals.is_empty() {
            return;
        }

        let mut kept = Vec::with_capacity(self.intervals.len() + 1);
        for interval in std::mem::take(&mut self.intervals) {
            if interval.end <= start || interval.start >= end {
                kept.push(interval);
                continue;
            }
            // Left remainder, right remainder, or both when the removed
            // range sits strictly inside.
            if interval.start < start {
                kept.push(Interval {
                    start: interval.start,
                    end: start,
                });
            }
            if interval.end > end {
                kept.push(Interval {
                    start: end,
                    end: interval.end,
                });
            }
        }
        self.intervals = kept;
    }

    /// Remove every identifier of `other`.
    pub fn subtract_set(&mut self, other: &IntervalSet) {
        for interval in &other.intervals {
            if self.intervals.is_empty() {
                break;
            }
            self.subtract_range(interval.start, interval.end);
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.intervals.iter().any(|i| i.contains(value))
    }

    /// Total number of identifiers.
    pub fn element_count(&self) -> u64 {
        self.intervals.iter().map(Interval::len).sum()
    }

    #[inline]
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The stored runs, ascending.
    #[inline]
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Lowest identifier, if any.
    pub fn first(&self) -> Option<u64> {
        self.intervals.first().map(|i| i.start)
    }

    /// The first `n` identifiers in ascending order (all of them if fewer).
    pub fn first_n(&self, n: u64) -> IntervalSet {
        let mut taken = IntervalSet::new();
        let mut remaining = n;
        for interval in &self.intervals {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(interval.len());
            // Prefixes of a valid set are still disjoint and non-touching.
            taken.intervals.push(Interval {
                start: interval.start,
                end: interval.start + take,
            });
            remaining -= take;
        }
        taken
    }

    /// Like [`first_n`](Self::first_n), but also removes the returned
    /// identifiers from `self`.
    pub fn remove_first_n(&mut self, n: u64) -> IntervalSet {
        let taken = self.first_n(n);

        let mut remaining = n;
        let mut consumed = 0;
        for interval in self.intervals.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(interval.len());
            interval.start += take;
            remaining -= take;
            if interval.is_empty() {
                consumed += 1;
            }
        }
        self.intervals.drain(..consumed);

        taken
    }

    /// Ascending iterator over the identifiers. Each call starts from the
    /// beginning; iterating never mutates the set.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            intervals: self.intervals.iter(),
            current: 0..0,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + self.intervals.len() * ENCODED_INTERVAL_SIZE
    }

    /// Append the wire encoding to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), EncodeError> {
        let count = u8::try_from(self.intervals.len())
            .map_err(|_| EncodeError::TooManyIntervals(self.intervals.len()))?;
        buf.put_u8(count);
        for interval in &self.intervals {
            buf.put_u64_le(interval.start);
            buf.put_u64_le(interval.end);
        }
        Ok(())
    }

    /// Decode from the cursor. Pairs are re-added, so an unsorted or
    /// overlapping encoding still yields a valid set.
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u8("interval count")?;
        let mut set = IntervalSet::new();
        for _ in 0..count {
            let start = reader.read_u64("interval start")?;
            let end = reader.read_u64("interval end")?;
            set.add_range(start, end);
        }
        Ok(set)
    }

    /// Insert after every interval with a start <= the new start.
    fn insert_sorted(&mut self, interval: Interval) {
        let idx = self
            .intervals
            .partition_point(|existing| existing.start <= interval.start);
        self.intervals.insert(idx, interval);
    }

    /// Sorted input allows a single greedy pass: only the previous interval
    /// can absorb the next one.
    fn merge(&mut self) {
        if self.intervals.len() < 2 {
            return;
        }
        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for interval in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.end >= interval.start => {
                    prev.end = prev.end.max(interval.end);
                }
                _ => merged.push(interval),
            }
        }
        self.intervals = merged;
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.intervals.is_empty() {
            return write!(f, "[]");
        }
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "[{},{})", interval.start, interval.end)?;
        }
        Ok(())
    }
}

impl FromIterator<u64> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = IntervalSet::new();
        for value in iter {
            set.add(value);
        }
        set
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = u64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Ascending identifiers of an [`IntervalSet`], advancing interval by interval.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    intervals: std::slice::Iter<'a, Interval>,
    current: std::ops::Range<u64>,
}

impl Iterator for Iter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if let Some(value) = self.current.next() {
                return Some(value);
            }
            let interval = self.intervals.next()?;
            self.current = interval.start..interval.end;
        }
    }
}

impl FusedIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set_of(ranges: &[(u64, u64)]) -> IntervalSet {
        let mut set = IntervalSet::new();
        for &(start, end) in ranges {
            set.add_range(start, end);
        }
        set
    }

    fn pairs(set: &IntervalSet) -> Vec<(u64, u64)> {
        set.intervals().iter().map(|i| (i.start, i.end)).collect()
    }

    fn assert_canonical(set: &IntervalSet) {
        for interval in set.intervals() {
            assert!(interval.start < interval.end, "empty interval in {set}");
        }
        for w in set.intervals().windows(2) {
            assert!(w[0].end < w[1].start, "touching/overlapping in {set}");
        }
    }

    #[test]
    fn test_constructors() {
        let empty = IntervalSet::new();
        assert_eq!(empty.interval_count(), 0);
        assert!(empty.is_empty());

        let range = IntervalSet::from_range(0, 10);
        assert_eq!(range.interval_count(), 1);
        assert_eq!(range.element_count(), 10);

        assert!(IntervalSet::from_range(5, 5).is_empty());
        assert!(IntervalSet::from_range(9, 3).is_empty());
        assert_eq!(pairs(&IntervalSet::single(7)), vec![(7, 8)]);
    }

    #[test]
    fn test_iterator() {
        assert_eq!(IntervalSet::new().iter().next(), None);

        let set = IntervalSet::from_range(3, 10);
        assert_eq!(set.iter().collect::<Vec<_>>(), (3..10).collect::<Vec<_>>());
        // Restartable.
        assert_eq!(set.iter().count(), 7);
        assert_eq!((&set).into_iter().count(), 7);
    }

    #[test]
    fn test_add_number() {
        let mut set = IntervalSet::new();
        set.add(4);
        assert_eq!(set.interval_count(), 1);
        set.add(5);
        assert_eq!(set.interval_count(), 1);
        set.add(7);
        assert_eq!(set.interval_count(), 2);
        assert_eq!(set.element_count(), 3);
        // Filling the gap joins both runs.
        set.add(6);
        assert_eq!(pairs(&set), vec![(4, 8)]);
    }

    #[test]
    fn test_add_interval() {
        let mut set = IntervalSet::from_range(0, 3);
        set.add_range(4, 8);
        assert_eq!(pairs(&set), vec![(0, 3), (4, 8)]);

        set.add_range(1, 7);
        assert_eq!(pairs(&set), vec![(0, 8)]);
        assert_eq!(set.iter().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let mut set = IntervalSet::from_range(10, 20);
        set.add_range(0, 10);
        assert_eq!(pairs(&set), vec![(0, 20)]);
        set.add_range(20, 25);
        assert_eq!(pairs(&set), vec![(0, 25)]);
    }

    #[test]
    fn test_add_set() {
        let mut a = set_of(&[(0, 3), (4, 8)]);
        let b = set_of(&[(1, 7), (10, 13)]);
        a.add_set(&b);
        assert_eq!(pairs(&a), vec![(0, 8), (10, 13)]);
    }

    #[test]
    fn test_subtract_number() {
        let mut set = IntervalSet::from_range(0, 10);
        set.subtract(5);
        assert_eq!(pairs(&set), vec![(0, 5), (6, 10)]);
        assert_eq!(set.element_count(), 9);

        // Edges shrink instead of splitting.
        set.subtract(0);
        set.subtract(9);
        assert_eq!(pairs(&set), vec![(1, 5), (6, 9)]);

        // Absent values are a no-op.
        set.subtract(5);
        set.subtract(100);
        assert_eq!(pairs(&set), vec![(1, 5), (6, 9)]);
    }

    #[test]
    fn test_subtract_interval() {
        let mut set = IntervalSet::from_range(0, 10);
        set.subtract_range(3, 5);
        assert_eq!(pairs(&set), vec![(0, 3), (5, 10)]);

        set.subtract_range(2, 6);
        assert_eq!(pairs(&set), vec![(0, 2), (6, 10)]);

        set.subtract_range(0, 100);
        assert!(set.is_empty());
        assert_eq!(set.element_count(), 0);
    }

    #[test]
    fn test_subtract_set() {
        let mut set = IntervalSet::from_range(0, 10);
        let other = set_of(&[(1, 3), (7, 8)]);
        set.subtract_set(&other);
        assert_eq!(pairs(&set), vec![(0, 1), (3, 7), (8, 10)]);
    }

    #[test]
    fn test_contains() {
        let set = set_of(&[(3, 5), (8, 10)]);
        assert!(!set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(4));
        assert!(!set.contains(5));
        assert!(set.contains(9));
        assert!(!set.contains(10));
    }

    #[test]
    fn test_first_n() {
        let set = set_of(&[(0, 3), (7, 10)]);
        let first = set.first_n(5);
        assert_eq!(first.element_count(), 5);
        assert_eq!(pairs(&first), vec![(0, 3), (7, 9)]);
        // Read-only.
        assert_eq!(set.element_count(), 6);

        assert_eq!(set.first_n(0), IntervalSet::new());
        assert_eq!(set.first_n(100), set);
    }

    #[test]
    fn test_remove_first_n() {
        let mut set = set_of(&[(0, 3), (7, 10)]);
        let taken = set.remove_first_n(4);
        assert_eq!(pairs(&taken), vec![(0, 3), (7, 8)]);
        assert_eq!(pairs(&set), vec![(8, 10)]);

        let rest = set.remove_first_n(10);
        assert_eq!(pairs(&rest), vec![(8, 10)]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_serialization() {
        let mut set = IntervalSet::from_range(3, 5);
        set.add_range(8, 10);

        let mut buf = Vec::new();
        set.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), set.encoded_len());
        assert_eq!(buf.len(), 1 + 2 * 16);
        assert_eq!(buf[0], 2);
        assert_eq!(u64::from_le_bytes(buf[1..9].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(buf[9..17].try_into().unwrap()), 5);
        assert_eq!(u64::from_le_bytes(buf[17..25].try_into().unwrap()), 8);
        assert_eq!(u64::from_le_bytes(buf[25..33].try_into().unwrap()), 10);

        let parsed = IntervalSet::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_decode_remerges_unsorted_pairs() {
        let mut buf = vec![2u8];
        for v in [5u64, 9, 0, 5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let parsed = IntervalSet::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(pairs(&parsed), vec![(0, 9)]);
    }

    #[test]
    fn test_decode_truncated() {
        let set = set_of(&[(1, 2), (4, 6)]);
        let mut buf = Vec::new();
        set.encode(&mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(
                IntervalSet::decode(&mut Reader::new(&buf[..cut])).is_err(),
                "decoding {cut} of {} bytes should fail",
                buf.len()
            );
        }
    }

    #[test]
    fn test_too_many_intervals() {
        let set: IntervalSet = (0..256u64).map(|i| i * 2).collect();
        assert_eq!(set.interval_count(), 256);
        let mut buf = Vec::new();
        assert_eq!(set.encode(&mut buf), Err(EncodeError::TooManyIntervals(256)));

        let fits: IntervalSet = (0..255u64).map(|i| i * 2).collect();
        assert!(fits.encode(&mut buf).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(IntervalSet::new().to_string(), "[]");
        assert_eq!(set_of(&[(0, 5), (6, 10)]).to_string(), "[0,5) [6,10)");
    }

    fn interval_set_strategy() -> impl Strategy<Value = IntervalSet> {
        prop::collection::vec((0u64..500, 0u64..40), 0..24).prop_map(|runs| {
            let mut set = IntervalSet::new();
            for (start, len) in runs {
                set.add_range(start, start + len);
            }
            set
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn union_is_sorted_and_merged(a in interval_set_strategy(), b in interval_set_strategy()) {
            let mut union = a.clone();
            union.add_set(&b);
            assert_canonical(&union);

            let values: Vec<u64> = union.iter().collect();
            prop_assert!(values.windows(2).all(|w| w[0] < w[1]));

            let mut expected: Vec<u64> = a.iter().chain(b.iter()).collect();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(values, expected);
        }

        #[test]
        fn subtract_self_is_empty(a in interval_set_strategy()) {
            let mut set = a.clone();
            set.subtract_set(&a);
            prop_assert!(set.is_empty());
            prop_assert_eq!(set.element_count(), 0);
        }

        #[test]
        fn difference_matches_elementwise(a in interval_set_strategy(), b in interval_set_strategy()) {
            let mut diff = a.clone();
            diff.subtract_set(&b);
            assert_canonical(&diff);
            let expected: Vec<u64> = a.iter().filter(|v| !b.contains(*v)).collect();
            prop_assert_eq!(diff.iter().collect::<Vec<_>>(), expected);
        }

        #[test]
        fn remove_first_n_partitions(a in interval_set_strategy(), frac in 0.0f64..=1.0) {
            let total = a.element_count();
            let k = (total as f64 * frac).floor() as u64;

            let mut rest = a.clone();
            let taken = rest.remove_first_n(k);
            assert_canonical(&taken);
            assert_canonical(&rest);

            prop_assert_eq!(taken.element_count(), k);
            prop_assert_eq!(rest.element_count(), total - k);
            prop_assert!(taken.iter().all(|v| !rest.contains(v)));

            let mut union = taken.clone();
            union.add_set(&rest);
            prop_assert_eq!(union, a);
        }

        #[test]
        fn encoding_roundtrips(a in interval_set_strategy()) {
            let mut buf = Vec::new();
            a.encode(&mut buf).unwrap();
            let mut reader = Reader::new(&buf);
            let parsed = IntervalSet::decode(&mut reader).unwrap();
            prop_assert_eq!(reader.remaining(), 0);
            prop_assert_eq!(parsed, a);
        }
    }
}
