use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DeliveryId;

/// Inclusive id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    lower: DeliveryId,
    upper: DeliveryId,
}

impl Range {
    #[inline]
    pub fn new(lower: DeliveryId, upper: DeliveryId) -> Self {
        if lower <= upper {
            Self { lower, upper }
        } else {
            Self { lower: upper, upper: lower }
        }
    }

    #[inline]
    pub fn single(id: DeliveryId) -> Self {
        Self { lower: id, upper: id }
    }

    #[inline]
    pub fn lower(&self) -> DeliveryId {
        self.lower
    }

    #[inline]
    pub fn upper(&self) -> DeliveryId {
        self.upper
    }

    #[inline]
    pub fn contains(&self, id: DeliveryId) -> bool {
        self.lower <= id && id <= self.upper
    }

    /// Overlapping or adjacent.
    #[inline]
    fn touches(&self, other: &Range) -> bool {
        self.lower <= other.upper.saturating_add(1) && other.lower <= self.upper.saturating_add(1)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}-{}", self.lower, self.upper)
        }
    }
}

/// Sorted set of disjoint, non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, range: Range) {
        let start = self.ranges.partition_point(|r| r.upper.saturating_add(1) < range.lower);
        let mut end = start;
        let mut merged = range;
        while end < self.ranges.len() && self.ranges[end].touches(&merged) {
            merged = Range {
                lower: merged.lower.min(self.ranges[end].lower),
                upper: merged.upper.max(self.ranges[end].upper),
            };
            end += 1;
        }
        self.ranges.splice(start..end, [merged]);
    }

    #[inline]
    pub fn add(&mut self, lower: DeliveryId, upper: DeliveryId) {
        self.add_range(Range::new(lower, upper))
    }

    #[inline]
    pub fn add_id(&mut self, id: DeliveryId) {
        self.add_range(Range::single(id))
    }

    #[inline]
    pub fn includes(&self, id: DeliveryId) -> bool {
        let i = self.ranges.partition_point(|r| r.upper < id);
        self.ranges.get(i).is_some_and(|r| r.contains(id))
    }

    #[inline]
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Every id in the set, ascending.
    pub fn ids(&self) -> impl Iterator<Item = DeliveryId> + '_ {
        self.ranges.iter().flat_map(|r| r.lower..=r.upper)
    }
}

impl FromIterator<DeliveryId> for RangeSet {
    fn from_iter<T: IntoIterator<Item = DeliveryId>>(iter: T) -> Self {
        let mut set = RangeSet::new();
        for id in iter {
            set.add_id(id);
        }
        set
    }
}

impl From<Range> for RangeSet {
    fn from(range: Range) -> Self {
        Self { ranges: vec![range] }
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", itertools::join(self.ranges.iter(), ", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_overlapping_and_adjacent() {
        let mut set = RangeSet::new();
        set.add(10, 12);
        set.add(1, 3);
        set.add(4, 5);
        set.add(20, 20);
        assert_eq!(set.to_string(), "[1-5, 10-12, 20]");

        set.add(6, 19);
        assert_eq!(set.ranges(), &[Range::new(1, 20)]);

        set.add_id(u32::MAX);
        set.add_id(u32::MAX - 1);
        assert_eq!(set.ranges().len(), 2);
        assert!(set.includes(u32::MAX));
        assert!(!set.includes(21));
    }

    #[test]
    fn ids_in_order() {
        let set: RangeSet = [7, 3, 2, 9, 8].into_iter().collect();
        assert_eq!(set.ids().collect::<Vec<_>>(), vec![2, 3, 7, 8, 9]);
        assert_eq!(Range::new(5, 1), Range::new(1, 5));
    }
}
