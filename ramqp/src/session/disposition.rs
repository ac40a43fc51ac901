use std::collections::BTreeMap;

use super::range::RangeSet;
use crate::types::DeliveryId;

/// Outstanding deliveries of one session, keyed by delivery id.
///
/// Range operations walk the id ranges in order against the sorted map; ids
/// without a listener (already settled or never registered) are skipped.
#[derive(Debug)]
pub struct DispositionMap<L> {
    listeners: BTreeMap<DeliveryId, L>,
}

impl<L> Default for DispositionMap<L> {
    fn default() -> Self {
        Self { listeners: BTreeMap::new() }
    }
}

impl<L> DispositionMap<L> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// One listener per id, a second registration replaces and returns the first.
    #[inline]
    pub fn register(&mut self, id: DeliveryId, listener: L) -> Option<L> {
        self.listeners.insert(id, listener)
    }

    /// Removes every listener within `ranges` and hands it to `f`, in id order.
    pub fn disposition_change<F>(&mut self, ranges: &RangeSet, mut f: F)
    where
        F: FnMut(DeliveryId, L),
    {
        for range in ranges.ranges() {
            let ids: Vec<DeliveryId> = self.listeners.range(range.lower()..=range.upper()).map(|(id, _)| *id).collect();
            for id in ids {
                if let Some(listener) = self.listeners.remove(&id) {
                    f(id, listener);
                }
            }
        }
    }

    /// Asks `f` to acquire each listener within `ranges`, leaving them registered.
    /// Returns the ids that were acquired.
    pub fn acquire<F>(&self, ranges: &RangeSet, mut f: F) -> RangeSet
    where
        F: FnMut(DeliveryId, &L) -> bool,
    {
        let mut acquired = RangeSet::new();
        for range in ranges.ranges() {
            for (id, listener) in self.listeners.range(range.lower()..=range.upper()) {
                if f(*id, listener) {
                    acquired.add_id(*id);
                }
            }
        }
        acquired
    }

    /// Removes the listeners matching `f`.
    pub fn remove_where<F>(&mut self, mut f: F) -> Vec<(DeliveryId, L)>
    where
        F: FnMut(&L) -> bool,
    {
        let ids: Vec<DeliveryId> = self.listeners.iter().filter(|(_, l)| f(l)).map(|(id, _)| *id).collect();
        ids.into_iter().filter_map(|id| self.listeners.remove(&id).map(|l| (id, l))).collect()
    }

    /// Takes every outstanding listener, lowest id first.
    #[inline]
    pub fn drain(&mut self) -> Vec<(DeliveryId, L)> {
        std::mem::take(&mut self.listeners).into_iter().collect()
    }

    #[inline]
    pub fn get(&self, id: DeliveryId) -> Option<&L> {
        self.listeners.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(ids: &[DeliveryId]) -> DispositionMap<&'static str> {
        let mut m = DispositionMap::new();
        for id in ids {
            m.register(*id, "l");
        }
        m
    }

    #[test]
    fn change_walks_ranges_and_skips_unknown() {
        let mut m = map(&[1, 2, 3, 5, 8, 9]);
        let mut ranges = RangeSet::new();
        ranges.add(2, 5);
        ranges.add(7, 8);
        ranges.add_id(100);

        let mut seen = Vec::new();
        m.disposition_change(&ranges, |id, _| seen.push(id));
        assert_eq!(seen, vec![2, 3, 5, 8]);
        assert_eq!(m.len(), 2);

        //settled ids are gone
        let mut again = Vec::new();
        m.disposition_change(&ranges, |id, _| again.push(id));
        assert!(again.is_empty());
    }

    #[test]
    fn acquire_keeps_listeners() {
        let m = map(&[1, 2, 3, 4]);
        let acquired = m.acquire(&RangeSet::from(crate::session::Range::new(1, 4)), |id, _| id % 2 == 0);
        assert_eq!(acquired.ids().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn drain_and_remove_where() {
        let mut m = DispositionMap::new();
        m.register(1, "a");
        m.register(2, "b");
        m.register(3, "a");
        assert_eq!(m.remove_where(|l| *l == "a"), vec![(1, "a"), (3, "a")]);
        assert_eq!(m.drain(), vec![(2, "b")]);
        assert!(m.is_empty());
    }
}
