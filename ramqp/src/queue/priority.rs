use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::entry::QueueEntry;
use super::list::{ListOwner, QueueEntryIterator, QueueEntryList, SubList, SubListIter};
use crate::message::ServerMessage;
use crate::types::QueueName;

/// Message priority assumed when a header carries none.
pub const DEFAULT_PRIORITY: u8 = 4;

/// One FIFO sub-list per priority level. Higher levels are delivered first.
///
/// Message priorities are 0..=9. With `n` levels the priorities are centred on the
/// default: level = `priority - (5 - (n + 1) / 2)`, clamped into `0..n`.
pub struct PriorityQueueList {
    owner: ListOwner,
    lists: Vec<SubList>,
    offset: i32,
    seq: AtomicU64,
    live: AtomicUsize,
}

impl PriorityQueueList {
    pub fn new(queue: QueueName, durable: bool, priorities: u8) -> Self {
        let priorities = priorities.max(1);
        Self {
            owner: ListOwner { queue, durable },
            lists: (0..priorities).map(|_| SubList::default()).collect(),
            offset: 5 - ((priorities as i32 + 1) / 2),
            seq: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn level_of(&self, priority: u8) -> usize {
        let top = self.lists.len() as i32 - 1;
        (priority as i32 - self.offset).clamp(0, top) as usize
    }
}

impl QueueEntryList for PriorityQueueList {
    fn add(&self, message: ServerMessage) -> Arc<QueueEntry> {
        let level = self.level_of(message.priority());
        let owner = &self.owner;
        let entry = self.lists[level]
            .push(&self.seq, |seq| QueueEntry::new(owner.queue.clone(), owner.durable, seq, level, message));
        self.live.fetch_add(1, Ordering::SeqCst);
        entry
    }

    /// Continues in the entry's own level, then falls to the heads of the lower
    /// levels. Never climbs back up: an entry of a higher level added since is only
    /// seen by a fresh traversal.
    fn next(&self, entry: &QueueEntry) -> Option<Arc<QueueEntry>> {
        let level = entry.level().min(self.lists.len() - 1);
        if let Some(next) = self.lists[level].next_after(entry.seq()) {
            return Some(next);
        }
        self.lists[..level].iter().rev().find_map(|l| l.first())
    }

    fn first(&self) -> Option<Arc<QueueEntry>> {
        self.lists.iter().rev().find_map(|l| l.first())
    }

    fn iter(&self) -> Box<dyn QueueEntryIterator> {
        Box::new(PriorityIter { iters: self.lists.iter().map(|l| l.iter()).collect() })
    }

    fn entry_deleted(&self, entry: &QueueEntry) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(list) = self.lists.get(entry.level()) {
            list.trim();
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    #[inline]
    fn priorities(&self) -> u8 {
        self.lists.len() as u8
    }
}

/// Each step re-scans from the highest level, so entries that arrive at a higher
/// level while iterating are picked up before the rest of a lower one.
struct PriorityIter {
    iters: Vec<SubListIter>,
}

impl Iterator for PriorityIter {
    type Item = Arc<QueueEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iters.iter_mut().rev().find_map(|it| it.next())
    }
}

impl QueueEntryIterator for PriorityIter {
    fn at_tail(&self) -> bool {
        self.iters.iter().all(|it| it.at_tail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::list::tests::message;

    fn numbers<I: Iterator<Item = Arc<QueueEntry>>>(it: I) -> Vec<u64> {
        it.map(|e| e.message().number()).collect()
    }

    #[test]
    fn levels() {
        let list = PriorityQueueList::new("q".into(), false, 10);
        assert_eq!(list.level_of(0), 0);
        assert_eq!(list.level_of(9), 9);
        assert_eq!(list.level_of(200), 9);

        let list = PriorityQueueList::new("q".into(), false, 3);
        //offset 3, priorities 0..=3 share the lowest level
        assert_eq!(list.level_of(0), 0);
        assert_eq!(list.level_of(3), 0);
        assert_eq!(list.level_of(4), 1);
        assert_eq!(list.level_of(5), 2);
        assert_eq!(list.level_of(9), 2);
        assert_eq!(list.priorities(), 3);

        let list = PriorityQueueList::new("q".into(), false, 0);
        assert_eq!(list.priorities(), 1);
        assert_eq!(list.level_of(9), 0);
    }

    #[test]
    fn higher_priority_first_fifo_within() {
        let list = PriorityQueueList::new("q".into(), false, 10);
        //4a, 5a, 5b, 4b
        let entries: Vec<_> =
            [(1, 4), (2, 5), (3, 5), (4, 4)].iter().map(|(n, p)| list.add(message(*n, *p))).collect();
        assert_eq!(numbers(list.iter()), vec![2, 3, 1, 4]);
        assert_eq!(list.first().map(|e| e.message().number()), Some(2));

        //5b -> 4a crosses levels
        assert_eq!(list.next(&entries[2]).map(|e| e.message().number()), Some(1));
        assert_eq!(list.next(&entries[3]).map(|e| e.message().number()), None);
        assert!(entries[2].compare_position(&entries[0]).is_lt());
        assert!(entries[1].compare_position(&entries[2]).is_lt());
    }

    #[test]
    fn next_never_climbs() {
        let list = PriorityQueueList::new("q".into(), false, 10);
        let low = list.add(message(1, 2));
        let mut it = list.iter();
        assert_eq!(it.next().map(|e| e.message().number()), Some(1));
        assert!(it.at_tail());

        list.add(message(2, 3));
        list.add(message(3, 8));
        //next() from the low entry does not see the later higher entries
        assert!(list.next(&low).is_none());
        //the iterator re-scans from the top on every step
        assert!(!it.at_tail());
        assert_eq!(numbers(it), vec![3, 2]);
    }

    #[test]
    fn deletion_keeps_count() {
        let list = PriorityQueueList::new("q".into(), false, 2);
        let a = list.add(message(1, 9));
        let b = list.add(message(2, 0));
        assert_eq!(list.len(), 2);
        assert!(a.delete());
        list.entry_deleted(&a);
        assert_eq!(list.len(), 1);
        assert_eq!(list.first().map(|e| e.message().number()), Some(2));
        assert!(b.acquire(1) && b.acknowledge());
        list.entry_deleted(&b);
        assert!(list.is_empty());
        assert!(list.iter().at_tail());
    }
}
