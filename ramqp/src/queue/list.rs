use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::entry::QueueEntry;
use crate::message::ServerMessage;
use crate::types::QueueName;

/// Ordered entries of one queue.
pub trait QueueEntryList: Send + Sync {
    /// Appends at the tail of the sub-list the message belongs to.
    fn add(&self, message: ServerMessage) -> Arc<QueueEntry>;

    /// The entry after `entry` in delivery order, skipping entries that left the queue.
    fn next(&self, entry: &QueueEntry) -> Option<Arc<QueueEntry>>;

    /// The first entry still on the list.
    fn first(&self) -> Option<Arc<QueueEntry>>;

    /// Fresh iterator from the head. Restart by asking for a new one.
    fn iter(&self) -> Box<dyn QueueEntryIterator>;

    /// Bookkeeping after `entry` reached a terminal state. Call once per entry.
    fn entry_deleted(&self, entry: &QueueEntry);

    /// Entries not yet in a terminal state.
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn priorities(&self) -> u8 {
        1
    }
}

pub trait QueueEntryIterator: Iterator<Item = Arc<QueueEntry>> + Send {
    /// No entry follows the current position.
    fn at_tail(&self) -> bool;
}

/// Identity stamped on every entry a list creates.
#[derive(Clone, Debug)]
pub(crate) struct ListOwner {
    pub queue: QueueName,
    pub durable: bool,
}

/// FIFO run of entries sorted by `seq`. Terminal entries stay in place until they
/// reach the head.
#[derive(Clone, Default)]
pub(crate) struct SubList {
    entries: Arc<RwLock<VecDeque<Arc<QueueEntry>>>>,
}

impl SubList {
    #[inline]
    pub(crate) fn push<F>(&self, seq: &AtomicU64, make: F) -> Arc<QueueEntry>
    where
        F: FnOnce(u64) -> QueueEntry,
    {
        let mut entries = self.entries.write();
        let entry = Arc::new(make(seq.fetch_add(1, Ordering::SeqCst)));
        entries.push_back(entry.clone());
        entry
    }

    #[inline]
    pub(crate) fn first(&self) -> Option<Arc<QueueEntry>> {
        self.entries.read().iter().find(|e| !e.is_deleted()).cloned()
    }

    #[inline]
    pub(crate) fn next_after(&self, seq: u64) -> Option<Arc<QueueEntry>> {
        let entries = self.entries.read();
        let start = entries.partition_point(|e| e.seq() <= seq);
        entries.range(start..).find(|e| !e.is_deleted()).cloned()
    }

    /// Unlinks terminal entries from the head.
    #[inline]
    pub(crate) fn trim(&self) {
        let mut entries = self.entries.write();
        while entries.front().map(|e| e.is_deleted()).unwrap_or(false) {
            entries.pop_front();
        }
    }

    #[inline]
    pub(crate) fn iter(&self) -> SubListIter {
        SubListIter { list: self.clone(), last: None }
    }
}

pub(crate) struct SubListIter {
    list: SubList,
    last: Option<u64>,
}

impl SubListIter {
    #[inline]
    fn peek(&self) -> Option<Arc<QueueEntry>> {
        match self.last {
            None => self.list.first(),
            Some(seq) => self.list.next_after(seq),
        }
    }

    #[inline]
    pub(crate) fn at_tail(&self) -> bool {
        self.peek().is_none()
    }
}

impl Iterator for SubListIter {
    type Item = Arc<QueueEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let next = self.peek()?;
        self.last = Some(next.seq());
        Some(next)
    }
}

/// Plain FIFO list.
pub struct SimpleQueueEntryList {
    owner: ListOwner,
    list: SubList,
    seq: AtomicU64,
    live: AtomicUsize,
}

impl SimpleQueueEntryList {
    pub fn new(queue: QueueName, durable: bool) -> Self {
        Self {
            owner: ListOwner { queue, durable },
            list: SubList::default(),
            seq: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }
}

impl QueueEntryList for SimpleQueueEntryList {
    fn add(&self, message: ServerMessage) -> Arc<QueueEntry> {
        let owner = &self.owner;
        let entry =
            self.list.push(&self.seq, |seq| QueueEntry::new(owner.queue.clone(), owner.durable, seq, 0, message));
        self.live.fetch_add(1, Ordering::SeqCst);
        entry
    }

    #[inline]
    fn next(&self, entry: &QueueEntry) -> Option<Arc<QueueEntry>> {
        self.list.next_after(entry.seq())
    }

    #[inline]
    fn first(&self) -> Option<Arc<QueueEntry>> {
        self.list.first()
    }

    fn iter(&self) -> Box<dyn QueueEntryIterator> {
        Box::new(SimpleIter(self.list.iter()))
    }

    fn entry_deleted(&self, _entry: &QueueEntry) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.list.trim();
    }

    #[inline]
    fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct SimpleIter(SubListIter);

impl Iterator for SimpleIter {
    type Item = Arc<QueueEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl QueueEntryIterator for SimpleIter {
    #[inline]
    fn at_tail(&self) -> bool {
        self.0.at_tail()
    }
}
