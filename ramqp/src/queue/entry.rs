use std::cmp;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::message::ServerMessage;
use crate::txn::{EnqueueableMessage, TransactionLogResource};
use crate::types::{ConsumerId, MessageNumber, QueueName, TimestampMillis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryState {
    Available = 0,
    Acquired = 1,
    Acknowledged = 2,
    DeadLettered = 3,
    /// Expired or purged.
    Deleted = 4,
}

impl EntryState {
    #[inline]
    fn from_u8(v: u8) -> EntryState {
        match v {
            0 => EntryState::Available,
            1 => EntryState::Acquired,
            2 => EntryState::Acknowledged,
            3 => EntryState::DeadLettered,
            _ => EntryState::Deleted,
        }
    }

    /// The entry has left its queue and is skipped by every traversal.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Acknowledged | EntryState::DeadLettered | EntryState::Deleted)
    }
}

const NO_CONSUMER: ConsumerId = 0;
const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = 0xff;

#[inline]
fn pack(state: EntryState, holder: ConsumerId) -> u64 {
    (holder << STATE_BITS) | state as u64
}

/// A queue's hold on one message.
///
/// State and holder share one atomic word and every change is a compare-and-set
/// on it, so at most one consumer holds an entry and each terminal transition
/// happens exactly once.
pub struct QueueEntry {
    queue: QueueName,
    queue_durable: bool,
    seq: u64,
    level: usize,
    message: ServerMessage,
    word: AtomicU64,
    delivery_count: AtomicU32,
    redelivered: AtomicBool,
}

impl QueueEntry {
    pub(crate) fn new(queue: QueueName, queue_durable: bool, seq: u64, level: usize, message: ServerMessage) -> Self {
        Self {
            queue,
            queue_durable,
            seq,
            level,
            message,
            word: AtomicU64::new(pack(EntryState::Available, NO_CONSUMER)),
            delivery_count: AtomicU32::new(0),
            redelivered: AtomicBool::new(false),
        }
    }

    /// Enqueue order within the owning queue.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Index of the sub-list holding the entry, higher is more urgent.
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn message(&self) -> &ServerMessage {
        &self.message
    }

    #[inline]
    pub fn queue_name(&self) -> &QueueName {
        &self.queue
    }

    #[inline]
    pub fn state(&self) -> EntryState {
        EntryState::from_u8((self.word.load(Ordering::SeqCst) & STATE_MASK) as u8)
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.state() == EntryState::Available
    }

    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.state() == EntryState::Acquired
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.state().is_terminal()
    }

    #[inline]
    pub fn acquired_by(&self) -> Option<ConsumerId> {
        let word = self.word.load(Ordering::SeqCst);
        match word >> STATE_BITS {
            NO_CONSUMER => None,
            _ if word & STATE_MASK != EntryState::Acquired as u64 => None,
            id => Some(id),
        }
    }

    #[inline]
    pub fn is_acquired_by(&self, consumer: ConsumerId) -> bool {
        self.is_acquired() && self.acquired_by() == Some(consumer)
    }

    #[inline]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn increment_delivery_count(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.message.is_expired(now)
    }

    /// Moves `from` -> `to`. `holder` replaces the recorded consumer, `None` keeps it.
    #[inline]
    fn transition(&self, from: EntryState, to: EntryState, holder: Option<ConsumerId>) -> bool {
        let mut current = self.word.load(Ordering::SeqCst);
        loop {
            if current & STATE_MASK != from as u64 {
                return false;
            }
            let next = pack(to, holder.unwrap_or(current >> STATE_BITS));
            match self.word.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Exclusive hand-off to `consumer`.
    #[inline]
    pub fn acquire(&self, consumer: ConsumerId) -> bool {
        self.transition(EntryState::Available, EntryState::Acquired, Some(consumer))
    }

    /// Back to available, marked redelivered.
    #[inline]
    pub fn release(&self) -> bool {
        if self.transition(EntryState::Acquired, EntryState::Available, Some(NO_CONSUMER)) {
            self.redelivered.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Gives the entry back without counting it as a delivery, for hand-offs that never
    /// reached the consumer.
    #[inline]
    pub(crate) fn unacquire(&self) -> bool {
        self.transition(EntryState::Acquired, EntryState::Available, Some(NO_CONSUMER))
    }

    #[inline]
    pub fn acknowledge(&self) -> bool {
        self.transition(EntryState::Acquired, EntryState::Acknowledged, None)
    }

    #[inline]
    pub fn dead_letter(&self) -> bool {
        self.transition(EntryState::Acquired, EntryState::DeadLettered, None)
    }

    /// Drops an entry that is no longer wanted, whether or not it is held.
    #[inline]
    pub fn delete(&self) -> bool {
        self.transition(EntryState::Available, EntryState::Deleted, None)
            || self.transition(EntryState::Acquired, EntryState::Deleted, None)
    }

    /// Delivery order: higher priority first, then enqueue order.
    #[inline]
    pub fn compare_position(&self, other: &QueueEntry) -> cmp::Ordering {
        other.level.cmp(&self.level).then(self.seq.cmp(&other.seq))
    }
}

impl TransactionLogResource for QueueEntry {
    #[inline]
    fn resource_name(&self) -> &QueueName {
        &self.queue
    }

    #[inline]
    fn is_durable(&self) -> bool {
        self.queue_durable
    }
}

impl EnqueueableMessage for ServerMessage {
    #[inline]
    fn message_number(&self) -> MessageNumber {
        self.number()
    }

    #[inline]
    fn is_persistent(&self) -> bool {
        self.meta().is_persistent()
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("queue", &self.queue)
            .field("seq", &self.seq)
            .field("level", &self.level)
            .field("message", &self.message.number())
            .field("state", &self.state())
            .field("acquired_by", &self.acquired_by())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::{ContentHeader, MessageMetaData, MessagePublishInfo};

    fn entry() -> QueueEntry {
        let meta = MessageMetaData::new(MessagePublishInfo::new("", "q"), ContentHeader::new(), 0);
        QueueEntry::new("q".into(), false, 0, 0, ServerMessage::new(1, meta, Bytes::new()))
    }

    #[test]
    fn single_holder() {
        let e = entry();
        assert!(e.acquire(7));
        assert!(!e.acquire(8));
        assert!(e.is_acquired_by(7));
        assert!(!e.is_acquired_by(8));

        assert!(e.release());
        assert!(!e.release());
        assert!(e.is_redelivered());
        assert_eq!(e.acquired_by(), None);

        assert!(e.acquire(8));
        assert!(e.acknowledge());
        assert!(!e.acknowledge());
        assert!(!e.acquire(9));
        assert!(e.is_deleted());
        assert!(!e.delete());
    }

    #[test]
    fn terminal_states() {
        let e = entry();
        assert!(!e.dead_letter());
        assert!(e.acquire(1));
        assert!(e.dead_letter());
        assert_eq!(e.state(), EntryState::DeadLettered);

        let e = entry();
        assert!(e.delete());
        assert_eq!(e.state(), EntryState::Deleted);

        let e = entry();
        assert!(e.acquire(1));
        assert!(e.unacquire());
        assert!(!e.is_redelivered());
        assert!(e.is_available());
    }
}
