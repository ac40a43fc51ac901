//! Queues, their entries and consumer dispatch.
//!
//! An [`AmqQueue`] owns a [`QueueEntryList`] (plain FIFO or one sub-list per
//! priority level) and a set of [`Consumer`]s. [`AmqQueue::process`] walks the
//! list and hands each available entry to the next consumer, round robin, that
//! still has credit. Consumers without credit are skipped, they never stall the
//! others.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::message::ServerMessage;
use crate::store::QueueRecord;
use crate::task::{CloseTask, CloseTasks, TaskId};
use crate::txn::TransactionLogResource;
use crate::types::{ConsumerId, ConsumerTag, ExchangeName, FieldTable, QueueName, SessionId, TimestampMillis};
use crate::utils::timestamp_millis;
use crate::Result;

pub mod consumer;
pub mod entry;
pub mod list;
pub mod priority;

pub use consumer::{AcquireMode, Consumer, ConsumerTarget, Credit};
pub use entry::{EntryState, QueueEntry};
pub use list::{QueueEntryIterator, QueueEntryList, SimpleQueueEntryList};
pub use priority::{PriorityQueueList, DEFAULT_PRIORITY};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    /// Session owning an exclusive queue.
    pub exclusive: Option<SessionId>,
    pub alternate_exchange: Option<ExchangeName>,
    /// Number of priority levels, 0 or 1 for a plain FIFO queue.
    pub priorities: u8,
    /// Releases before an entry is dead-lettered, 0 disables the limit.
    pub max_delivery_count: u32,
    pub max_messages: Option<u32>,
    pub arguments: FieldTable,
}

impl QueueOptions {
    /// Options with the broker wide queue defaults.
    pub fn from_settings(queue: &crate::conf::Queue) -> Self {
        Self {
            priorities: queue.priorities,
            max_delivery_count: queue.max_delivery_count,
            max_messages: queue.max_messages,
            ..Default::default()
        }
    }

    #[inline]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[inline]
    pub fn alternate_exchange<E: Into<ExchangeName>>(mut self, exchange: E) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }
}

/// What became of an entry handed back by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Available again for delivery.
    Requeued,
    /// Delivered too often, still acquired and waiting to be dead-lettered.
    MaxDeliveriesExceeded,
    /// The entry was not acquired, nothing changed.
    NotAcquired,
}

pub struct AmqQueue {
    name: QueueName,
    opts: QueueOptions,
    list: Box<dyn QueueEntryList>,
    consumers: RwLock<Vec<Arc<Consumer>>>,
    rr: AtomicUsize,
    processing: AtomicBool,
    pending: AtomicBool,
    delete_tasks: CloseTasks,
    deleted: AtomicBool,
}

impl AmqQueue {
    pub fn new(name: QueueName, opts: QueueOptions) -> Self {
        let list: Box<dyn QueueEntryList> = if opts.priorities > 1 {
            Box::new(PriorityQueueList::new(name.clone(), opts.durable, opts.priorities))
        } else {
            Box::new(SimpleQueueEntryList::new(name.clone(), opts.durable))
        };
        Self {
            name,
            opts,
            list,
            consumers: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
            processing: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            delete_tasks: CloseTasks::default(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn from_record(record: &QueueRecord) -> Self {
        Self::new(
            record.name.clone(),
            QueueOptions {
                durable: true,
                auto_delete: record.auto_delete,
                exclusive: None,
                alternate_exchange: record.alternate_exchange.clone(),
                priorities: record.priorities,
                max_delivery_count: record.max_delivery_count,
                max_messages: record.max_messages,
                arguments: record.arguments.clone(),
            },
        )
    }

    #[inline]
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    #[inline]
    pub fn options(&self) -> &QueueOptions {
        &self.opts
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.opts.durable
    }

    #[inline]
    pub fn is_auto_delete(&self) -> bool {
        self.opts.auto_delete
    }

    #[inline]
    pub fn exclusive_owner(&self) -> Option<SessionId> {
        self.opts.exclusive
    }

    #[inline]
    pub fn alternate_exchange(&self) -> Option<&ExchangeName> {
        self.opts.alternate_exchange.as_ref()
    }

    #[inline]
    pub fn list(&self) -> &dyn QueueEntryList {
        self.list.as_ref()
    }

    #[inline]
    pub fn message_count(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    #[inline]
    pub fn delete_tasks(&self) -> &CloseTasks {
        &self.delete_tasks
    }

    #[inline]
    pub fn add_delete_task(&self, task: CloseTask) -> TaskId {
        self.delete_tasks.add(task)
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn to_record(&self) -> QueueRecord {
        QueueRecord {
            name: self.name.clone(),
            auto_delete: self.opts.auto_delete,
            alternate_exchange: self.opts.alternate_exchange.clone(),
            priorities: self.opts.priorities,
            max_delivery_count: self.opts.max_delivery_count,
            max_messages: self.opts.max_messages,
            arguments: self.opts.arguments.clone(),
        }
    }

    /// Fails when `incoming` more messages would not fit.
    #[inline]
    pub fn check_capacity(&self, incoming: usize) -> Result<()> {
        match self.opts.max_messages {
            Some(max) if self.list.len() + incoming > max as usize => Err(BrokerError::precondition_failed(
                format!("queue '{}' is full, max messages: {}", self.name, max),
            )),
            _ => Ok(()),
        }
    }

    /// Appends the message without dispatching it.
    pub fn enqueue(&self, message: ServerMessage) -> Result<Arc<QueueEntry>> {
        if self.is_deleted() {
            return Err(BrokerError::not_found(format!("queue '{}' has been deleted", self.name)));
        }
        Ok(self.list.add(message))
    }

    /// Appends the message and dispatches.
    pub async fn deliver(&self, message: ServerMessage) -> Result<Arc<QueueEntry>> {
        let entry = self.enqueue(message)?;
        self.process().await;
        Ok(entry)
    }

    /// Snapshot of the entries still on the list, in delivery order.
    pub fn entries(&self) -> Vec<Arc<QueueEntry>> {
        self.list.iter().collect()
    }

    pub async fn add_consumer(&self, consumer: Arc<Consumer>) -> Result<()> {
        if self.is_deleted() {
            return Err(BrokerError::not_found(format!("queue '{}' has been deleted", self.name)));
        }
        if let Some(owner) = self.opts.exclusive {
            if owner != consumer.session() {
                return Err(BrokerError::ResourceLocked(format!("queue '{}' is exclusive", self.name)));
            }
        }
        {
            let mut consumers = self.consumers.write();
            if consumers.iter().any(|c| c.session() == consumer.session() && c.tag() == consumer.tag()) {
                return Err(BrokerError::NotAllowed(format!("consumer tag '{}' in use", consumer.tag())));
            }
            consumers.push(consumer);
        }
        self.process().await;
        Ok(())
    }

    /// Stops and detaches the consumer. Entries it holds stay acquired, the session
    /// releases them.
    pub fn remove_consumer(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        let mut consumers = self.consumers.write();
        let pos = consumers.iter().position(|c| c.id() == id)?;
        let consumer = consumers.remove(pos);
        consumer.stop();
        Some(consumer)
    }

    pub fn find_consumer(&self, session: SessionId, tag: &ConsumerTag) -> Option<Arc<Consumer>> {
        self.consumers.read().iter().find(|c| c.session() == session && c.tag() == tag).cloned()
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.read().clone()
    }

    /// Dispatches available entries to consumers. A call made while another one
    /// is running makes the running one go round again.
    pub async fn process(&self) {
        self.pending.store(true, Ordering::SeqCst);
        loop {
            if self.processing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                return;
            }
            {
                let _processing = scopeguard::guard(&self.processing, |p| p.store(false, Ordering::SeqCst));
                while self.pending.swap(false, Ordering::SeqCst) {
                    self.dispatch().await;
                }
            }
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn dispatch(&self) {
        let consumers = self.consumers();
        if consumers.is_empty() || self.is_deleted() {
            return;
        }
        let now = timestamp_millis();

        let (acquirers, browsers): (Vec<_>, Vec<_>) =
            consumers.into_iter().partition(|c| c.acquire_mode() == AcquireMode::PreAcquired);
        for browser in browsers.iter() {
            self.browse(browser, now).await;
        }
        if acquirers.is_empty() {
            return;
        }

        let n = acquirers.len();
        let mut iter = self.list.iter();
        while let Some(entry) = iter.next() {
            if !entry.is_available() || entry.is_expired(now) {
                continue;
            }
            let size = entry.message().size();
            let start = self.rr.load(Ordering::SeqCst);
            let mut handed = false;
            for i in 0..n {
                let idx = (start + i) % n;
                let consumer = &acquirers[idx];
                if !consumer.use_credit(size) {
                    continue;
                }
                if !entry.acquire(consumer.id()) {
                    //taken by someone else meanwhile
                    consumer.refund_credit(size);
                    handed = true;
                    break;
                }
                if consumer.target().deliver(consumer, &entry).await {
                    log::debug!("{} delivered {} to consumer {}", self.name, entry.message().number(), consumer.id());
                    self.rr.store((idx + 1) % n, Ordering::SeqCst);
                } else {
                    consumer.refund_credit(size);
                    entry.unacquire();
                }
                handed = true;
                break;
            }
            if !handed && acquirers.iter().all(|c| !c.has_credit(0)) {
                break;
            }
        }
    }

    async fn browse(&self, consumer: &Arc<Consumer>, now: TimestampMillis) {
        loop {
            let next = match consumer.cursor() {
                Some(pos) => self.list.next(&pos),
                None => self.list.first(),
            };
            let Some(entry) = next else {
                break;
            };
            if !entry.is_available() || entry.is_expired(now) {
                consumer.set_cursor(entry);
                continue;
            }
            let size = entry.message().size();
            if !consumer.use_credit(size) {
                break;
            }
            consumer.set_cursor(entry.clone());
            if !consumer.target().deliver(consumer, &entry).await {
                consumer.refund_credit(size);
                break;
            }
        }
    }

    /// Hands a held entry back to the queue. The delivery count goes up first, an
    /// entry that reached the maximum stays acquired for the caller to dead-letter.
    pub async fn release_entry(&self, entry: &Arc<QueueEntry>) -> ReleaseOutcome {
        if !entry.is_acquired() {
            return ReleaseOutcome::NotAcquired;
        }
        let count = entry.increment_delivery_count();
        let max = self.opts.max_delivery_count;
        if max > 0 && count >= max {
            log::debug!("{} entry {} reached max delivery count {}", self.name, entry.message().number(), max);
            return ReleaseOutcome::MaxDeliveriesExceeded;
        }
        if !entry.release() {
            return ReleaseOutcome::NotAcquired;
        }
        self.process().await;
        ReleaseOutcome::Requeued
    }

    /// Acquires on behalf of a consumer that received the entry unacquired.
    #[inline]
    pub fn acquire_entry(&self, entry: &QueueEntry, consumer: ConsumerId) -> bool {
        entry.acquire(consumer)
    }

    /// Accepted by the consumer, the entry leaves the queue.
    pub fn dequeue_entry(&self, entry: &QueueEntry) -> bool {
        if entry.acknowledge() {
            self.list.entry_deleted(entry);
            true
        } else {
            false
        }
    }

    pub fn dead_letter_entry(&self, entry: &QueueEntry) -> bool {
        if entry.dead_letter() {
            self.list.entry_deleted(entry);
            true
        } else {
            false
        }
    }

    pub fn delete_entry(&self, entry: &QueueEntry) -> bool {
        if entry.delete() {
            self.list.entry_deleted(entry);
            true
        } else {
            false
        }
    }

    /// Drops available entries, at most `limit` of them. Returns the dropped entries.
    pub fn purge(&self, limit: Option<usize>) -> Vec<Arc<QueueEntry>> {
        self.remove_available(limit, |_| true)
    }

    /// Drops available entries whose message expired before `now`.
    pub fn purge_expired(&self, now: TimestampMillis) -> Vec<Arc<QueueEntry>> {
        self.remove_available(None, |e| e.is_expired(now))
    }

    fn remove_available<F>(&self, limit: Option<usize>, filter: F) -> Vec<Arc<QueueEntry>>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let limit = limit.unwrap_or(usize::MAX);
        let mut removed = Vec::new();
        for entry in self.list.iter() {
            if removed.len() >= limit {
                break;
            }
            if entry.is_available() && filter(&entry) && entry.delete() {
                self.list.entry_deleted(&entry);
                removed.push(entry);
            }
        }
        removed
    }

    /// Marks the queue deleted, stops its consumers and removes every remaining entry.
    /// Returns the consumers that were attached, the dropped entries and the close tasks.
    pub fn delete(&self) -> Option<(Vec<Arc<Consumer>>, Vec<Arc<QueueEntry>>, Vec<CloseTask>)> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return None;
        }
        let consumers = std::mem::take(&mut *self.consumers.write());
        for c in consumers.iter() {
            c.stop();
        }
        let mut entries = Vec::new();
        for entry in self.list.iter() {
            if entry.delete() {
                self.list.entry_deleted(&entry);
                entries.push(entry);
            }
        }
        Some((consumers, entries, self.delete_tasks.drain()))
    }
}

impl TransactionLogResource for AmqQueue {
    #[inline]
    fn resource_name(&self) -> &QueueName {
        &self.name
    }

    #[inline]
    fn is_durable(&self) -> bool {
        self.opts.durable
    }
}

impl fmt::Debug for AmqQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqQueue")
            .field("name", &self.name)
            .field("opts", &self.opts)
            .field("messages", &self.message_count())
            .field("consumers", &self.consumer_count())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
