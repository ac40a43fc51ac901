//! Server side of a session.
//!
//! A [`ServerSession`] is owned by the connection task that drives it. It holds
//! the session's transaction (auto-commit until `select_tx`), its consumers and
//! the map of deliveries still waiting for a disposition. Queues reach the
//! session only by id: consumers carry a [`SessionTarget`] that looks the
//! session up in the virtual host's registry, so a closed session simply stops
//! taking deliveries.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::conf;
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::exchange::RouteResult;
use crate::message::ServerMessage;
use crate::queue::{AcquireMode, AmqQueue, Consumer, ConsumerTarget, Credit, QueueEntry, QueueOptions};
use crate::task::{CloseTask, CloseTasks};
use crate::txn::{
    Action, AutoCommitTransaction, EnqueueableMessage, LocalTransaction, ServerTransaction, TransactionLogResource,
};
use crate::types::{ConsumerId, ConsumerTag, DashMap, DeliveryId, HashMap, QueueName, SessionId, DEFAULT_EXCHANGE};
use crate::vhost::VirtualHost;
use crate::Result;

pub mod disposition;
pub mod range;

pub use disposition::DispositionMap;
pub use range::{Range, RangeSet};

pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

pub(crate) type SessionRegistry = DashMap<SessionId, Arc<SessionState>>;

/// A message transfer handed to the wire layer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    pub consumer_tag: ConsumerTag,
    pub queue: QueueName,
    pub message: ServerMessage,
    pub redelivered: bool,
    /// `false` for browsing consumers, the client may still acquire it.
    pub acquired: bool,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub acquire_mode: AcquireMode,
    pub flow_mode: conf::FlowMode,
    pub credit: Credit,
}

impl SubscribeOptions {
    /// Pre-acquiring subscription with the broker wide consumer defaults.
    pub fn from_settings(consumer: &conf::Consumer) -> Self {
        Self {
            acquire_mode: AcquireMode::PreAcquired,
            flow_mode: consumer.flow_mode,
            credit: Credit { messages: consumer.credit, bytes: consumer.credit_bytes.map(|b| b.as_u64()) },
        }
    }

    #[inline]
    pub fn browse(mut self) -> Self {
        self.acquire_mode = AcquireMode::NotAcquired;
        self
    }

    #[inline]
    pub fn credit(mut self, credit: Credit) -> Self {
        self.credit = credit;
        self
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::from_settings(&conf::Consumer::default())
    }
}

/// A delivery waiting for accept, release or reject.
#[derive(Clone)]
pub(crate) struct Unacked {
    entry: Arc<QueueEntry>,
    consumer: ConsumerId,
    consumer_tag: ConsumerTag,
}

/// The part of a session reachable from its consumers.
pub(crate) struct SessionState {
    id: SessionId,
    tx: DeliverySender,
    next_delivery_id: AtomicU32,
    unacked: Mutex<DispositionMap<Unacked>>,
    consumers: Mutex<HashMap<ConsumerTag, Arc<Consumer>>>,
    closed: AtomicBool,
}

impl SessionState {
    fn new(id: SessionId, tx: DeliverySender) -> Self {
        Self {
            id,
            tx,
            next_delivery_id: AtomicU32::new(0),
            unacked: Mutex::new(DispositionMap::new()),
            consumers: Mutex::new(HashMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, consumer: &Consumer, entry: &Arc<QueueEntry>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut unacked = self.unacked.lock();
        let delivery_id = self.next_delivery_id.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            delivery_id,
            consumer_tag: consumer.tag().clone(),
            queue: entry.queue_name().clone(),
            message: entry.message().clone(),
            redelivered: entry.is_redelivered(),
            acquired: consumer.acquire_mode() == AcquireMode::PreAcquired,
            delivery_count: entry.delivery_count(),
        };
        if let Err(e) = self.tx.unbounded_send(delivery) {
            log::debug!("session {} delivery channel closed, {}", self.id, e);
            return false;
        }
        unacked.register(
            delivery_id,
            Unacked { entry: entry.clone(), consumer: consumer.id(), consumer_tag: consumer.tag().clone() },
        );
        true
    }

    #[inline]
    pub(crate) fn detach_consumer(&self, tag: &ConsumerTag) -> Option<Arc<Consumer>> {
        self.consumers.lock().remove(tag)
    }

    #[inline]
    fn consumer(&self, tag: &ConsumerTag) -> Option<Arc<Consumer>> {
        self.consumers.lock().get(tag).cloned()
    }
}

/// Delivers to a session found by id, refusing once it is gone.
struct SessionTarget {
    session: SessionId,
    sessions: Arc<SessionRegistry>,
    ctx: BrokerContext,
}

#[async_trait]
impl ConsumerTarget for SessionTarget {
    async fn deliver(&self, consumer: &Consumer, entry: &Arc<QueueEntry>) -> bool {
        let Some(state) = self.sessions.get(&self.session).map(|s| s.value().clone()) else {
            return false;
        };
        if !state.send(consumer, entry) {
            return false;
        }
        self.ctx.stats.messages_delivered.inc();
        self.ctx.hooks.message_delivered(self.session, entry).await;
        true
    }
}

pub struct ServerSession {
    id: SessionId,
    vhost: VirtualHost,
    state: Arc<SessionState>,
    txn: Box<dyn ServerTransaction>,
    close_tasks: CloseTasks,
    closed: bool,
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("transactional", &self.txn.is_transactional())
            .field("consumers", &self.state.consumers.lock().len())
            .field("unacked", &self.unacked_count())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ServerSession {
    pub(crate) fn new(vhost: VirtualHost) -> (Self, DeliveryReceiver) {
        let id = vhost.next_session_id();
        let (tx, rx) = mpsc::unbounded();
        let state = Arc::new(SessionState::new(id, tx));
        vhost.sessions.insert(id, state.clone());
        let txn = Box::new(AutoCommitTransaction::new(vhost.store.clone()));
        (Self { id, vhost, state, txn, close_tasks: CloseTasks::default(), closed: false }, rx)
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn is_transactional(&self) -> bool {
        self.txn.is_transactional()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn unacked_count(&self) -> usize {
        self.state.unacked.lock().len()
    }

    #[inline]
    pub fn consumer(&self, tag: &str) -> Option<Arc<Consumer>> {
        self.state.consumer(&ConsumerTag::from(tag))
    }

    #[inline]
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(BrokerError::SessionClosed(self.id))
        } else {
            Ok(())
        }
    }

    #[inline]
    fn consumer_or_not_found(&self, tag: &str) -> Result<Arc<Consumer>> {
        self.consumer(tag).ok_or_else(|| BrokerError::not_found(format!("no consumer with tag '{}'", tag)))
    }

    /// Declares a queue. An exclusive queue belongs to this session and is deleted when
    /// the session closes.
    pub async fn declare_queue(
        &mut self,
        name: &str,
        mut opts: QueueOptions,
        exclusive: bool,
    ) -> Result<Arc<AmqQueue>> {
        self.check_open()?;
        if exclusive {
            opts.exclusive = Some(self.id);
        }
        let queue = self.vhost.declare_queue(name, opts).await?;
        if exclusive && queue.exclusive_owner() == Some(self.id) {
            //redeclaring must not register the delete twice
            let task = CloseTask::DeleteQueue(queue.name().clone());
            self.close_tasks.remove_task(&task);
            self.close_tasks.add(task);
        }
        Ok(queue)
    }

    /// Routes the message through the exchange named in its publish info.
    pub async fn publish(&mut self, message: ServerMessage) -> Result<RouteResult> {
        self.check_open()?;
        self.vhost.publish(Some(self.id), message, self.txn.as_mut()).await
    }

    /// Puts the message straight onto a queue, as the default exchange would.
    pub async fn enqueue(&mut self, queue: &str, message: ServerMessage) -> Result<()> {
        self.check_open()?;
        if !self.vhost.ctx.security.authorise_publish(DEFAULT_EXCHANGE, queue) {
            return Err(BrokerError::access_refused(format!("permission denied: publish to queue '{}'", queue)));
        }
        let queue =
            self.vhost.queue(queue).ok_or_else(|| BrokerError::not_found(format!("no queue named '{}'", queue)))?;
        self.vhost.enqueue(&[queue], message, self.txn.as_mut()).await
    }

    pub async fn subscribe(&mut self, queue: &str, tag: &str, opts: SubscribeOptions) -> Result<Arc<Consumer>> {
        self.check_open()?;
        if !self.vhost.ctx.security.authorise_consume(queue) {
            return Err(BrokerError::access_refused(format!("permission denied: consume from '{}'", queue)));
        }
        let q = self.vhost.queue(queue).ok_or_else(|| BrokerError::not_found(format!("no queue named '{}'", queue)))?;
        let tag = ConsumerTag::from(tag);
        let target = Arc::new(SessionTarget {
            session: self.id,
            sessions: self.vhost.sessions.clone(),
            ctx: self.vhost.ctx.clone(),
        });
        let consumer = Arc::new(Consumer::new(
            self.vhost.next_consumer_id(),
            tag.clone(),
            self.id,
            q.name().clone(),
            opts.acquire_mode,
            opts.flow_mode,
            opts.credit,
            target,
        ));
        {
            let mut consumers = self.state.consumers.lock();
            if consumers.contains_key(&tag) {
                return Err(BrokerError::NotAllowed(format!("consumer tag '{}' in use", tag)));
            }
            consumers.insert(tag.clone(), consumer.clone());
        }
        if let Err(e) = q.add_consumer(consumer.clone()).await {
            self.state.detach_consumer(&tag);
            return Err(e);
        }
        self.close_tasks.add(CloseTask::CancelConsumer { session: self.id, tag });
        self.vhost.ctx.stats.consumers.inc();
        log::debug!("session {} subscribed {:?}", self.id, consumer);
        Ok(consumer)
    }

    /// Stops the consumer and releases every delivery it still holds.
    pub async fn cancel(&mut self, tag: &str) -> Result<()> {
        self.check_open()?;
        let tag = ConsumerTag::from(tag);
        let consumer = self
            .state
            .detach_consumer(&tag)
            .ok_or_else(|| BrokerError::not_found(format!("no consumer with tag '{}'", tag)))?;
        self.close_tasks.remove_task(&CloseTask::CancelConsumer { session: self.id, tag });
        self.detach(consumer).await;
        Ok(())
    }

    async fn detach(&self, consumer: Arc<Consumer>) {
        consumer.stop();
        let queue = self.vhost.queue(consumer.queue());
        if let Some(queue) = queue.as_ref() {
            queue.remove_consumer(consumer.id());
        }
        self.vhost.ctx.stats.consumers.dec();

        let held = self.state.unacked.lock().remove_where(|u| u.consumer == consumer.id());
        for (_, unacked) in held {
            self.release_held(unacked).await;
        }

        if let Some(queue) = queue {
            if queue.is_auto_delete() && queue.consumer_count() == 0 {
                log::debug!("session {} last consumer of auto-delete queue {} gone", self.id, queue.name());
                self.vhost.destroy_queue(&queue).await;
            }
        }
    }

    /// Adds credit and lets the queue dispatch against it.
    pub async fn grant_credit(&mut self, tag: &str, messages: u32, bytes: u64) -> Result<()> {
        self.check_open()?;
        let consumer = self.consumer_or_not_found(tag)?;
        consumer.add_credit(messages, bytes);
        self.process(&consumer).await;
        Ok(())
    }

    pub async fn set_credit(&mut self, tag: &str, credit: Credit) -> Result<()> {
        self.check_open()?;
        let consumer = self.consumer_or_not_found(tag)?;
        consumer.set_credit(credit);
        self.process(&consumer).await;
        Ok(())
    }

    /// Delivers whatever the current credit allows, then drops the rest of the credit.
    pub async fn flush(&mut self, tag: &str) -> Result<()> {
        self.check_open()?;
        let consumer = self.consumer_or_not_found(tag)?;
        self.process(&consumer).await;
        consumer.flush_credit();
        Ok(())
    }

    #[inline]
    async fn process(&self, consumer: &Consumer) {
        if let Some(queue) = self.vhost.queue(consumer.queue()) {
            queue.process().await;
        }
    }

    fn settle(&self, ranges: &RangeSet) -> Vec<Unacked> {
        let mut settled = Vec::new();
        self.state.unacked.lock().disposition_change(ranges, |_, u| settled.push(u));
        settled
    }

    //window mode consumers get their credit back once a transfer is settled
    async fn restore_credit(&self, settled: &[Unacked]) {
        let mut touched: Vec<Arc<Consumer>> = Vec::new();
        for u in settled {
            if let Some(consumer) = self.state.consumer(&u.consumer_tag) {
                if consumer.flow_mode() == conf::FlowMode::Window {
                    consumer.restore_credit(u.entry.message().size());
                    if !touched.iter().any(|c| c.id() == consumer.id()) {
                        touched.push(consumer);
                    }
                }
            }
        }
        for consumer in touched {
            self.process(&consumer).await;
        }
    }

    /// Accepts the deliveries in `ranges`; their entries are dequeued through the
    /// session's transaction.
    pub async fn accept(&mut self, ranges: &RangeSet) -> Result<()> {
        self.check_open()?;
        let settled = self.settle(ranges);
        let mut items = Vec::with_capacity(settled.len());
        for u in settled.iter() {
            if u.entry.acquired_by() != Some(u.consumer) {
                continue;
            }
            if let Some(queue) = self.vhost.queue(u.entry.queue_name()) {
                items.push((queue, u.entry.clone()));
            }
        }
        if !items.is_empty() {
            let action = AcceptAction { vhost: self.vhost.clone(), session: self.id, items: items.clone() };
            let entries: Vec<(&dyn TransactionLogResource, &dyn EnqueueableMessage)> = items
                .iter()
                .map(|(_, e)| (e.as_ref() as &dyn TransactionLogResource, e.message() as &dyn EnqueueableMessage))
                .collect();
            self.txn.dequeue_entries(&entries, Box::new(action)).await?;
        }
        self.restore_credit(&settled).await;
        Ok(())
    }

    /// Gives the deliveries in `ranges` back to their queues.
    pub async fn release(&mut self, ranges: &RangeSet) -> Result<()> {
        self.check_open()?;
        let settled = self.settle(ranges);
        for u in settled.iter() {
            self.release_held(u.clone()).await;
        }
        self.restore_credit(&settled).await;
        Ok(())
    }

    /// Rejects the deliveries in `ranges`, requeueing them or dead-lettering them.
    pub async fn reject(&mut self, ranges: &RangeSet, requeue: bool) -> Result<()> {
        self.check_open()?;
        let settled = self.settle(ranges);
        let mut result = Ok(());
        for u in settled.iter() {
            if let Some(queue) = self.vhost.queue(u.entry.queue_name()) {
                if let Err(e) = self.vhost.reject_entry(self.id, &queue, &u.entry, requeue).await {
                    log::warn!("session {} reject of {} failed, {:?}", self.id, u.entry.message().number(), e);
                    result = Err(e);
                }
            }
        }
        self.restore_credit(&settled).await;
        result
    }

    /// Acquires unacquired deliveries in `ranges` for their consumers. Returns the ids
    /// that were acquired.
    pub fn acquire(&mut self, ranges: &RangeSet) -> Result<RangeSet> {
        self.check_open()?;
        Ok(self.state.unacked.lock().acquire(ranges, |_, u| u.entry.acquire(u.consumer)))
    }

    async fn release_held(&self, held: Unacked) {
        let Some(queue) = self.vhost.queue(held.entry.queue_name()) else {
            return;
        };
        if let Err(e) = self.vhost.release_entry(self.id, &queue, &held.entry).await {
            log::warn!("session {} release of {} failed, {:?}", self.id, held.entry.message().number(), e);
        }
    }

    /// Switches the session to local transactions. Selecting twice is a no-op.
    pub fn select_tx(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.txn.is_transactional() {
            self.txn = Box::new(LocalTransaction::new(self.vhost.store.clone()));
            self.vhost.ctx.stats.transactions.inc();
        }
        Ok(())
    }

    #[inline]
    fn check_transactional(&self) -> Result<()> {
        if self.txn.is_transactional() {
            Ok(())
        } else {
            Err(BrokerError::precondition_failed(format!("session {} is not transactional", self.id)))
        }
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.check_transactional()?;
        self.txn.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.check_transactional()?;
        self.txn.rollback().await
    }

    /// Rolls back an open transaction, releases every outstanding delivery, then runs
    /// the close tasks (consumer cancels, exclusive queue deletes).
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state.closed.store(true, Ordering::SeqCst);

        if self.txn.is_transactional() {
            if let Err(e) = self.txn.rollback().await {
                log::warn!("session {} rollback on close failed, {:?}", self.id, e);
            }
            self.vhost.ctx.stats.transactions.dec();
        }

        let held = self.state.unacked.lock().drain();
        log::debug!("session {} close, releasing {} deliveries", self.id, held.len());
        for (_, unacked) in held {
            self.release_held(unacked).await;
        }

        for task in self.close_tasks.drain() {
            match task {
                CloseTask::CancelConsumer { tag, .. } => {
                    if let Some(consumer) = self.state.detach_consumer(&tag) {
                        self.detach(consumer).await;
                    }
                }
                task => self.vhost.run_close_task(task).await,
            }
        }

        self.vhost.sessions.remove(&self.id);
        self.vhost.ctx.stats.sessions.dec();
        self.vhost.ctx.hooks.session_closed(self.id).await;
        Ok(())
    }
}

/// Dequeues accepted entries once the transaction commits, or hands them back on rollback.
struct AcceptAction {
    vhost: VirtualHost,
    session: SessionId,
    items: Vec<(Arc<AmqQueue>, Arc<QueueEntry>)>,
}

#[async_trait]
impl Action for AcceptAction {
    async fn post_commit(&mut self) {
        let ctx = &self.vhost.ctx;
        for (queue, entry) in self.items.iter() {
            if queue.dequeue_entry(entry) {
                ctx.stats.messages.dec();
                ctx.stats.messages_acked.inc();
                ctx.hooks.message_acked(self.session, entry).await;
            }
        }
    }

    async fn on_rollback(&mut self) {
        for (queue, entry) in self.items.iter() {
            if entry.release() {
                queue.process().await;
            }
        }
    }
}
