//! A virtual host: the exchanges, queues, bindings and sessions sharing one store.
//!
//! Every protocol-facing operation lands here. Authorization is checked before
//! any state changes; durable configuration is written through to the store;
//! message enqueues and dequeues go through a [`ServerTransaction`] so that the
//! in-memory side only changes once the durable side is committed.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::binding::{BindingKey, BindingTable};
use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::exchange::{Exchange, ExchangeOptions, ExchangeRegistry, RoutableMessage, RouteResult};
use crate::message::{ContentHeader, MessageMetaData, MessagePublishInfo, ServerMessage};
use crate::queue::{AmqQueue, QueueEntry, QueueOptions, ReleaseOutcome};
use crate::session::{DeliveryReceiver, ServerSession, SessionRegistry};
use crate::store::MessageStore;
use crate::task::CloseTask;
use crate::txn::{
    Action, AutoCommitTransaction, EnqueueableMessage, FnAction, ServerTransaction, TransactionLogResource,
};
use crate::types::{
    ConsumerId, DashMap, DropReason, ExchangeName, FieldTable, HashMap, QueueName, SessionId, TimestampMillis,
    DEFAULT_EXCHANGE,
};
use crate::utils::timestamp_millis;
use crate::Result;

//alternate exchanges followed before a message counts as unroutable
const MAX_ALTERNATE_HOPS: usize = 2;

#[derive(Clone)]
pub struct VirtualHost {
    inner: Arc<VirtualHostInner>,
}

pub struct VirtualHostInner {
    pub name: String,
    pub ctx: BrokerContext,
    pub store: Arc<dyn MessageStore>,
    pub exchanges: ExchangeRegistry,
    pub queues: DashMap<QueueName, Arc<AmqQueue>>,
    pub bindings: BindingTable,
    pub(crate) sessions: Arc<SessionRegistry>,
    next_session_id: AtomicU64,
    next_consumer_id: AtomicU64,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl Deref for VirtualHost {
    type Target = VirtualHostInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "VirtualHost {{ name: {}, store: {}, exchanges: {}, queues: {}, bindings: {} }}",
            self.name,
            self.store.name(),
            self.exchanges.len(),
            self.queues.len(),
            self.bindings.len()
        )
    }
}

impl VirtualHost {
    pub fn new(ctx: BrokerContext, store: Arc<dyn MessageStore>) -> Result<Self> {
        let exchanges = ExchangeRegistry::new(&ctx.exchange_factory)?;
        ctx.stats.exchanges.incs(exchanges.len() as isize);
        let bindings = BindingTable::new(ctx.clone(), store.clone());
        Ok(Self {
            inner: Arc::new(VirtualHostInner {
                name: ctx.settings.vhost.name.clone(),
                ctx,
                store,
                exchanges,
                queues: DashMap::default(),
                bindings,
                sessions: Arc::new(SessionRegistry::default()),
                next_session_id: AtomicU64::new(1),
                next_consumer_id: AtomicU64::new(1),
                housekeeping: Mutex::new(None),
            }),
        })
    }

    #[inline]
    pub fn exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name)
    }

    #[inline]
    pub fn queue(&self, name: &str) -> Option<Arc<AmqQueue>> {
        self.queues.get(name).map(|q| q.value().clone())
    }

    #[inline]
    fn exchange_or_not_found(&self, name: &str) -> Result<Arc<Exchange>> {
        self.exchange(name).ok_or_else(|| BrokerError::not_found(format!("no exchange named '{}'", name)))
    }

    #[inline]
    fn queue_or_not_found(&self, name: &str) -> Result<Arc<AmqQueue>> {
        self.queue(name).ok_or_else(|| BrokerError::not_found(format!("no queue named '{}'", name)))
    }

    #[inline]
    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn next_consumer_id(&self) -> ConsumerId {
        self.next_consumer_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Opens a session. Its deliveries arrive on the returned receiver.
    pub async fn create_session(&self) -> (ServerSession, DeliveryReceiver) {
        let (session, rx) = ServerSession::new(self.clone());
        self.ctx.stats.sessions.inc();
        self.ctx.hooks.session_created(session.id()).await;
        log::debug!("{} session {} created", self.name, session.id());
        (session, rx)
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A new message with a store assigned number.
    pub fn create_message(
        &self,
        publish_info: MessagePublishInfo,
        header: ContentHeader,
        content: Bytes,
    ) -> ServerMessage {
        let meta = MessageMetaData::new(publish_info, header, content.len() as u64);
        ServerMessage::new(self.store.next_message_number(), meta, content)
    }

    pub async fn declare_exchange(&self, name: &str, type_name: &str, opts: ExchangeOptions) -> Result<Arc<Exchange>> {
        if let Some(existing) = self.exchange(name) {
            return redeclared(existing, type_name);
        }
        if name.starts_with("amq.") {
            return Err(BrokerError::access_refused(format!("exchange name '{}' is reserved", name)));
        }
        if let Some(alternate) = opts.alternate_exchange.as_ref() {
            self.exchange_or_not_found(alternate)?;
        }
        let exchange =
            self.ctx.exchange_factory.create_exchange(self.ctx.security.as_ref(), name.into(), type_name, opts)?;
        let (exchange, created) = self.exchanges.insert_if_absent(exchange);
        if !created {
            return redeclared(exchange, type_name);
        }
        if exchange.is_durable() {
            if let Err(e) = self.store.create_exchange(&exchange.to_record()).await {
                self.exchanges.remove(name);
                return Err(e.into());
            }
        }
        self.ctx.stats.exchanges.inc();
        self.ctx.hooks.exchange_declared(&exchange).await;
        log::info!(target: "audit", "exchange declared, {} ({})", exchange.name(), exchange.type_name());
        Ok(exchange)
    }

    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        let exchange = self.exchange_or_not_found(name)?;
        if exchange.is_reserved() {
            return Err(BrokerError::NotAllowed(format!("exchange '{}' cannot be deleted", name)));
        }
        if !self.ctx.security.authorise_delete(Some(name), None) {
            return Err(BrokerError::access_refused(format!("permission denied: delete exchange '{}'", name)));
        }
        if if_unused && exchange.binding_count() > 0 {
            return Err(BrokerError::precondition_failed(format!("exchange '{}' has bindings", name)));
        }
        if self.is_alternate(name) {
            return Err(BrokerError::NotAllowed(format!("exchange '{}' in use as an alternate exchange", name)));
        }
        let Some(exchange) = self.exchanges.remove(name) else {
            return Err(BrokerError::not_found(format!("no exchange named '{}'", name)));
        };
        let Some(tasks) = exchange.delete() else {
            return Ok(());
        };
        for task in tasks {
            self.run_close_task(task).await;
        }
        if exchange.is_durable() {
            self.store.remove_exchange(name).await?;
        }
        self.ctx.stats.exchanges.dec();
        self.ctx.hooks.exchange_deleted(&exchange).await;
        log::info!(target: "audit", "exchange deleted, {}", name);
        Ok(())
    }

    //named as alternate by a queue or another exchange
    fn is_alternate(&self, name: &str) -> bool {
        let named = |a: Option<&ExchangeName>| a.map_or(false, |a| **a == *name);
        self.queues.iter().any(|q| named(q.value().alternate_exchange()))
            || self.exchanges.list().iter().any(|e| **e.name() != *name && named(e.alternate_exchange()))
    }

    /// Declares the queue, or returns the existing one with that name. A new queue is
    /// bound to the default exchange under its own name.
    pub async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<Arc<AmqQueue>> {
        if let Some(existing) = self.queue(name) {
            return self.redeclared_queue(existing, &opts);
        }
        if !self.ctx.security.authorise_create_queue(name) {
            return Err(BrokerError::access_refused(format!("permission denied: create queue '{}'", name)));
        }
        if let Some(alternate) = opts.alternate_exchange.as_ref() {
            self.exchange_or_not_found(alternate)?;
        }
        let queue = match self.queues.entry(QueueName::from(name)) {
            Entry::Occupied(e) => {
                let existing = e.get().clone();
                drop(e);
                return self.redeclared_queue(existing, &opts);
            }
            Entry::Vacant(e) => {
                let queue = Arc::new(AmqQueue::new(name.into(), opts));
                e.insert(queue.clone());
                queue
            }
        };
        if queue.is_durable() {
            if let Err(e) = self.store.create_queue(&queue.to_record()).await {
                self.queues.remove(name);
                return Err(e.into());
            }
        }
        self.bind_default(&queue);
        self.ctx.stats.queues.inc();
        self.ctx.hooks.queue_declared(&queue).await;
        log::info!(target: "audit", "queue declared, {}", name);
        Ok(queue)
    }

    fn redeclared_queue(&self, existing: Arc<AmqQueue>, opts: &QueueOptions) -> Result<Arc<AmqQueue>> {
        match (existing.exclusive_owner(), opts.exclusive) {
            (Some(owner), Some(session)) if owner == session => Ok(existing),
            (Some(_), _) => Err(BrokerError::ResourceLocked(format!("queue '{}' is exclusive", existing.name()))),
            (None, _) => Ok(existing),
        }
    }

    fn bind_default(&self, queue: &AmqQueue) {
        if let Some(default) = self.exchanges.default_exchange() {
            let key = BindingKey::new(DEFAULT_EXCHANGE, queue.name().clone(), queue.name().clone(), FieldTable::new());
            self.bindings.restore_binding(key, queue, &default);
        }
    }

    /// Deletes the queue and returns how many messages it held.
    pub async fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> Result<usize> {
        let queue = self.queue_or_not_found(name)?;
        if !self.ctx.security.authorise_delete(None, Some(name)) {
            return Err(BrokerError::access_refused(format!("permission denied: delete queue '{}'", name)));
        }
        if if_unused && queue.consumer_count() > 0 {
            return Err(BrokerError::precondition_failed(format!("queue '{}' has consumers", name)));
        }
        if if_empty && queue.message_count() > 0 {
            return Err(BrokerError::precondition_failed(format!("queue '{}' is not empty", name)));
        }
        Ok(self.destroy_queue(&queue).await)
    }

    pub(crate) async fn destroy_queue(&self, queue: &Arc<AmqQueue>) -> usize {
        if let Entry::Occupied(e) = self.queues.entry(queue.name().clone()) {
            if Arc::ptr_eq(e.get(), queue) {
                e.remove();
            }
        }
        let Some((consumers, entries, tasks)) = queue.delete() else {
            return 0;
        };
        for consumer in consumers {
            if let Some(session) = self.sessions.get(&consumer.session()).map(|s| s.value().clone()) {
                session.detach_consumer(consumer.tag());
            }
            self.ctx.stats.consumers.dec();
        }
        for task in tasks {
            self.run_close_task(task).await;
        }
        if queue.is_durable() {
            if let Err(e) = self.store.remove_queue(queue.name()).await {
                log::warn!("{} failed to remove queue {} from store, {:?}", self.name, queue.name(), e);
            }
        }
        for entry in entries.iter() {
            self.dropped(entry.message(), DropReason::QueueDeleted).await;
        }
        self.ctx.stats.messages.decs(entries.len() as isize);
        self.ctx.stats.queues.dec();
        self.ctx.hooks.queue_deleted(queue).await;
        log::info!(target: "audit", "queue deleted, {}, {} messages dropped", queue.name(), entries.len());
        entries.len()
    }

    /// Binds a queue to an exchange. `false` when the binding already exists.
    pub async fn bind(&self, exchange: &str, queue: &str, key: &str, args: FieldTable) -> Result<bool> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::NotAllowed("cannot bind to the default exchange".into()));
        }
        let ex = self.exchange_or_not_found(exchange)?;
        let q = self.queue_or_not_found(queue)?;
        self.bindings.add_binding(BindingKey::new(exchange, queue, key, args), &q, &ex).await
    }

    pub async fn unbind(&self, exchange: &str, queue: &str, key: &str, args: FieldTable) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::NotAllowed("cannot unbind from the default exchange".into()));
        }
        let ex = self.exchange_or_not_found(exchange)?;
        let q = self.queue_or_not_found(queue)?;
        let key = BindingKey::new(exchange, queue, key, args);
        match self.bindings.remove_binding(&key, &q, &ex).await? {
            Some(_) => Ok(()),
            None => Err(BrokerError::not_found(format!("no such binding, {}", key))),
        }
    }

    /// The queues `message` would reach through `exchange`.
    pub fn route(&self, exchange: &str, message: &ServerMessage) -> Result<RouteResult> {
        let exchange = self.exchange_or_not_found(exchange)?;
        Ok(self.route_via(&exchange, message, 0))
    }

    fn route_via(&self, exchange: &Exchange, message: &ServerMessage, hops: usize) -> RouteResult {
        let names = exchange.route(&RoutableMessage::from(message));
        if names.is_empty() {
            if hops < MAX_ALTERNATE_HOPS {
                if let Some(alternate) = exchange.alternate_exchange().and_then(|a| self.exchange(a)) {
                    log::debug!("{} no route on {}, trying {}", self.name, exchange.name(), alternate.name());
                    return self.route_via(&alternate, message, hops + 1);
                }
            }
            return RouteResult::NoRoute;
        }
        if message.is_expired(timestamp_millis()) {
            return RouteResult::Filtered;
        }
        let queues: Vec<_> = names.iter().filter_map(|n| self.queue(n)).filter(|q| !q.is_deleted()).collect();
        if queues.is_empty() {
            RouteResult::Filtered
        } else {
            RouteResult::Routed(queues)
        }
    }

    /// Routes and enqueues a published message through `txn`. Unroutable messages are
    /// dropped and reported as such, the caller decides about returning mandatory ones.
    pub async fn publish(
        &self,
        session: Option<SessionId>,
        message: ServerMessage,
        txn: &mut dyn ServerTransaction,
    ) -> Result<RouteResult> {
        self.ctx.stats.messages_published.inc();
        let message = self.ctx.hooks.message_publish(session, &message).await.unwrap_or(message);
        let info = &message.meta().publish_info;
        let exchange = self.exchange_or_not_found(&info.exchange)?;
        if !self.ctx.security.authorise_publish(&info.exchange, &info.routing_key) {
            return Err(BrokerError::access_refused(format!(
                "permission denied: publish to '{}' with routing key '{}'",
                info.exchange, info.routing_key
            )));
        }
        let result = self.route_via(&exchange, &message, 0);
        match &result {
            RouteResult::Routed(queues) => self.enqueue(queues, message, txn).await?,
            RouteResult::NoRoute => self.dropped(&message, DropReason::NoRoute).await,
            RouteResult::Filtered => self.dropped(&message, DropReason::Filtered).await,
        }
        Ok(result)
    }

    /// Enqueues `message` on every queue in one transactional operation. Nothing is
    /// enqueued if any queue is full.
    pub async fn enqueue(
        &self,
        queues: &[Arc<AmqQueue>],
        message: ServerMessage,
        txn: &mut dyn ServerTransaction,
    ) -> Result<()> {
        for queue in queues.iter() {
            queue.check_capacity(1)?;
        }
        let stored = self.store_message(&message, queues).await?;
        let action = EnqueueAction { vhost: self.clone(), queues: queues.to_vec(), message: message.clone(), stored };
        let resources: Vec<&dyn TransactionLogResource> =
            queues.iter().map(|q| q.as_ref() as &dyn TransactionLogResource).collect();
        txn.enqueue_all(&resources, &message, Box::new(action)).await
    }

    //content goes to the store once, before any durable queue records it
    async fn store_message(&self, message: &ServerMessage, queues: &[Arc<AmqQueue>]) -> Result<bool> {
        if !message.is_persistent() || !queues.iter().any(|q| q.is_durable()) {
            return Ok(false);
        }
        self.store.add_message(message.number(), message.meta(), message.content().clone()).await?;
        Ok(true)
    }

    async fn dropped(&self, message: &ServerMessage, reason: DropReason) {
        self.ctx.stats.messages_dropped.inc();
        self.ctx.hooks.message_dropped(message, reason).await;
        log::debug!("{} dropped message {}, {}", self.name, message.number(), reason);
    }

    /// Hands a held entry back. One that reached the delivery limit is dead-lettered.
    pub(crate) async fn release_entry(
        &self,
        session: SessionId,
        queue: &Arc<AmqQueue>,
        entry: &Arc<QueueEntry>,
    ) -> Result<()> {
        match queue.release_entry(entry).await {
            ReleaseOutcome::Requeued => {
                self.ctx.stats.messages_released.inc();
                self.ctx.hooks.message_released(session, entry).await;
                Ok(())
            }
            ReleaseOutcome::MaxDeliveriesExceeded => self.dead_letter(queue, entry).await,
            ReleaseOutcome::NotAcquired => Ok(()),
        }
    }

    pub(crate) async fn reject_entry(
        &self,
        session: SessionId,
        queue: &Arc<AmqQueue>,
        entry: &Arc<QueueEntry>,
        requeue: bool,
    ) -> Result<()> {
        if !entry.is_acquired() {
            return Ok(());
        }
        self.ctx.stats.messages_rejected.inc();
        self.ctx.hooks.message_rejected(session, entry).await;
        if !requeue {
            return self.dead_letter(queue, entry).await;
        }
        match queue.release_entry(entry).await {
            ReleaseOutcome::MaxDeliveriesExceeded => self.dead_letter(queue, entry).await,
            ReleaseOutcome::Requeued | ReleaseOutcome::NotAcquired => Ok(()),
        }
    }

    /// Moves an acquired entry to its queue's alternate exchange, or discards it when
    /// there is none or nothing is bound there. Runs in its own auto-commit transaction.
    ///
    /// When the move fails the entry is released back to its queue and the error returned.
    pub async fn dead_letter(&self, queue: &Arc<AmqQueue>, entry: &Arc<QueueEntry>) -> Result<()> {
        if !entry.is_acquired() {
            return Ok(());
        }
        let alternate = queue.alternate_exchange().cloned();
        let targets = match alternate.as_ref().and_then(|a| self.exchange(a)) {
            Some(exchange) => self.route_via(&exchange, entry.message(), 0).queues().to_vec(),
            None => Vec::new(),
        };

        if let Err(e) = self.move_entry(queue, entry, &targets).await {
            log::warn!(
                "{} dead-letter of message {} from {} failed, returning it to the queue, {:?}",
                self.name,
                entry.message().number(),
                queue.name(),
                e
            );
            if entry.release() {
                self.ctx.stats.messages_released.inc();
                queue.process().await;
            }
            return Err(e);
        }

        self.ctx.stats.messages_dead_lettered.inc();
        self.ctx.hooks.message_dead_lettered(entry, alternate.as_ref()).await;
        if targets.is_empty() {
            self.dropped(entry.message(), DropReason::NoAlternateExchange).await;
        }
        log::info!(
            target: "audit",
            "message {} dead-lettered from {}, alternate: {:?}, delivery count: {}",
            entry.message().number(),
            queue.name(),
            alternate,
            entry.delivery_count()
        );
        Ok(())
    }

    //enqueue on the targets, then dequeue from the source
    async fn move_entry(
        &self,
        queue: &Arc<AmqQueue>,
        entry: &Arc<QueueEntry>,
        targets: &[Arc<AmqQueue>],
    ) -> Result<()> {
        let mut txn = AutoCommitTransaction::new(self.store.clone());
        if !targets.is_empty() {
            self.enqueue(targets, entry.message().clone(), &mut txn).await?;
        }
        let ctx = self.ctx.clone();
        let (q, e) = (queue.clone(), entry.clone());
        let action = FnAction::on_commit(move || {
            if q.dead_letter_entry(&e) {
                ctx.stats.messages.dec();
            }
        });
        txn.dequeue(entry.as_ref(), entry.message(), Box::new(action)).await
    }

    /// Drops up to `limit` available messages from the queue, returns how many.
    pub async fn purge_queue(&self, name: &str, limit: Option<usize>) -> Result<usize> {
        let queue = self.queue_or_not_found(name)?;
        let entries = queue.purge(limit);
        self.remove_entries(&entries, DropReason::Purged).await?;
        Ok(entries.len())
    }

    /// Removes expired messages from every queue, returns how many.
    pub async fn purge_expired(&self, now: TimestampMillis) -> Result<usize> {
        let queues: Vec<_> = self.queues.iter().map(|q| q.value().clone()).collect();
        let mut removed = 0;
        for queue in queues {
            let entries = queue.purge_expired(now);
            if entries.is_empty() {
                continue;
            }
            log::debug!("{} {} expired messages removed from {}", self.name, entries.len(), queue.name());
            self.ctx.stats.messages_expired.incs(entries.len() as isize);
            self.remove_entries(&entries, DropReason::Expired).await?;
            removed += entries.len();
        }
        Ok(removed)
    }

    //durable records of entries already removed from their queue
    async fn remove_entries(&self, entries: &[Arc<QueueEntry>], reason: DropReason) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ctx.stats.messages.decs(entries.len() as isize);
        let pairs: Vec<(&dyn TransactionLogResource, &dyn EnqueueableMessage)> = entries
            .iter()
            .map(|e| (e.as_ref() as &dyn TransactionLogResource, e.message() as &dyn EnqueueableMessage))
            .collect();
        let mut txn = AutoCommitTransaction::new(self.store.clone());
        txn.dequeue_entries(&pairs, Box::new(FnAction::on_commit(|| {}))).await?;
        for entry in entries {
            self.dropped(entry.message(), reason).await;
        }
        Ok(())
    }

    /// Runs [`purge_expired`](Self::purge_expired) on the configured interval until
    /// [`close`](Self::close).
    pub fn start_housekeeping(&self) {
        let interval = self.ctx.settings.vhost.housekeeping_interval;
        let vhost = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = vhost.purge_expired(timestamp_millis()).await {
                    log::warn!("{} housekeeping failed, {:?}", vhost.name, e);
                }
            }
        });
        if let Some(old) = self.housekeeping.lock().replace(handle) {
            old.abort();
        }
    }

    /// Rebuilds durable exchanges, queues, bindings and messages from the store.
    pub async fn recover(&self) -> Result<()> {
        let snapshot = self.store.recover().await?;

        for record in snapshot.exchanges.iter() {
            if self.exchange(&record.name).is_some() {
                continue;
            }
            let exchange = self.ctx.exchange_factory.restore_exchange(record)?;
            if self.exchanges.insert_if_absent(exchange).1 {
                self.ctx.stats.exchanges.inc();
            }
        }

        for record in snapshot.queues.iter() {
            let queue = match self.queues.entry(record.name.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(e) => {
                    let queue = Arc::new(AmqQueue::from_record(record));
                    e.insert(queue.clone());
                    queue
                }
            };
            self.bind_default(&queue);
            self.ctx.stats.queues.inc();
        }

        for record in snapshot.bindings.iter() {
            let key = BindingKey::from_record(record);
            match (self.exchange(&key.exchange), self.queue(&key.queue)) {
                (Some(exchange), Some(queue)) => {
                    self.bindings.restore_binding(key, &queue, &exchange);
                }
                _ => log::warn!("{} binding {} refers to a missing exchange or queue", self.name, record),
            }
        }

        let messages: HashMap<_, _> = snapshot
            .messages
            .into_iter()
            .map(|m| (m.number, ServerMessage::new(m.number, m.meta, m.content)))
            .collect();
        let mut recovered = 0;
        for record in snapshot.entries.iter() {
            let (Some(queue), Some(message)) = (self.queue(&record.queue), messages.get(&record.message)) else {
                log::warn!("{} dangling entry {} on {}", self.name, record.message, record.queue);
                continue;
            };
            queue.enqueue(message.clone())?;
            self.ctx.stats.messages.inc();
            recovered += 1;
        }
        if !snapshot.xids.is_empty() {
            log::warn!("{} {} prepared distributed transactions left in store", self.name, snapshot.xids.len());
        }
        log::info!(
            "{} recovered {} exchanges, {} queues, {} bindings, {} messages",
            self.name,
            snapshot.exchanges.len(),
            snapshot.queues.len(),
            snapshot.bindings.len(),
            recovered
        );
        Ok(())
    }

    pub(crate) async fn run_close_task(&self, task: CloseTask) {
        log::debug!("{} run close task {:?}", self.name, task);
        match task {
            CloseTask::RemoveBinding(key) => {
                let exchange = self.exchange(&key.exchange);
                let queue = self.queue(&key.queue);
                if let Err(e) = self.bindings.unbind(&key, queue.as_deref(), exchange.as_deref()).await {
                    log::warn!("{} failed to remove binding {}, {:?}", self.name, key, e);
                }
            }
            CloseTask::CancelConsumer { session, tag } => {
                if let Some(session) = self.sessions.get(&session).map(|s| s.value().clone()) {
                    if let Some(consumer) = session.detach_consumer(&tag) {
                        if let Some(queue) = self.queue(consumer.queue()) {
                            queue.remove_consumer(consumer.id());
                        }
                        self.ctx.stats.consumers.dec();
                    }
                }
            }
            CloseTask::DeleteQueue(name) => {
                if let Some(queue) = self.queue(&name) {
                    Box::pin(self.destroy_queue(&queue)).await;
                }
            }
        }
    }

    /// Stops housekeeping and closes the store.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.housekeeping.lock().take() {
            handle.abort();
        }
        self.store.close().await?;
        log::info!("{} closed", self.name);
        Ok(())
    }
}

#[inline]
fn redeclared(existing: Arc<Exchange>, type_name: &str) -> Result<Arc<Exchange>> {
    if existing.type_name() == type_name {
        Ok(existing)
    } else {
        Err(BrokerError::precondition_failed(format!(
            "exchange '{}' exists with type {}, not {}",
            existing.name(),
            existing.type_name(),
            type_name
        )))
    }
}

/// Puts a committed message on its queues and dispatches.
struct EnqueueAction {
    vhost: VirtualHost,
    queues: Vec<Arc<AmqQueue>>,
    message: ServerMessage,
    stored: bool,
}

#[async_trait]
impl Action for EnqueueAction {
    async fn post_commit(&mut self) {
        let ctx = &self.vhost.ctx;
        for queue in self.queues.iter() {
            match queue.enqueue(self.message.clone()) {
                Ok(entry) => {
                    ctx.stats.messages.inc();
                    ctx.stats.messages_enqueued.inc();
                    ctx.hooks.message_enqueued(&entry).await;
                }
                Err(e) => log::debug!("{} enqueue on {} skipped, {}", self.vhost.name, queue.name(), e),
            }
        }
        for queue in self.queues.iter() {
            queue.process().await;
        }
    }

    async fn on_rollback(&mut self) {
        if self.stored {
            if let Err(e) = self.vhost.store.remove_message(self.message.number()).await {
                log::warn!("{} failed to remove message {}, {:?}", self.vhost.name, self.message.number(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::exchange::FANOUT;
    use crate::store::MemoryMessageStore;

    fn vhost() -> VirtualHost {
        VirtualHost::new(BrokerContext::default(), Arc::new(MemoryMessageStore::default())).unwrap()
    }

    #[tokio::test]
    async fn alternate_exchange_cannot_be_deleted() {
        let vhost = vhost();
        vhost.declare_exchange("dlx", FANOUT, ExchangeOptions::default()).await.unwrap();
        vhost.declare_queue("q", QueueOptions::default().alternate_exchange("dlx")).await.unwrap();

        let err = vhost.delete_exchange("dlx", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAllowed);
        assert!(vhost.exchange("dlx").is_some());

        vhost.delete_queue("q", false, false).await.unwrap();
        vhost.delete_exchange("dlx", false).await.unwrap();
        assert!(vhost.exchange("dlx").is_none());
    }

    #[tokio::test]
    async fn exchange_alternate_cannot_be_deleted() {
        let vhost = vhost();
        vhost.declare_exchange("unrouted", FANOUT, ExchangeOptions::default()).await.unwrap();
        let opts = ExchangeOptions { alternate_exchange: Some("unrouted".into()), ..Default::default() };
        vhost.declare_exchange("orders", FANOUT, opts).await.unwrap();

        let err = vhost.delete_exchange("unrouted", false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAllowed);

        //free again once the exchange naming it is gone
        vhost.delete_exchange("orders", false).await.unwrap();
        vhost.delete_exchange("unrouted", false).await.unwrap();
    }
}
