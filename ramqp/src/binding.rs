//! The binding table of one virtual host.
//!
//! A binding is identified by (exchange, queue, binding key, arguments); the
//! arguments are an ordered map so equal tables always compare equal. The table
//! holds at most one binding per identity: concurrent adds of the same identity
//! race on a single `DashMap` entry and exactly one of them wins.
//!
//! Durable bindings (both ends durable, never on the default exchange) are
//! written through to the store. Every binding registers a close task on its
//! queue and on its exchange so that deleting either end removes it.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::context::BrokerContext;
use crate::error::BrokerError;
use crate::exchange::Exchange;
use crate::queue::AmqQueue;
use crate::store::{BindingRecord, MessageStore};
use crate::task::CloseTask;
use crate::types::{DashMap, ExchangeName, FieldTable, QueueName, RoutingKey, TimestampMillis};
use crate::utils::timestamp_millis;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    pub exchange: ExchangeName,
    pub queue: QueueName,
    pub key: RoutingKey,
    pub args: FieldTable,
}

impl BindingKey {
    #[inline]
    pub fn new<E, Q, K>(exchange: E, queue: Q, key: K, args: FieldTable) -> Self
    where
        E: Into<ExchangeName>,
        Q: Into<QueueName>,
        K: Into<RoutingKey>,
    {
        Self { exchange: exchange.into(), queue: queue.into(), key: key.into(), args }
    }

    #[inline]
    pub fn to_record(&self) -> BindingRecord {
        BindingRecord {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            binding_key: self.key.clone(),
            arguments: self.args.clone(),
        }
    }

    #[inline]
    pub fn from_record(record: &BindingRecord) -> Self {
        Self {
            exchange: record.exchange.clone(),
            queue: record.queue.clone(),
            key: record.binding_key.clone(),
            args: record.arguments.clone(),
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.exchange, self.key, self.queue)?;
        if !self.args.is_empty() {
            write!(f, " {{")?;
            for (i, (k, v)) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", k, v)?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

pub struct Binding {
    key: BindingKey,
    durable: bool,
    created_at: TimestampMillis,
}

impl Binding {
    #[inline]
    fn new(key: BindingKey, durable: bool) -> Self {
        Self { key, durable, created_at: timestamp_millis() }
    }

    #[inline]
    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    #[inline]
    pub fn exchange(&self) -> &ExchangeName {
        &self.key.exchange
    }

    #[inline]
    pub fn queue(&self) -> &QueueName {
        &self.key.queue
    }

    #[inline]
    pub fn binding_key(&self) -> &RoutingKey {
        &self.key.key
    }

    #[inline]
    pub fn arguments(&self) -> &FieldTable {
        &self.key.args
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn created_at(&self) -> TimestampMillis {
        self.created_at
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if self.durable {
            write!(f, " (durable)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.key)
            .field("durable", &self.durable)
            .field("created_at", &self.created_at)
            .finish()
    }
}

pub struct BindingTable {
    bindings: DashMap<BindingKey, Arc<Binding>>,
    ctx: BrokerContext,
    store: Arc<dyn MessageStore>,
}

impl BindingTable {
    pub fn new(ctx: BrokerContext, store: Arc<dyn MessageStore>) -> Self {
        Self { bindings: DashMap::default(), ctx, store }
    }

    /// Installs the binding. `false` when the same binding already exists.
    #[inline]
    pub async fn add_binding(&self, key: BindingKey, queue: &AmqQueue, exchange: &Exchange) -> Result<bool> {
        self.make_binding(key, queue, exchange, false).await
    }

    /// Installs the binding, swapping out an existing one with the same identity.
    #[inline]
    pub async fn replace_binding(&self, key: BindingKey, queue: &AmqQueue, exchange: &Exchange) -> Result<bool> {
        self.make_binding(key, queue, exchange, true).await
    }

    async fn make_binding(&self, key: BindingKey, queue: &AmqQueue, exchange: &Exchange, force: bool) -> Result<bool> {
        debug_assert_eq!(&key.queue, queue.name());
        debug_assert_eq!(&key.exchange, exchange.name());
        if !force && self.bindings.contains_key(&key) {
            return Ok(false);
        }
        if !exchange.is_default() && !self.ctx.security.authorise_bind(&key.exchange, &key.queue, &key.key) {
            return Err(BrokerError::access_refused(format!("permission denied: bind {}", key)));
        }
        check_live(queue, exchange)?;

        let durable = queue.is_durable() && exchange.is_durable() && !exchange.is_default();
        let binding = Arc::new(Binding::new(key.clone(), durable));
        let replaced = if force {
            self.bindings.insert(key.clone(), binding.clone())
        } else {
            match self.bindings.entry(key.clone()) {
                Entry::Occupied(_) => return Ok(false),
                Entry::Vacant(e) => {
                    e.insert(binding.clone());
                    None
                }
            }
        };

        if durable {
            if let Err(e) = self.store.bind_queue(&key.to_record()).await {
                log::warn!("failed to persist binding {}, {:?}", key, e);
                match replaced {
                    Some(old) => {
                        self.bindings.insert(key, old);
                    }
                    None => {
                        self.bindings.remove(&key);
                    }
                }
                return Err(e.into());
            }
        }

        if replaced.is_none() {
            self.attach(&key, queue, exchange);
        }
        self.ctx.hooks.binding_created(&binding).await;
        log::info!(target: "audit", "binding created, {}", binding);
        Ok(true)
    }

    /// Reinstates a binding without authorization or a store write: recovery and the
    /// implicit default exchange binding of a new queue.
    pub fn restore_binding(&self, key: BindingKey, queue: &AmqQueue, exchange: &Exchange) -> bool {
        let durable = queue.is_durable() && exchange.is_durable() && !exchange.is_default();
        match self.bindings.entry(key.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(e) => {
                e.insert(Arc::new(Binding::new(key.clone(), durable)));
            }
        }
        self.attach(&key, queue, exchange);
        true
    }

    fn attach(&self, key: &BindingKey, queue: &AmqQueue, exchange: &Exchange) {
        queue.add_delete_task(CloseTask::RemoveBinding(key.clone()));
        exchange.add_close_task(CloseTask::RemoveBinding(key.clone()));
        exchange.add_binding(key);
        self.ctx.stats.bindings.inc();
    }

    /// Removes the binding after an unbind check. `None` when there is no such binding.
    pub async fn remove_binding(
        &self,
        key: &BindingKey,
        queue: &AmqQueue,
        exchange: &Exchange,
    ) -> Result<Option<Arc<Binding>>> {
        if !exchange.is_default() && !self.ctx.security.authorise_unbind(&key.exchange, &key.queue, &key.key) {
            return Err(BrokerError::access_refused(format!("permission denied: unbind {}", key)));
        }
        self.unbind(key, Some(queue), Some(exchange)).await
    }

    /// Removes the binding on behalf of a closing queue or exchange. Either end may be
    /// gone already.
    pub(crate) async fn unbind(
        &self,
        key: &BindingKey,
        queue: Option<&AmqQueue>,
        exchange: Option<&Exchange>,
    ) -> Result<Option<Arc<Binding>>> {
        let Some(binding) = self.get_binding(key) else {
            return Ok(None);
        };
        //store first, memory stays intact when the delete fails
        if binding.is_durable() {
            if let Err(e) = self.store.unbind_queue(&key.to_record()).await {
                log::warn!("failed to delete binding {}, {:?}", key, e);
                return Err(e.into());
            }
        }
        let Some((_, binding)) = self.bindings.remove(key) else {
            return Ok(None);
        };
        let task = CloseTask::RemoveBinding(key.clone());
        if let Some(queue) = queue {
            queue.delete_tasks().remove_task(&task);
        }
        if let Some(exchange) = exchange {
            exchange.close_tasks().remove_task(&task);
            exchange.remove_binding(key);
        }
        self.ctx.stats.bindings.dec();
        self.ctx.hooks.binding_deleted(&binding).await;
        log::info!(target: "audit", "binding deleted, {}", binding);
        Ok(Some(binding))
    }

    #[inline]
    pub fn get_binding(&self, key: &BindingKey) -> Option<Arc<Binding>> {
        self.bindings.get(key).map(|b| b.value().clone())
    }

    pub fn bindings_for_queue(&self, queue: &str) -> Vec<Arc<Binding>> {
        self.collect(|k| k.queue == queue)
    }

    pub fn bindings_for_exchange(&self, exchange: &str) -> Vec<Arc<Binding>> {
        self.collect(|k| k.exchange == exchange)
    }

    fn collect<F: Fn(&BindingKey) -> bool>(&self, filter: F) -> Vec<Arc<Binding>> {
        let mut bindings: Vec<_> =
            self.bindings.iter().filter(|e| filter(e.key())).map(|e| e.value().clone()).collect();
        bindings.sort_by(|a, b| a.key.cmp(&b.key));
        bindings
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[inline]
fn check_live(queue: &AmqQueue, exchange: &Exchange) -> Result<()> {
    if queue.is_deleted() {
        return Err(BrokerError::not_found(format!("queue '{}' has been deleted", queue.name())));
    }
    if exchange.is_deleted() {
        return Err(BrokerError::not_found(format!("exchange '{}' has been deleted", exchange.name())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclSecurityManager;
    use crate::conf::{Acl, Permission, Settings};
    use crate::error::ErrorCode;
    use crate::exchange::{DirectExchangeType, ExchangeOptions, RoutableMessage};
    use crate::queue::QueueOptions;
    use crate::store::MemoryMessageStore;
    use crate::types::field_table;

    fn table(ctx: BrokerContext) -> (BindingTable, Arc<MemoryMessageStore>) {
        let store = Arc::new(MemoryMessageStore::default());
        (BindingTable::new(ctx, store.clone()), store)
    }

    fn exchange(name: &str, durable: bool) -> Exchange {
        Exchange::new(name.into(), &DirectExchangeType, ExchangeOptions { durable, ..Default::default() })
    }

    fn queue(name: &str, durable: bool) -> AmqQueue {
        AmqQueue::new(name.into(), QueueOptions::default().durable(durable))
    }

    fn routed(exchange: &Exchange, key: &str) -> Vec<String> {
        let headers = FieldTable::new();
        let msg = RoutableMessage { routing_key: key, headers: &headers };
        exchange.route(&msg).into_iter().map(|q| q.to_string()).collect()
    }

    #[tokio::test]
    async fn identity_is_unique() {
        let (bindings, store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", true), exchange("ex", true));
        let key = BindingKey::new("ex", "q", "k", FieldTable::new());

        assert!(bindings.add_binding(key.clone(), &q, &ex).await.unwrap());
        assert!(!bindings.add_binding(key.clone(), &q, &ex).await.unwrap());
        assert!(bindings.replace_binding(key.clone(), &q, &ex).await.unwrap());
        assert_eq!(bindings.len(), 1);
        assert_eq!(ex.binding_count(), 1);
        assert_eq!(q.delete_tasks().len(), 1);
        assert_eq!(store.binding_count(), 1);
        assert_eq!(routed(&ex, "k"), vec!["q".to_string()]);

        //same key, other arguments: a separate binding
        let other = BindingKey::new("ex", "q", "k", field_table([("x", 1i64)]));
        assert!(bindings.add_binding(other, &q, &ex).await.unwrap());
        assert_eq!(bindings.bindings_for_queue("q").len(), 2);
    }

    #[tokio::test]
    async fn remove_detaches_everything() {
        let (bindings, store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", true), exchange("ex", true));
        let key = BindingKey::new("ex", "q", "k", FieldTable::new());
        bindings.add_binding(key.clone(), &q, &ex).await.unwrap();

        let removed = bindings.remove_binding(&key, &q, &ex).await.unwrap().unwrap();
        assert!(removed.is_durable());
        assert!(bindings.get_binding(&key).is_none());
        assert!(q.delete_tasks().is_empty());
        assert!(ex.close_tasks().is_empty());
        assert!(routed(&ex, "k").is_empty());
        assert_eq!(store.binding_count(), 0);

        assert!(bindings.remove_binding(&key, &q, &ex).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_end_is_not_persisted() {
        let (bindings, store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", false), exchange("ex", true));
        bindings.add_binding(BindingKey::new("ex", "q", "k", FieldTable::new()), &q, &ex).await.unwrap();
        assert_eq!(store.binding_count(), 0);
        assert!(!bindings.bindings_for_exchange("ex")[0].is_durable());
    }

    #[tokio::test]
    async fn denied_bind_changes_nothing() {
        let acl = Acl { default_permission: Permission::Deny, rules: Vec::new() };
        let security = Arc::new(AclSecurityManager::new(acl));
        let ctx = BrokerContext::builder(Settings::default()).security(security).build().unwrap();
        let (bindings, _store) = table(ctx);
        let q = queue("q", true);

        let ex = exchange("ex", true);
        let err = bindings.add_binding(BindingKey::new("ex", "q", "k", FieldTable::new()), &q, &ex).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AccessRefused);
        assert!(bindings.is_empty());
        assert!(q.delete_tasks().is_empty());

        //the default exchange is exempt
        let default = exchange("", true);
        assert!(bindings.add_binding(BindingKey::new("", "q", "q", FieldTable::new()), &q, &default).await.unwrap());
    }

    #[tokio::test]
    async fn deleted_queue_is_not_found() {
        let (bindings, _store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", false), exchange("ex", false));
        q.delete();
        let err = bindings.add_binding(BindingKey::new("ex", "q", "k", FieldTable::new()), &q, &ex).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn store_failure_undoes_insert() {
        let (bindings, store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", true), exchange("ex", true));
        store.close().await.unwrap();
        let key = BindingKey::new("ex", "q", "k", FieldTable::new());
        assert!(bindings.add_binding(key.clone(), &q, &ex).await.unwrap_err().is_store());
        assert!(bindings.get_binding(&key).is_none());
        assert_eq!(ex.binding_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_keeps_binding_on_remove() {
        let (bindings, store) = table(BrokerContext::default());
        let (q, ex) = (queue("q", true), exchange("ex", true));
        let key = BindingKey::new("ex", "q", "k", FieldTable::new());
        bindings.add_binding(key.clone(), &q, &ex).await.unwrap();

        store.close().await.unwrap();
        assert!(bindings.remove_binding(&key, &q, &ex).await.unwrap_err().is_store());
        assert!(bindings.get_binding(&key).is_some());
        assert_eq!(ex.binding_count(), 1);
        assert_eq!(q.delete_tasks().len(), 1);
        assert_eq!(ex.close_tasks().len(), 1);
        assert_eq!(routed(&ex, "k"), vec!["q".to_string()]);
        assert_eq!(store.binding_count(), 1);

        //the retry once the store is back removes both copies
        store.reopen();
        assert!(bindings.remove_binding(&key, &q, &ex).await.unwrap().is_some());
        assert!(bindings.get_binding(&key).is_none());
        assert_eq!(store.binding_count(), 0);
    }
}
