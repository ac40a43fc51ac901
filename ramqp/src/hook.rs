use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::binding::Binding;
use crate::exchange::Exchange;
use crate::message::ServerMessage;
use crate::queue::{AmqQueue, QueueEntry};
use crate::types::{DashMap, DashSet, DropReason, ExchangeName, SessionId};
use crate::Result;

pub type Priority = u32;
pub type Proceed = bool;
pub type ReturnType = (Proceed, Option<HookResult>);

#[async_trait]
pub trait HookManager: Sync + Send {
    fn register(&self) -> Box<dyn Register>;

    ///Binding installed on an exchange
    async fn binding_created(&self, binding: &Binding);

    ///Binding removed
    async fn binding_deleted(&self, binding: &Binding);

    async fn exchange_declared(&self, exchange: &Exchange);

    async fn exchange_deleted(&self, exchange: &Exchange);

    async fn queue_declared(&self, queue: &AmqQueue);

    async fn queue_deleted(&self, queue: &AmqQueue);

    async fn session_created(&self, session: SessionId);

    async fn session_closed(&self, session: SessionId);

    ///Message received from a publisher, a handler may replace it
    async fn message_publish(&self, session: Option<SessionId>, message: &ServerMessage) -> Option<ServerMessage>;

    async fn message_enqueued(&self, entry: &QueueEntry);

    async fn message_delivered(&self, session: SessionId, entry: &QueueEntry);

    async fn message_acked(&self, session: SessionId, entry: &QueueEntry);

    async fn message_released(&self, session: SessionId, entry: &QueueEntry);

    async fn message_rejected(&self, session: SessionId, entry: &QueueEntry);

    async fn message_dead_lettered(&self, entry: &QueueEntry, alternate: Option<&ExchangeName>);

    async fn message_dropped(&self, message: &ServerMessage, reason: DropReason);
}

#[async_trait]
pub trait Register: Sync + Send {
    async fn add(&self, typ: Type, handler: Box<dyn Handler>) {
        self.add_priority(typ, 0, handler).await;
    }

    async fn add_priority(&self, typ: Type, priority: Priority, handler: Box<dyn Handler>);

    async fn start(&self) {}

    async fn stop(&self) {}
}

#[async_trait]
pub trait Handler: Sync + Send {
    async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Type {
    BindingCreated,
    BindingDeleted,

    ExchangeDeclared,
    ExchangeDeleted,
    QueueDeclared,
    QueueDeleted,

    SessionCreated,
    SessionClosed,

    MessagePublish,
    MessageEnqueued,
    MessageDelivered,
    MessageAcked,
    MessageReleased,
    MessageRejected,
    MessageDeadLettered,
    MessageDropped,
}

impl std::convert::From<&str> for Type {
    fn from(t: &str) -> Type {
        match t {
            "binding_created" => Type::BindingCreated,
            "binding_deleted" => Type::BindingDeleted,

            "exchange_declared" => Type::ExchangeDeclared,
            "exchange_deleted" => Type::ExchangeDeleted,
            "queue_declared" => Type::QueueDeclared,
            "queue_deleted" => Type::QueueDeleted,

            "session_created" => Type::SessionCreated,
            "session_closed" => Type::SessionClosed,

            "message_publish" => Type::MessagePublish,
            "message_enqueued" => Type::MessageEnqueued,
            "message_delivered" => Type::MessageDelivered,
            "message_acked" => Type::MessageAcked,
            "message_released" => Type::MessageReleased,
            "message_rejected" => Type::MessageRejected,
            "message_dead_lettered" => Type::MessageDeadLettered,
            "message_dropped" => Type::MessageDropped,

            _ => unreachable!("{:?} is not defined", t),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Parameter<'a> {
    BindingCreated(&'a Binding),
    BindingDeleted(&'a Binding),

    ExchangeDeclared(&'a Exchange),
    ExchangeDeleted(&'a Exchange),
    QueueDeclared(&'a AmqQueue),
    QueueDeleted(&'a AmqQueue),

    SessionCreated(SessionId),
    SessionClosed(SessionId),

    MessagePublish(Option<SessionId>, &'a ServerMessage),
    MessageEnqueued(&'a QueueEntry),
    MessageDelivered(SessionId, &'a QueueEntry),
    MessageAcked(SessionId, &'a QueueEntry),
    MessageReleased(SessionId, &'a QueueEntry),
    MessageRejected(SessionId, &'a QueueEntry),
    MessageDeadLettered(&'a QueueEntry, Option<&'a ExchangeName>),
    MessageDropped(&'a ServerMessage, DropReason),
}

impl Parameter<'_> {
    pub fn get_type(&self) -> Type {
        match self {
            Parameter::BindingCreated(_) => Type::BindingCreated,
            Parameter::BindingDeleted(_) => Type::BindingDeleted,

            Parameter::ExchangeDeclared(_) => Type::ExchangeDeclared,
            Parameter::ExchangeDeleted(_) => Type::ExchangeDeleted,
            Parameter::QueueDeclared(_) => Type::QueueDeclared,
            Parameter::QueueDeleted(_) => Type::QueueDeleted,

            Parameter::SessionCreated(_) => Type::SessionCreated,
            Parameter::SessionClosed(_) => Type::SessionClosed,

            Parameter::MessagePublish(_, _) => Type::MessagePublish,
            Parameter::MessageEnqueued(_) => Type::MessageEnqueued,
            Parameter::MessageDelivered(_, _) => Type::MessageDelivered,
            Parameter::MessageAcked(_, _) => Type::MessageAcked,
            Parameter::MessageReleased(_, _) => Type::MessageReleased,
            Parameter::MessageRejected(_, _) => Type::MessageRejected,
            Parameter::MessageDeadLettered(_, _) => Type::MessageDeadLettered,
            Parameter::MessageDropped(_, _) => Type::MessageDropped,
        }
    }
}

#[derive(Debug)]
pub enum HookResult {
    ///Replacement message, for MessagePublish
    Message(ServerMessage),
}

struct HookEntry {
    handler: Box<dyn Handler>,
    enabled: bool,
}

impl HookEntry {
    fn new(handler: Box<dyn Handler>) -> Self {
        Self { handler, enabled: false }
    }
}

type HandlerId = String;

#[allow(clippy::type_complexity)]
type TypeHandlers = Arc<tokio::sync::RwLock<BTreeMap<(Priority, HandlerId), HookEntry>>>;

#[derive(Clone)]
pub struct DefaultHookManager {
    handlers: Arc<DashMap<Type, TypeHandlers>>,
}

impl Default for DefaultHookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultHookManager {
    #[inline]
    pub fn new() -> DefaultHookManager {
        Self { handlers: Arc::new(DashMap::default()) }
    }

    #[inline]
    async fn add(&self, typ: Type, priority: Priority, handler: Box<dyn Handler>) -> Result<HandlerId> {
        let id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string();
        let type_handlers = self
            .handlers
            .entry(typ)
            .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(BTreeMap::default())))
            .value()
            .clone();
        let mut type_handlers = type_handlers.write().await;
        let key = (priority, id.clone());
        if type_handlers.contains_key(&key) {
            Err(anyhow!(format!("handler id is repetition, key is {:?}, type is {:?}", key, typ)).into())
        } else {
            type_handlers.insert(key, HookEntry::new(handler));
            Ok(id)
        }
    }

    #[inline]
    async fn exec<'a>(&'a self, t: Type, p: Parameter<'a>) -> Option<HookResult> {
        let mut acc = None;
        let type_handlers = { self.handlers.get(&t).map(|h| (*h.value()).clone()) };
        if let Some(type_handlers) = type_handlers {
            let type_handlers = type_handlers.read().await;
            for (_, entry) in type_handlers.iter().rev() {
                if entry.enabled {
                    let (proceed, new_acc) = entry.handler.hook(&p, acc).await;
                    if !proceed {
                        return new_acc;
                    }
                    acc = new_acc;
                }
            }
        }
        acc
    }
}

#[async_trait]
impl HookManager for DefaultHookManager {
    #[inline]
    fn register(&self) -> Box<dyn Register> {
        Box::new(DefaultHookRegister::new(self.clone()))
    }

    #[inline]
    async fn binding_created(&self, binding: &Binding) {
        self.exec(Type::BindingCreated, Parameter::BindingCreated(binding)).await;
    }

    #[inline]
    async fn binding_deleted(&self, binding: &Binding) {
        self.exec(Type::BindingDeleted, Parameter::BindingDeleted(binding)).await;
    }

    #[inline]
    async fn exchange_declared(&self, exchange: &Exchange) {
        self.exec(Type::ExchangeDeclared, Parameter::ExchangeDeclared(exchange)).await;
    }

    #[inline]
    async fn exchange_deleted(&self, exchange: &Exchange) {
        self.exec(Type::ExchangeDeleted, Parameter::ExchangeDeleted(exchange)).await;
    }

    #[inline]
    async fn queue_declared(&self, queue: &AmqQueue) {
        self.exec(Type::QueueDeclared, Parameter::QueueDeclared(queue)).await;
    }

    #[inline]
    async fn queue_deleted(&self, queue: &AmqQueue) {
        self.exec(Type::QueueDeleted, Parameter::QueueDeleted(queue)).await;
    }

    #[inline]
    async fn session_created(&self, session: SessionId) {
        self.exec(Type::SessionCreated, Parameter::SessionCreated(session)).await;
    }

    #[inline]
    async fn session_closed(&self, session: SessionId) {
        self.exec(Type::SessionClosed, Parameter::SessionClosed(session)).await;
    }

    #[inline]
    async fn message_publish(&self, session: Option<SessionId>, message: &ServerMessage) -> Option<ServerMessage> {
        let result = self.exec(Type::MessagePublish, Parameter::MessagePublish(session, message)).await;
        log::debug!("{:?} message_publish result: {:?}", session, result);
        if let Some(HookResult::Message(m)) = result {
            Some(m)
        } else {
            None
        }
    }

    #[inline]
    async fn message_enqueued(&self, entry: &QueueEntry) {
        self.exec(Type::MessageEnqueued, Parameter::MessageEnqueued(entry)).await;
    }

    #[inline]
    async fn message_delivered(&self, session: SessionId, entry: &QueueEntry) {
        self.exec(Type::MessageDelivered, Parameter::MessageDelivered(session, entry)).await;
    }

    #[inline]
    async fn message_acked(&self, session: SessionId, entry: &QueueEntry) {
        self.exec(Type::MessageAcked, Parameter::MessageAcked(session, entry)).await;
    }

    #[inline]
    async fn message_released(&self, session: SessionId, entry: &QueueEntry) {
        self.exec(Type::MessageReleased, Parameter::MessageReleased(session, entry)).await;
    }

    #[inline]
    async fn message_rejected(&self, session: SessionId, entry: &QueueEntry) {
        self.exec(Type::MessageRejected, Parameter::MessageRejected(session, entry)).await;
    }

    #[inline]
    async fn message_dead_lettered(&self, entry: &QueueEntry, alternate: Option<&ExchangeName>) {
        self.exec(Type::MessageDeadLettered, Parameter::MessageDeadLettered(entry, alternate)).await;
    }

    #[inline]
    async fn message_dropped(&self, message: &ServerMessage, reason: DropReason) {
        self.exec(Type::MessageDropped, Parameter::MessageDropped(message, reason)).await;
    }
}

pub struct DefaultHookRegister {
    manager: DefaultHookManager,
    type_ids: Arc<DashSet<(Type, (Priority, HandlerId))>>,
}

impl DefaultHookRegister {
    #[inline]
    fn new(manager: DefaultHookManager) -> Self {
        DefaultHookRegister { manager, type_ids: Arc::new(DashSet::default()) }
    }

    #[inline]
    async fn adjust_status(&self, b: bool) {
        let keys: Vec<_> = self.type_ids.iter().map(|k| k.key().clone()).collect();
        for (typ, key) in keys {
            let type_handlers = self.manager.handlers.get(&typ).map(|h| h.value().clone());
            if let Some(type_handlers) = type_handlers {
                if let Some(entry) = type_handlers.write().await.get_mut(&key) {
                    if entry.enabled != b {
                        entry.enabled = b;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Register for DefaultHookRegister {
    #[inline]
    async fn add_priority(&self, typ: Type, priority: Priority, handler: Box<dyn Handler>) {
        match self.manager.add(typ, priority, handler).await {
            Ok(id) => {
                self.type_ids.insert((typ, (priority, id)));
            }
            Err(e) => {
                log::error!("Hook add handler fail, {:?}", e);
            }
        }
    }

    #[inline]
    async fn start(&self) {
        self.adjust_status(true).await;
    }

    #[inline]
    async fn stop(&self) {
        self.adjust_status(false).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::message::{ContentHeader, MessageMetaData, MessagePublishInfo};

    struct Count(Arc<AtomicUsize>, Proceed);

    #[async_trait]
    impl Handler for Count {
        async fn hook(&self, param: &Parameter, acc: Option<HookResult>) -> ReturnType {
            if let Parameter::SessionCreated(_) = param {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            (self.1, acc)
        }
    }

    struct Rewrite;

    #[async_trait]
    impl Handler for Rewrite {
        async fn hook(&self, param: &Parameter, _acc: Option<HookResult>) -> ReturnType {
            match param {
                Parameter::MessagePublish(_, m) => {
                    let mut meta = m.meta().clone();
                    meta.publish_info.routing_key = "rewritten".into();
                    (true, Some(HookResult::Message(ServerMessage::new(m.number(), meta, m.content().clone()))))
                }
                _ => (true, None),
            }
        }
    }

    #[tokio::test]
    async fn priority_and_proceed() {
        let manager = DefaultHookManager::new();
        let register = manager.register();
        let low = Arc::new(AtomicUsize::new(0));
        let high = Arc::new(AtomicUsize::new(0));
        register.add_priority(Type::SessionCreated, 1, Box::new(Count(low.clone(), true))).await;
        register.add_priority(Type::SessionCreated, 10, Box::new(Count(high.clone(), false))).await;

        //not started yet
        manager.session_created(1).await;
        assert_eq!(high.load(Ordering::SeqCst), 0);

        register.start().await;
        manager.session_created(1).await;
        //the higher priority handler stops propagation
        assert_eq!(high.load(Ordering::SeqCst), 1);
        assert_eq!(low.load(Ordering::SeqCst), 0);

        register.stop().await;
        manager.session_created(1).await;
        assert_eq!(high.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_rewrite() {
        let manager = DefaultHookManager::new();
        let register = manager.register();
        register.add(Type::MessagePublish, Box::new(Rewrite)).await;
        register.start().await;

        let meta = MessageMetaData::new(MessagePublishInfo::new("", "k"), ContentHeader::new(), 0);
        let m = ServerMessage::new(1, meta, Bytes::new());
        let out = manager.message_publish(Some(1), &m).await;
        assert_eq!(out.map(|m| m.routing_key().to_owned()), Some("rewritten".to_owned()));
        assert_eq!(Type::from("message_dead_lettered"), Type::MessageDeadLettered);
    }
}
