//! Exchanges and the routers behind them.
//!
//! Every exchange type is an [`ExchangeType`] that knows its name and builds an
//! [`ExchangeRouter`] per exchange. Routers hold the bindings of one exchange and
//! answer `route(message) -> queue names`; the binding table keeps them in step.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::acl::SecurityManager;
use crate::binding::BindingKey;
use crate::error::BrokerError;
use crate::message::ServerMessage;
use crate::queue::AmqQueue;
use crate::store::ExchangeRecord;
use crate::task::{CloseTask, CloseTasks, TaskId};
use crate::types::{DashMap, ExchangeName, FieldTable, HashMap, QueueName, DEFAULT_EXCHANGE};
use crate::Result;

pub mod direct;
pub mod fanout;
pub mod headers;
pub mod topic;

pub use direct::DirectExchangeType;
pub use fanout::FanoutExchangeType;
pub use headers::{HeadersExchangeType, HeadersMatcher, MatchMode};
pub use topic::{TopicExchangeType, TopicPattern};

pub const DIRECT: &str = "direct";
pub const TOPIC: &str = "topic";
pub const FANOUT: &str = "fanout";
pub const HEADERS: &str = "headers";

pub const AMQ_DIRECT: &str = "amq.direct";
pub const AMQ_TOPIC: &str = "amq.topic";
pub const AMQ_FANOUT: &str = "amq.fanout";
pub const AMQ_MATCH: &str = "amq.match";

/// Type names every factory must provide.
pub const BASE_TYPES: [&str; 4] = [DIRECT, TOPIC, FANOUT, HEADERS];

/// The parts of a message routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RoutableMessage<'a> {
    pub routing_key: &'a str,
    pub headers: &'a FieldTable,
}

impl<'a> From<&'a ServerMessage> for RoutableMessage<'a> {
    #[inline]
    fn from(m: &'a ServerMessage) -> Self {
        RoutableMessage { routing_key: m.routing_key(), headers: m.headers() }
    }
}

pub trait ExchangeRouter: Send + Sync {
    fn add_binding(&self, key: &BindingKey);

    fn remove_binding(&self, key: &BindingKey);

    fn route(&self, message: &RoutableMessage<'_>) -> BTreeSet<QueueName>;

    fn binding_count(&self) -> usize;
}

pub trait ExchangeType: Send + Sync {
    fn name(&self) -> &'static str;

    fn new_router(&self) -> Box<dyn ExchangeRouter>;
}

//one queue may be bound several times with different keys or arguments
#[inline]
pub(crate) fn add_ref(queues: &mut BTreeMap<QueueName, usize>, queue: &QueueName) {
    *queues.entry(queue.clone()).or_insert(0) += 1;
}

#[inline]
pub(crate) fn remove_ref(queues: &mut BTreeMap<QueueName, usize>, queue: &QueueName) {
    if let Some(n) = queues.get_mut(queue) {
        *n -= 1;
        if *n == 0 {
            queues.remove(queue);
        }
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone)]
pub enum RouteResult {
    Routed(Vec<Arc<AmqQueue>>),
    /// No binding matched.
    NoRoute,
    /// Bindings matched but none of their queues can take the message.
    Filtered,
}

impl RouteResult {
    #[inline]
    pub fn queues(&self) -> &[Arc<AmqQueue>] {
        match self {
            RouteResult::Routed(queues) => queues,
            _ => &[],
        }
    }

    #[inline]
    pub fn is_routed(&self) -> bool {
        matches!(self, RouteResult::Routed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub alternate_exchange: Option<ExchangeName>,
    pub arguments: FieldTable,
}

pub struct Exchange {
    name: ExchangeName,
    type_name: &'static str,
    opts: ExchangeOptions,
    router: Box<dyn ExchangeRouter>,
    close_tasks: CloseTasks,
    deleted: AtomicBool,
}

impl Exchange {
    pub fn new(name: ExchangeName, exchange_type: &dyn ExchangeType, opts: ExchangeOptions) -> Self {
        Self {
            name,
            type_name: exchange_type.name(),
            opts,
            router: exchange_type.new_router(),
            close_tasks: CloseTasks::default(),
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &ExchangeName {
        &self.name
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub fn options(&self) -> &ExchangeOptions {
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
    pub fn alternate_exchange(&self) -> Option<&ExchangeName> {
        self.opts.alternate_exchange.as_ref()
    }

    /// The no-name exchange every queue is implicitly bound to.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.is_default() || self.name.starts_with("amq.")
    }

    #[inline]
    pub fn add_binding(&self, key: &BindingKey) {
        self.router.add_binding(key)
    }

    #[inline]
    pub fn remove_binding(&self, key: &BindingKey) {
        self.router.remove_binding(key)
    }

    #[inline]
    pub fn route(&self, message: &RoutableMessage<'_>) -> BTreeSet<QueueName> {
        self.router.route(message)
    }

    #[inline]
    pub fn binding_count(&self) -> usize {
        self.router.binding_count()
    }

    #[inline]
    pub fn close_tasks(&self) -> &CloseTasks {
        &self.close_tasks
    }

    #[inline]
    pub fn add_close_task(&self, task: CloseTask) -> TaskId {
        self.close_tasks.add(task)
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Marks the exchange deleted and hands back its close tasks, `None` if it already was.
    pub fn delete(&self) -> Option<Vec<CloseTask>> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.close_tasks.drain())
        }
    }

    pub fn to_record(&self) -> ExchangeRecord {
        ExchangeRecord {
            name: self.name.clone(),
            type_name: self.type_name.to_owned(),
            auto_delete: self.opts.auto_delete,
            alternate_exchange: self.opts.alternate_exchange.clone(),
            arguments: self.opts.arguments.clone(),
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("opts", &self.opts)
            .field("bindings", &self.binding_count())
            .finish()
    }
}

/// Registered exchange types by name.
pub struct ExchangeFactory {
    types: HashMap<&'static str, Arc<dyn ExchangeType>>,
}

impl ExchangeFactory {
    /// Fails on a type name registered twice or a base type missing.
    pub fn new(types: Vec<Arc<dyn ExchangeType>>) -> Result<Self> {
        let mut map: HashMap<&'static str, Arc<dyn ExchangeType>> = HashMap::default();
        for t in types {
            if map.insert(t.name(), t.clone()).is_some() {
                return Err(BrokerError::DuplicateExchangeType(t.name().into()));
            }
        }
        if let Some(missing) = BASE_TYPES.iter().find(|t| !map.contains_key(*t)) {
            return Err(BrokerError::MissingExchangeType((*missing).into()));
        }
        Ok(Self { types: map })
    }

    pub fn builtin_types() -> Vec<Arc<dyn ExchangeType>> {
        vec![
            Arc::new(DirectExchangeType),
            Arc::new(TopicExchangeType),
            Arc::new(FanoutExchangeType),
            Arc::new(HeadersExchangeType),
        ]
    }

    #[inline]
    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ExchangeType>> {
        self.types.get(type_name)
    }

    pub fn type_names(&self) -> BTreeSet<&'static str> {
        self.types.keys().copied().collect()
    }

    /// Builds an exchange after the security manager allowed it.
    pub fn create_exchange(
        &self,
        security: &dyn SecurityManager,
        name: ExchangeName,
        type_name: &str,
        opts: ExchangeOptions,
    ) -> Result<Exchange> {
        if !security.authorise_create_exchange(&name, type_name) {
            return Err(BrokerError::access_refused(format!("permission denied: create exchange '{}'", name)));
        }
        let t = self.get(type_name).ok_or_else(|| BrokerError::UnknownExchangeType(type_name.into()))?;
        Ok(Exchange::new(name, t.as_ref(), opts))
    }

    /// Rebuilds a durable exchange found in the store.
    pub fn restore_exchange(&self, record: &ExchangeRecord) -> Result<Exchange> {
        let t = self.get(&record.type_name).ok_or_else(|| BrokerError::UnknownExchangeType(record.type_name.clone()))?;
        Ok(Exchange::new(
            record.name.clone(),
            t.as_ref(),
            ExchangeOptions {
                durable: true,
                auto_delete: record.auto_delete,
                alternate_exchange: record.alternate_exchange.clone(),
                arguments: record.arguments.clone(),
            },
        ))
    }
}

impl Default for ExchangeFactory {
    fn default() -> Self {
        let types = Self::builtin_types().into_iter().map(|t| (t.name(), t)).collect();
        Self { types }
    }
}

/// Exchanges of one virtual host by name.
pub struct ExchangeRegistry {
    exchanges: DashMap<ExchangeName, Arc<Exchange>>,
}

impl ExchangeRegistry {
    /// Starts with the default exchange and the `amq.*` exchanges.
    pub fn new(factory: &ExchangeFactory) -> Result<Self> {
        let exchanges = DashMap::default();
        let predeclared = [
            (DEFAULT_EXCHANGE, DIRECT),
            (AMQ_DIRECT, DIRECT),
            (AMQ_TOPIC, TOPIC),
            (AMQ_FANOUT, FANOUT),
            (AMQ_MATCH, HEADERS),
        ];
        for (name, type_name) in predeclared {
            let t = factory.get(type_name).ok_or_else(|| BrokerError::MissingExchangeType(type_name.into()))?;
            let opts = ExchangeOptions { durable: true, ..Default::default() };
            exchanges.insert(ExchangeName::from(name), Arc::new(Exchange::new(name.into(), t.as_ref(), opts)));
        }
        Ok(Self { exchanges })
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name).map(|e| e.value().clone())
    }

    #[inline]
    pub fn default_exchange(&self) -> Option<Arc<Exchange>> {
        self.get(DEFAULT_EXCHANGE)
    }

    /// Inserts unless the name is taken. Returns the registered exchange and whether it is `exchange`.
    pub fn insert_if_absent(&self, exchange: Exchange) -> (Arc<Exchange>, bool) {
        match self.exchanges.entry(exchange.name().clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let exchange = Arc::new(exchange);
                e.insert(exchange.clone());
                (exchange, true)
            }
        }
    }

    #[inline]
    pub fn remove(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.remove(name).map(|(_, e)| e)
    }

    pub fn list(&self) -> Vec<Arc<Exchange>> {
        self.exchanges.iter().map(|e| e.value().clone()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
