//! Durable message store contract.
//!
//! The broker only talks to storage through [`MessageStore`] and the per
//! transaction log handle [`Transaction`]. Configuration records (exchanges,
//! queues, bindings) and message enqueue/dequeue records are persisted through
//! these traits; how they are laid out on disk is the store's business.
//!
//! A store that persists nothing only has to hand out message numbers; every
//! other method has a no-op default and [`NullTransaction`] is its log.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::message::MessageMetaData;
use crate::types::{ExchangeName, FieldTable, MessageNumber, QueueName, RoutingKey};

pub mod memory;

pub use memory::MemoryMessageStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Completion of an asynchronous log commit.
pub type StoreFuture = BoxFuture<'static, StoreResult<()>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message store is closed")]
    Closed,
    #[error("io error, {0}")]
    Io(String),
    #[error("codec error, {0}")]
    Codec(String),
    #[error("integrity error, {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub name: ExchangeName,
    pub type_name: String,
    pub auto_delete: bool,
    pub alternate_exchange: Option<ExchangeName>,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: QueueName,
    pub auto_delete: bool,
    pub alternate_exchange: Option<ExchangeName>,
    pub priorities: u8,
    pub max_delivery_count: u32,
    pub max_messages: Option<u32>,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingRecord {
    pub exchange: ExchangeName,
    pub queue: QueueName,
    pub binding_key: RoutingKey,
    pub arguments: FieldTable,
}

impl fmt::Display for BindingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.exchange, self.binding_key, self.queue)
    }
}

/// Distributed transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format: i64,
    pub global_id: Vec<u8>,
    pub branch_id: Vec<u8>,
}

/// One queue/message pair of a durable enqueue or dequeue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record {
    pub queue: QueueName,
    pub message: MessageNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidRecord {
    pub xid: Xid,
    pub enqueues: Vec<Record>,
    pub dequeues: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub number: MessageNumber,
    pub meta: MessageMetaData,
    pub content: Bytes,
}

/// Everything a store hands back on restart.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub exchanges: Vec<ExchangeRecord>,
    pub queues: Vec<QueueRecord>,
    pub bindings: Vec<BindingRecord>,
    pub messages: Vec<StoredMessage>,
    /// Durable queue entries in enqueue order.
    pub entries: Vec<Record>,
    pub xids: Vec<XidRecord>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    fn name(&self) -> &str;

    /// Allocates a message number, persistent or not.
    fn next_message_number(&self) -> MessageNumber;

    /// Opens a log transaction. Stores that persist nothing return a [`NullTransaction`].
    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(NullTransaction)
    }

    async fn add_message(
        &self,
        number: MessageNumber,
        meta: &MessageMetaData,
        content: Bytes,
    ) -> StoreResult<StoredMessage> {
        Ok(StoredMessage { number, meta: meta.clone(), content })
    }

    async fn remove_message(&self, _number: MessageNumber) -> StoreResult<()> {
        Ok(())
    }

    async fn create_exchange(&self, _record: &ExchangeRecord) -> StoreResult<()> {
        Ok(())
    }

    async fn remove_exchange(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn create_queue(&self, _record: &QueueRecord) -> StoreResult<()> {
        Ok(())
    }

    async fn remove_queue(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn bind_queue(&self, _record: &BindingRecord) -> StoreResult<()> {
        Ok(())
    }

    async fn unbind_queue(&self, _record: &BindingRecord) -> StoreResult<()> {
        Ok(())
    }

    async fn recover(&self) -> StoreResult<StoreSnapshot> {
        Ok(StoreSnapshot::default())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Log handle spanning the durable operations of one broker transaction.
/// Completing it, by commit or abort, consumes the handle.
#[async_trait]
pub trait Transaction: Send + Sync + 'static {
    async fn enqueue_message(&mut self, queue: &QueueName, message: MessageNumber) -> StoreResult<()>;

    async fn dequeue_message(&mut self, queue: &QueueName, message: MessageNumber) -> StoreResult<()>;

    async fn commit_tran(self: Box<Self>) -> StoreResult<()>;

    /// Commits without making the caller wait; the returned future resolves once the
    /// commit is durable.
    fn commit_tran_async(self: Box<Self>) -> StoreFuture {
        Box::pin(async move { self.commit_tran().await })
    }

    async fn abort_tran(self: Box<Self>) -> StoreResult<()>;

    async fn record_xid(&mut self, xid: &Xid, enqueues: &[Record], dequeues: &[Record]) -> StoreResult<()>;

    async fn remove_xid(&mut self, xid: &Xid) -> StoreResult<()>;
}

/// Log of a store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransaction;

#[async_trait]
impl Transaction for NullTransaction {
    async fn enqueue_message(&mut self, _queue: &QueueName, _message: MessageNumber) -> StoreResult<()> {
        Ok(())
    }

    async fn dequeue_message(&mut self, _queue: &QueueName, _message: MessageNumber) -> StoreResult<()> {
        Ok(())
    }

    async fn commit_tran(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }

    async fn abort_tran(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }

    async fn record_xid(&mut self, _xid: &Xid, _enqueues: &[Record], _dequeues: &[Record]) -> StoreResult<()> {
        Ok(())
    }

    async fn remove_xid(&mut self, _xid: &Xid) -> StoreResult<()> {
        Ok(())
    }
}
