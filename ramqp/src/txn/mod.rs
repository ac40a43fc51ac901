//! Transaction engine.
//!
//! A [`ServerTransaction`] coordinates the durable half of enqueue/dequeue
//! (records written through a store [`Transaction`](crate::store::Transaction))
//! with the in-memory half (an [`Action`] per operation, run after the durable
//! commit or on rollback).
//!
//! * [`AutoCommitTransaction`]: every operation is final on return.
//! * [`LocalTransaction`]: operations accumulate until `commit` or `rollback`;
//!   the log handle is opened by the first durable operation.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::types::{MessageNumber, QueueName, TimestampMillis};
use crate::Result;

pub mod auto_commit;
pub mod local;

pub use auto_commit::AutoCommitTransaction;
pub use local::LocalTransaction;

/// A queue as seen by the transaction log.
pub trait TransactionLogResource: Send + Sync {
    fn resource_name(&self) -> &QueueName;

    fn is_durable(&self) -> bool;
}

/// A message as seen by the transaction log.
pub trait EnqueueableMessage: Send + Sync {
    fn message_number(&self) -> MessageNumber;

    fn is_persistent(&self) -> bool;
}

/// In-memory side effect of a transactional operation.
#[async_trait]
pub trait Action: Send + Sync {
    async fn post_commit(&mut self);

    async fn on_rollback(&mut self);
}

type Callback = Box<dyn FnOnce() + Send + Sync>;

/// [`Action`] made of two synchronous closures, each run at most once.
pub struct FnAction {
    commit: Option<Callback>,
    rollback: Option<Callback>,
}

impl FnAction {
    #[inline]
    pub fn new<C, R>(commit: C, rollback: R) -> Self
    where
        C: FnOnce() + Send + Sync + 'static,
        R: FnOnce() + Send + Sync + 'static,
    {
        Self { commit: Some(Box::new(commit)), rollback: Some(Box::new(rollback)) }
    }

    #[inline]
    pub fn on_commit<C>(commit: C) -> Self
    where
        C: FnOnce() + Send + Sync + 'static,
    {
        Self { commit: Some(Box::new(commit)), rollback: None }
    }
}

#[async_trait]
impl Action for FnAction {
    async fn post_commit(&mut self) {
        if let Some(f) = self.commit.take() {
            f();
        }
    }

    async fn on_rollback(&mut self) {
        if let Some(f) = self.rollback.take() {
            f();
        }
    }
}

#[inline]
fn needs_log(queue: &dyn TransactionLogResource, message: &dyn EnqueueableMessage) -> bool {
    message.is_persistent() && queue.is_durable()
}

async fn run_post_commit(actions: &mut [Box<dyn Action>]) {
    for action in actions.iter_mut() {
        action.post_commit().await;
    }
}

async fn run_rollback(actions: &mut [Box<dyn Action>]) {
    for action in actions.iter_mut() {
        action.on_rollback().await;
    }
}

#[async_trait]
pub trait ServerTransaction: Send + Sync {
    /// Time of the first operation of the current transaction, if one is open.
    fn start_time(&self) -> Option<TimestampMillis>;

    /// Whether a log transaction is open.
    fn in_transaction(&self) -> bool;

    /// `false` for auto-commit, where every operation completes immediately.
    fn is_transactional(&self) -> bool;

    async fn add_post_transaction_action(&mut self, action: Box<dyn Action>) -> Result<()>;

    async fn enqueue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()>;

    /// Enqueues one message on several queues as a single operation with one action.
    async fn enqueue_all(
        &mut self,
        queues: &[&dyn TransactionLogResource],
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()>;

    async fn dequeue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()>;

    /// Dequeues a batch of queue entries as a single operation with one action.
    async fn dequeue_entries(
        &mut self,
        entries: &[(&dyn TransactionLogResource, &dyn EnqueueableMessage)],
        action: Box<dyn Action>,
    ) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    /// Starts the commit and returns at once. The future resolves after the log commit
    /// and the post-commit actions; the next operation on this transaction waits for it.
    fn commit_async(&mut self) -> BoxFuture<'static, Result<()>>;

    async fn rollback(&mut self) -> Result<()>;
}
