use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{
    needs_log, run_post_commit, run_rollback, Action, EnqueueableMessage, ServerTransaction,
    TransactionLogResource,
};
use crate::error::BrokerError;
use crate::store::{MessageStore, StoreError, Transaction};
use crate::types::TimestampMillis;
use crate::utils::timestamp_millis;
use crate::Result;

/// Batches operations until `commit` or `rollback`.
///
/// Any store failure while recording an operation tidies the whole transaction
/// up: every registered rollback action runs, the log transaction is aborted and
/// the state is reset before the error is returned.
pub struct LocalTransaction {
    store: Arc<dyn MessageStore>,
    transaction: Option<Box<dyn Transaction>>,
    actions: Vec<Box<dyn Action>>,
    start_time: Option<TimestampMillis>,
    pending_commit: Option<JoinHandle<()>>,
}

impl LocalTransaction {
    #[inline]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store, transaction: None, actions: Vec::new(), start_time: None, pending_commit: None }
    }

    /// Waits for an outstanding asynchronous commit.
    async fn sync(&mut self) {
        if let Some(pending) = self.pending_commit.take() {
            if let Err(e) = pending.await {
                log::error!("asynchronous commit task failed, {:?}", e);
            }
        }
    }

    #[inline]
    fn begin(&mut self, action: Box<dyn Action>) {
        if self.start_time.is_none() {
            self.start_time = Some(timestamp_millis());
        }
        self.actions.push(action);
    }

    #[inline]
    fn log(&mut self) -> &mut Box<dyn Transaction> {
        let store = &self.store;
        self.transaction.get_or_insert_with(|| store.new_transaction())
    }

    #[inline]
    fn reset(&mut self) {
        self.transaction = None;
        self.actions.clear();
        self.start_time = None;
    }

    /// The single cleanup path for failures while recording operations.
    async fn tidy_up_on_error(&mut self, e: StoreError) -> BrokerError {
        run_rollback(&mut self.actions).await;
        if let Some(txn) = self.transaction.take() {
            if let Err(abort) = txn.abort_tran().await {
                log::error!("abort transaction failed while handling {:?}, {:?}", e, abort);
            }
        }
        self.reset();
        BrokerError::Store(e)
    }

    async fn record(
        &mut self,
        enqueue: bool,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
    ) -> std::result::Result<(), StoreError> {
        log::debug!(
            "{} of message number {} {} transaction log, queue: {}",
            if enqueue { "Enqueue" } else { "Dequeue" },
            message.message_number(),
            if enqueue { "to" } else { "from" },
            queue.resource_name()
        );
        let number = message.message_number();
        let log = self.log();
        if enqueue {
            log.enqueue_message(queue.resource_name(), number).await
        } else {
            log.dequeue_message(queue.resource_name(), number).await
        }
    }
}

#[async_trait]
impl ServerTransaction for LocalTransaction {
    #[inline]
    fn start_time(&self) -> Option<TimestampMillis> {
        self.start_time
    }

    #[inline]
    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    #[inline]
    fn is_transactional(&self) -> bool {
        true
    }

    async fn add_post_transaction_action(&mut self, action: Box<dyn Action>) -> Result<()> {
        self.sync().await;
        self.actions.push(action);
        Ok(())
    }

    async fn enqueue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        self.sync().await;
        self.begin(action);
        if needs_log(queue, message) {
            if let Err(e) = self.record(true, queue, message).await {
                log::error!("Error during message enqueue, {:?}", e);
                return Err(self.tidy_up_on_error(e).await);
            }
        }
        Ok(())
    }

    async fn enqueue_all(
        &mut self,
        queues: &[&dyn TransactionLogResource],
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        self.sync().await;
        self.begin(action);
        for queue in queues.iter().filter(|q| needs_log(**q, message)) {
            if let Err(e) = self.record(true, *queue, message).await {
                log::error!("Error during message enqueue, {:?}", e);
                return Err(self.tidy_up_on_error(e).await);
            }
        }
        Ok(())
    }

    async fn dequeue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        self.sync().await;
        self.begin(action);
        if needs_log(queue, message) {
            if let Err(e) = self.record(false, queue, message).await {
                log::error!("Error during message dequeues, {:?}", e);
                return Err(self.tidy_up_on_error(e).await);
            }
        }
        Ok(())
    }

    async fn dequeue_entries(
        &mut self,
        entries: &[(&dyn TransactionLogResource, &dyn EnqueueableMessage)],
        action: Box<dyn Action>,
    ) -> Result<()> {
        self.sync().await;
        self.begin(action);
        for (queue, message) in entries.iter().filter(|(q, m)| needs_log(*q, *m)) {
            if let Err(e) = self.record(false, *queue, *message).await {
                log::error!("Error during message dequeues, {:?}", e);
                return Err(self.tidy_up_on_error(e).await);
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.sync().await;
        let result = match self.transaction.take() {
            Some(txn) => txn.commit_tran().await,
            None => Ok(()),
        };
        let result = match result {
            Ok(()) => {
                run_post_commit(&mut self.actions).await;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to commit transaction, {:?}", e);
                run_rollback(&mut self.actions).await;
                Err(e.into())
            }
        };
        self.reset();
        result
    }

    fn commit_async(&mut self) -> BoxFuture<'static, Result<()>> {
        let txn = self.transaction.take();
        let mut actions = std::mem::take(&mut self.actions);
        self.reset();

        let (tx, rx) = oneshot::channel();
        let work = async move {
            let committed = match txn {
                Some(txn) => txn.commit_tran_async().await,
                None => Ok(()),
            };
            let result = match committed {
                Ok(()) => {
                    run_post_commit(&mut actions).await;
                    Ok(())
                }
                Err(e) => {
                    log::error!("Failed to commit transaction, {:?}", e);
                    run_rollback(&mut actions).await;
                    Err(BrokerError::from(e))
                }
            };
            let _ = tx.send(result);
        };

        //an earlier async commit must finish before this one starts
        let previous = self.pending_commit.take();
        self.pending_commit = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            work.await
        }));

        Box::pin(async move { rx.await.unwrap_or_else(|_| Err(anyhow!("asynchronous commit was dropped").into())) })
    }

    async fn rollback(&mut self) -> Result<()> {
        self.sync().await;
        let aborted = match self.transaction.take() {
            Some(txn) => txn.abort_tran().await,
            None => Ok(()),
        };
        run_rollback(&mut self.actions).await;
        self.reset();
        aborted.map_err(|e| {
            log::error!("Failed to rollback transaction, {:?}", e);
            BrokerError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::message::{ContentHeader, DeliveryMode, MessageMetaData, MessagePublishInfo};
    use crate::store::{MemoryMessageStore, Record, StoreResult, Xid};
    use crate::txn::tests::{Tally, M, Q};
    use crate::types::{MessageNumber, QueueName};

    async fn stored(store: &MemoryMessageStore) -> MessageNumber {
        let n = store.next_message_number();
        let header = ContentHeader { delivery_mode: DeliveryMode::Persistent, ..ContentHeader::new() };
        let meta = MessageMetaData::new(MessagePublishInfo::new("", "q1"), header, 0);
        store.add_message(n, &meta, Bytes::new()).await.unwrap();
        n
    }

    /// Store whose log rejects dequeues and, optionally, commits.
    struct FailingStore {
        fail_commit: bool,
        fail_abort: bool,
    }

    struct FailingLog {
        fail_commit: bool,
        fail_abort: bool,
    }

    #[async_trait]
    impl MessageStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }
        fn next_message_number(&self) -> MessageNumber {
            1
        }
        fn new_transaction(&self) -> Box<dyn Transaction> {
            Box::new(FailingLog { fail_commit: self.fail_commit, fail_abort: self.fail_abort })
        }
    }

    #[async_trait]
    impl Transaction for FailingLog {
        async fn enqueue_message(&mut self, _queue: &QueueName, _message: MessageNumber) -> StoreResult<()> {
            Ok(())
        }
        async fn dequeue_message(&mut self, _queue: &QueueName, _message: MessageNumber) -> StoreResult<()> {
            Err(StoreError::Io("disk full".into()))
        }
        async fn commit_tran(self: Box<Self>) -> StoreResult<()> {
            if self.fail_commit {
                Err(StoreError::Io("fsync".into()))
            } else {
                Ok(())
            }
        }
        async fn abort_tran(self: Box<Self>) -> StoreResult<()> {
            if self.fail_abort {
                Err(StoreError::Closed)
            } else {
                Ok(())
            }
        }
        async fn record_xid(&mut self, _xid: &Xid, _e: &[Record], _d: &[Record]) -> StoreResult<()> {
            Ok(())
        }
        async fn remove_xid(&mut self, _xid: &Xid) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_runs_actions_in_order_after_log() {
        let store = MemoryMessageStore::default();
        let mut txn = LocalTransaction::new(Arc::new(store.clone()));
        let n = stored(&store).await;
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let durable = Q("q1".into(), true);
        let transient = Q("q2".into(), false);
        for (i, q) in [&durable, &transient].into_iter().enumerate() {
            let order = order.clone();
            let s = store.clone();
            txn.enqueue(
                q,
                &M(n, true),
                Box::new(crate::txn::FnAction::on_commit(move || {
                    //the log commit is visible before any action runs
                    assert_eq!(s.queue_entries("q1").len(), 1);
                    order.lock().push(i);
                })),
            )
            .await
            .unwrap();
        }
        assert!(txn.in_transaction());
        assert!(txn.start_time().is_some());
        assert!(store.queue_entries("q1").is_empty());

        txn.commit().await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1]);
        assert!(!txn.in_transaction());
        assert_eq!(txn.start_time(), None);
    }

    #[tokio::test]
    async fn transient_operations_do_not_open_the_log() {
        let store = MemoryMessageStore::default();
        let mut txn = LocalTransaction::new(Arc::new(store));
        let tally = Tally::default();
        txn.enqueue(&Q("q".into(), true), &M(7, false), tally.action()).await.unwrap();
        txn.dequeue(&Q("q".into(), false), &M(7, true), tally.action()).await.unwrap();
        assert!(!txn.in_transaction());
        txn.commit().await.unwrap();
        assert_eq!(tally.commits(), 2);
    }

    #[tokio::test]
    async fn dequeue_failure_tidies_up() {
        let mut txn = LocalTransaction::new(Arc::new(FailingStore { fail_commit: false, fail_abort: false }));
        let tally = Tally::default();
        let q = Q("q1".into(), true);

        txn.enqueue(&q, &M(1, true), tally.action()).await.unwrap();
        let (m1, m2) = (M(1, true), M(2, true));
        let entries: [(&dyn TransactionLogResource, &dyn EnqueueableMessage); 2] = [(&q, &m1), (&q, &m2)];
        let err = txn.dequeue_entries(&entries, tally.action()).await.unwrap_err();
        assert!(err.is_store());

        //no post-commit action, every rollback action exactly once
        assert_eq!(tally.commits(), 0);
        assert_eq!(tally.rollbacks(), 2);
        assert!(!txn.in_transaction());

        //state was reset, a later commit has nothing to run
        txn.commit().await.unwrap();
        assert_eq!(tally.commits(), 0);
        assert_eq!(tally.rollbacks(), 2);
    }

    #[tokio::test]
    async fn commit_failure_runs_rollback_actions() {
        let mut txn = LocalTransaction::new(Arc::new(FailingStore { fail_commit: true, fail_abort: false }));
        let tally = Tally::default();
        txn.enqueue(&Q("q1".into(), true), &M(1, true), tally.action()).await.unwrap();
        txn.enqueue(&Q("q2".into(), true), &M(1, true), tally.action()).await.unwrap();
        assert!(txn.commit().await.is_err());
        assert_eq!(tally.commits(), 0);
        assert_eq!(tally.rollbacks(), 2);
        assert!(!txn.in_transaction());
    }

    #[tokio::test]
    async fn rollback_actions_run_even_if_abort_fails() {
        let mut txn = LocalTransaction::new(Arc::new(FailingStore { fail_commit: false, fail_abort: true }));
        let tally = Tally::default();
        txn.enqueue(&Q("q1".into(), true), &M(1, true), tally.action()).await.unwrap();
        assert!(txn.rollback().await.is_err());
        assert_eq!(tally.rollbacks(), 1);
        assert!(!txn.in_transaction());
        assert_eq!(txn.start_time(), None);
    }

    #[tokio::test]
    async fn commit_async_completes_before_next_operation() {
        let store = MemoryMessageStore::default();
        let mut txn = LocalTransaction::new(Arc::new(store.clone()));
        let tally = Tally::default();
        let n = stored(&store).await;
        let q = Q("q1".into(), true);

        txn.enqueue(&q, &M(n, true), tally.action()).await.unwrap();
        let done = txn.commit_async();
        assert!(!txn.in_transaction());

        //the next operation waits for the outstanding commit
        txn.dequeue(&q, &M(n, true), tally.action()).await.unwrap();
        assert_eq!(tally.commits(), 1);
        assert_eq!(store.queue_entries("q1"), vec![n]);
        done.await.unwrap();

        txn.commit().await.unwrap();
        assert_eq!(tally.commits(), 2);
        assert!(store.queue_entries("q1").is_empty());
    }
}
