use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{needs_log, Action, EnqueueableMessage, ServerTransaction, TransactionLogResource};
use crate::store::{MessageStore, Record, StoreResult};
use crate::types::TimestampMillis;
use crate::Result;

/// Each operation is written in its own log transaction and committed before its
/// action runs.
pub struct AutoCommitTransaction {
    store: Arc<dyn MessageStore>,
}

impl AutoCommitTransaction {
    #[inline]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    async fn write(&self, enqueues: &[Record], dequeues: &[Record]) -> StoreResult<()> {
        if enqueues.is_empty() && dequeues.is_empty() {
            return Ok(());
        }
        let mut txn = self.store.new_transaction();
        let mut failed = None;
        for r in enqueues {
            if let Err(e) = txn.enqueue_message(&r.queue, r.message).await {
                failed = Some(e);
                break;
            }
        }
        if failed.is_none() {
            for r in dequeues {
                if let Err(e) = txn.dequeue_message(&r.queue, r.message).await {
                    failed = Some(e);
                    break;
                }
            }
        }
        match failed {
            None => txn.commit_tran().await,
            Some(e) => {
                if let Err(abort) = txn.abort_tran().await {
                    log::error!("abort failed while handling {:?}, {:?}", e, abort);
                }
                Err(e)
            }
        }
    }

    async fn complete(&self, enqueues: &[Record], dequeues: &[Record], mut action: Box<dyn Action>) -> Result<()> {
        match self.write(enqueues, dequeues).await {
            Ok(()) => {
                action.post_commit().await;
                Ok(())
            }
            Err(e) => {
                log::error!("auto-commit of {} enqueues, {} dequeues failed, {:?}", enqueues.len(), dequeues.len(), e);
                action.on_rollback().await;
                Err(e.into())
            }
        }
    }
}

#[inline]
fn record(queue: &dyn TransactionLogResource, message: &dyn EnqueueableMessage) -> Record {
    Record { queue: queue.resource_name().clone(), message: message.message_number() }
}

#[async_trait]
impl ServerTransaction for AutoCommitTransaction {
    #[inline]
    fn start_time(&self) -> Option<TimestampMillis> {
        None
    }

    #[inline]
    fn in_transaction(&self) -> bool {
        false
    }

    #[inline]
    fn is_transactional(&self) -> bool {
        false
    }

    async fn add_post_transaction_action(&mut self, mut action: Box<dyn Action>) -> Result<()> {
        action.post_commit().await;
        Ok(())
    }

    async fn enqueue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        let enqueues = if needs_log(queue, message) { vec![record(queue, message)] } else { Vec::new() };
        self.complete(&enqueues, &[], action).await
    }

    async fn enqueue_all(
        &mut self,
        queues: &[&dyn TransactionLogResource],
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        let enqueues: Vec<Record> =
            queues.iter().filter(|q| needs_log(**q, message)).map(|q| record(*q, message)).collect();
        self.complete(&enqueues, &[], action).await
    }

    async fn dequeue(
        &mut self,
        queue: &dyn TransactionLogResource,
        message: &dyn EnqueueableMessage,
        action: Box<dyn Action>,
    ) -> Result<()> {
        let dequeues = if needs_log(queue, message) { vec![record(queue, message)] } else { Vec::new() };
        self.complete(&[], &dequeues, action).await
    }

    async fn dequeue_entries(
        &mut self,
        entries: &[(&dyn TransactionLogResource, &dyn EnqueueableMessage)],
        action: Box<dyn Action>,
    ) -> Result<()> {
        let dequeues: Vec<Record> =
            entries.iter().filter(|(q, m)| needs_log(*q, *m)).map(|(q, m)| record(*q, *m)).collect();
        self.complete(&[], &dequeues, action).await
    }

    #[inline]
    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn commit_async(&mut self) -> BoxFuture<'static, Result<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    #[inline]
    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentHeader, DeliveryMode, MessageMetaData, MessagePublishInfo};
    use crate::store::MemoryMessageStore;
    use crate::txn::tests::{Tally, M, Q};

    #[tokio::test]
    async fn operations_are_final_on_return() {
        let store = MemoryMessageStore::default();
        let mut txn = AutoCommitTransaction::new(Arc::new(store.clone()));
        let tally = Tally::default();

        let n = store.next_message_number();
        let header = ContentHeader { delivery_mode: DeliveryMode::Persistent, ..ContentHeader::new() };
        let meta = MessageMetaData::new(MessagePublishInfo::new("", "q1"), header, 0);
        store.add_message(n, &meta, bytes::Bytes::new()).await.unwrap();

        let durable = Q("q1".into(), true);
        let transient = Q("q2".into(), false);
        txn.enqueue_all(&[&durable, &transient], &M(n, true), tally.action()).await.unwrap();
        assert_eq!(tally.commits(), 1);
        assert_eq!(store.queue_entries("q1"), vec![n]);
        assert!(store.queue_entries("q2").is_empty());
        assert!(!txn.in_transaction());
        assert_eq!(txn.start_time(), None);

        txn.dequeue(&durable, &M(n, true), tally.action()).await.unwrap();
        assert_eq!(tally.commits(), 2);
        assert!(store.queue_entries("q1").is_empty());

        //dequeue of an entry the log never saw fails the commit
        let err = txn.dequeue(&durable, &M(n, true), tally.action()).await.unwrap_err();
        assert!(err.is_store());
        assert_eq!(tally.commits(), 2);
        assert_eq!(tally.rollbacks(), 1);

        txn.add_post_transaction_action(tally.action()).await.unwrap();
        assert_eq!(tally.commits(), 3);
        txn.commit_async().await.unwrap();
    }
}
