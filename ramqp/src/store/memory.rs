use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{
    BindingRecord, ExchangeRecord, MessageStore, QueueRecord, Record, StoreError, StoreResult, StoreSnapshot,
    StoredMessage, Transaction, Xid, XidRecord,
};
use crate::message::MessageMetaData;
use crate::types::{ExchangeName, MessageNumber, QueueName};

/// In-process store with real transactional staging.
///
/// Log transactions buffer their records and apply them under one write lock at
/// commit, so a failed or aborted transaction leaves no trace. State survives as
/// long as any clone of the store does, which lets a second broker instance
/// recover from it.
#[derive(Clone)]
pub struct MemoryMessageStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    name: String,
    next_number: AtomicU64,
    closed: AtomicBool,
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    //encoded metadata and body
    messages: BTreeMap<MessageNumber, (Vec<u8>, Bytes)>,
    exchanges: BTreeMap<ExchangeName, ExchangeRecord>,
    queues: BTreeMap<QueueName, QueueRecord>,
    bindings: BTreeSet<BindingRecord>,
    //entry to its enqueue sequence
    entries: BTreeMap<Record, u64>,
    next_seq: u64,
    refs: BTreeMap<MessageNumber, usize>,
    xids: BTreeMap<Xid, XidRecord>,
}

impl MemoryState {
    fn ordered_entries(&self) -> Vec<Record> {
        let mut ordered: Vec<(&Record, u64)> = self.entries.iter().map(|(r, seq)| (r, *seq)).collect();
        ordered.sort_unstable_by_key(|(_, seq)| *seq);
        ordered.into_iter().map(|(r, _)| r.clone()).collect()
    }

    fn release_ref(&mut self, message: MessageNumber) {
        let remaining = match self.refs.get_mut(&message) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => 0,
        };
        if remaining == 0 {
            self.refs.remove(&message);
            self.messages.remove(&message);
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryMessageStore {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                next_number: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                state: RwLock::new(MemoryState::default()),
            }),
        }
    }

    /// Clears the closed flag, as a restarted process would find the store.
    #[inline]
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn message_count(&self) -> usize {
        self.inner.state.read().messages.len()
    }

    /// Durable entries currently recorded for `queue`, in enqueue order.
    #[inline]
    pub fn queue_entries(&self, queue: &str) -> Vec<MessageNumber> {
        let state = self.inner.state.read();
        state.ordered_entries().into_iter().filter(|r| r.queue == queue).map(|r| r.message).collect()
    }

    #[inline]
    pub fn binding_count(&self) -> usize {
        self.inner.state.read().bindings.len()
    }

    #[inline]
    fn check_open(&self) -> StoreResult<()> {
        self.inner.check_open()
    }
}

impl MemoryInner {
    #[inline]
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    fn next_message_number(&self) -> MessageNumber {
        self.inner.next_number.fetch_add(1, Ordering::SeqCst)
    }

    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction {
            store: self.inner.clone(),
            enqueues: Vec::new(),
            dequeues: Vec::new(),
            xid_adds: Vec::new(),
            xid_removes: Vec::new(),
        })
    }

    async fn add_message(
        &self,
        number: MessageNumber,
        meta: &MessageMetaData,
        content: Bytes,
    ) -> StoreResult<StoredMessage> {
        self.check_open()?;
        let encoded = meta.encode()?;
        self.inner.state.write().messages.insert(number, (encoded, content.clone()));
        Ok(StoredMessage { number, meta: meta.clone(), content })
    }

    async fn remove_message(&self, number: MessageNumber) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.write();
        if !state.refs.contains_key(&number) {
            state.messages.remove(&number);
        }
        Ok(())
    }

    async fn create_exchange(&self, record: &ExchangeRecord) -> StoreResult<()> {
        self.check_open()?;
        self.inner.state.write().exchanges.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove_exchange(&self, name: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.write();
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
        Ok(())
    }

    async fn create_queue(&self, record: &QueueRecord) -> StoreResult<()> {
        self.check_open()?;
        self.inner.state.write().queues.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove_queue(&self, name: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut state = self.inner.state.write();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
        let dropped: Vec<Record> = state.entries.keys().filter(|r| r.queue == name).cloned().collect();
        for r in dropped {
            state.entries.remove(&r);
            state.release_ref(r.message);
        }
        Ok(())
    }

    async fn bind_queue(&self, record: &BindingRecord) -> StoreResult<()> {
        self.check_open()?;
        self.inner.state.write().bindings.insert(record.clone());
        Ok(())
    }

    async fn unbind_queue(&self, record: &BindingRecord) -> StoreResult<()> {
        self.check_open()?;
        self.inner.state.write().bindings.remove(record);
        Ok(())
    }

    async fn recover(&self) -> StoreResult<StoreSnapshot> {
        self.check_open()?;
        let mut state = self.inner.state.write();

        //messages stored but never enqueued are dropped on restart
        let orphans: Vec<MessageNumber> =
            state.messages.keys().filter(|n| !state.refs.contains_key(n)).copied().collect();
        for n in orphans {
            state.messages.remove(&n);
        }

        let mut messages = Vec::with_capacity(state.messages.len());
        for (number, (encoded, content)) in state.messages.iter() {
            let meta = MessageMetaData::decode(encoded)?;
            messages.push(StoredMessage { number: *number, meta, content: content.clone() });
        }

        if let Some(max) = state.messages.keys().next_back() {
            self.inner.next_number.fetch_max(max + 1, Ordering::SeqCst);
        }

        Ok(StoreSnapshot {
            exchanges: state.exchanges.values().cloned().collect(),
            queues: state.queues.values().cloned().collect(),
            bindings: state.bindings.iter().cloned().collect(),
            messages,
            entries: state.ordered_entries(),
            xids: state.xids.values().cloned().collect(),
        })
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransaction {
    store: Arc<MemoryInner>,
    enqueues: Vec<Record>,
    dequeues: Vec<Record>,
    xid_adds: Vec<XidRecord>,
    xid_removes: Vec<Xid>,
}

impl MemoryTransaction {
    fn apply(self) -> StoreResult<()> {
        self.store.check_open()?;
        let mut state = self.store.state.write();

        for r in self.enqueues.iter() {
            if !state.messages.contains_key(&r.message) {
                return Err(StoreError::Integrity(format!("message {} was never stored", r.message)));
            }
            if state.entries.contains_key(r) {
                return Err(StoreError::Integrity(format!("duplicate enqueue of {} on {}", r.message, r.queue)));
            }
        }
        for r in self.dequeues.iter() {
            if !state.entries.contains_key(r) && !self.enqueues.contains(r) {
                return Err(StoreError::Integrity(format!("no enqueue of {} on {}", r.message, r.queue)));
            }
        }

        for r in self.enqueues {
            *state.refs.entry(r.message).or_default() += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(r, seq);
        }
        for r in self.dequeues {
            if state.entries.remove(&r).is_some() {
                state.release_ref(r.message);
            }
        }
        for x in self.xid_adds {
            state.xids.insert(x.xid.clone(), x);
        }
        for xid in self.xid_removes {
            state.xids.remove(&xid);
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn enqueue_message(&mut self, queue: &QueueName, message: MessageNumber) -> StoreResult<()> {
        self.store.check_open()?;
        self.enqueues.push(Record { queue: queue.clone(), message });
        Ok(())
    }

    async fn dequeue_message(&mut self, queue: &QueueName, message: MessageNumber) -> StoreResult<()> {
        self.store.check_open()?;
        self.dequeues.push(Record { queue: queue.clone(), message });
        Ok(())
    }

    async fn commit_tran(self: Box<Self>) -> StoreResult<()> {
        self.apply()
    }

    async fn abort_tran(self: Box<Self>) -> StoreResult<()> {
        log::debug!(
            "{} abort, discarding {} enqueues and {} dequeues",
            self.store.name,
            self.enqueues.len(),
            self.dequeues.len()
        );
        Ok(())
    }

    async fn record_xid(&mut self, xid: &Xid, enqueues: &[Record], dequeues: &[Record]) -> StoreResult<()> {
        self.store.check_open()?;
        self.xid_adds.push(XidRecord { xid: xid.clone(), enqueues: enqueues.to_vec(), dequeues: dequeues.to_vec() });
        Ok(())
    }

    async fn remove_xid(&mut self, xid: &Xid) -> StoreResult<()> {
        self.store.check_open()?;
        self.xid_removes.push(xid.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentHeader, DeliveryMode, MessagePublishInfo};
    use crate::types::FieldTable;

    fn meta() -> MessageMetaData {
        let header = ContentHeader { delivery_mode: DeliveryMode::Persistent, ..ContentHeader::new() };
        MessageMetaData::new(MessagePublishInfo::new("", "q1"), header, 5)
    }

    #[tokio::test]
    async fn commit_applies_and_abort_discards() {
        let store = MemoryMessageStore::default();
        let q: QueueName = "q1".into();
        let n = store.next_message_number();
        store.add_message(n, &meta(), Bytes::from_static(b"hello")).await.unwrap();

        let mut txn = store.new_transaction();
        txn.enqueue_message(&q, n).await.unwrap();
        txn.abort_tran().await.unwrap();
        assert!(store.queue_entries("q1").is_empty());

        let mut txn = store.new_transaction();
        txn.enqueue_message(&q, n).await.unwrap();
        txn.commit_tran().await.unwrap();
        assert_eq!(store.queue_entries("q1"), vec![n]);

        let mut txn = store.new_transaction();
        txn.dequeue_message(&q, n).await.unwrap();
        txn.commit_tran_async().await.unwrap();
        assert!(store.queue_entries("q1").is_empty());
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_trace() {
        let store = MemoryMessageStore::default();
        let q: QueueName = "q1".into();
        let n = store.next_message_number();
        store.add_message(n, &meta(), Bytes::new()).await.unwrap();

        let mut txn = store.new_transaction();
        txn.enqueue_message(&q, n).await.unwrap();
        txn.dequeue_message(&q, n + 100).await.unwrap();
        assert!(matches!(txn.commit_tran().await, Err(StoreError::Integrity(_))));
        assert!(store.queue_entries("q1").is_empty());
    }

    #[tokio::test]
    async fn recover_snapshot() {
        let store = MemoryMessageStore::default();
        let q: QueueName = "q1".into();
        let kept = store.next_message_number();
        let orphan = store.next_message_number();
        store.add_message(kept, &meta(), Bytes::from_static(b"a")).await.unwrap();
        store.add_message(orphan, &meta(), Bytes::from_static(b"b")).await.unwrap();
        let binding = BindingRecord {
            exchange: "amq.direct".into(),
            queue: q.clone(),
            binding_key: "k".into(),
            arguments: FieldTable::new(),
        };
        store.bind_queue(&binding).await.unwrap();
        store.bind_queue(&binding).await.unwrap();

        let xid = Xid { format: 1, global_id: b"g".to_vec(), branch_id: b"b".to_vec() };
        let mut txn = store.new_transaction();
        txn.enqueue_message(&q, kept).await.unwrap();
        txn.record_xid(&xid, &[Record { queue: q.clone(), message: kept }], &[]).await.unwrap();
        txn.commit_tran().await.unwrap();

        store.close().await.unwrap();
        assert_eq!(store.recover().await.unwrap_err(), StoreError::Closed);
        store.reopen();

        let snapshot = store.recover().await.unwrap();
        assert_eq!(snapshot.bindings, vec![binding]);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].number, kept);
        assert_eq!(snapshot.messages[0].meta, meta_with_time(&snapshot.messages[0].meta));
        assert_eq!(snapshot.entries, vec![Record { queue: q.clone(), message: kept }]);
        assert_eq!(snapshot.xids.len(), 1);

        let mut txn = store.new_transaction();
        txn.remove_xid(&xid).await.unwrap();
        txn.commit_tran().await.unwrap();
        assert!(store.recover().await.unwrap().xids.is_empty());
        assert!(store.next_message_number() > orphan);
    }

    #[tokio::test]
    async fn recover_keeps_enqueue_order() {
        let store = MemoryMessageStore::default();
        let q: QueueName = "q1".into();
        let older = store.next_message_number();
        let newer = store.next_message_number();
        store.add_message(older, &meta(), Bytes::from_static(b"a")).await.unwrap();
        store.add_message(newer, &meta(), Bytes::from_static(b"b")).await.unwrap();

        //the higher numbered message reaches the queue first
        for n in [newer, older] {
            let mut txn = store.new_transaction();
            txn.enqueue_message(&q, n).await.unwrap();
            txn.commit_tran().await.unwrap();
        }
        assert_eq!(store.queue_entries("q1"), vec![newer, older]);

        let snapshot = store.recover().await.unwrap();
        let order: Vec<MessageNumber> = snapshot.entries.iter().map(|r| r.message).collect();
        assert_eq!(order, vec![newer, older]);
    }

    fn meta_with_time(m: &MessageMetaData) -> MessageMetaData {
        MessageMetaData { arrival_time: m.arrival_time, ..meta() }
    }
}
