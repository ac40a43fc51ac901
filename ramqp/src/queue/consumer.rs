use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::QueueEntry;
use crate::conf::FlowMode;
use crate::types::{ConsumerId, ConsumerTag, QueueName, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireMode {
    /// Entries are acquired before they are sent.
    PreAcquired,
    /// Entries are sent without acquiring them, the subscriber may acquire later.
    NotAcquired,
}

/// Outstanding allowance of a consumer. `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub messages: Option<u32>,
    pub bytes: Option<u64>,
}

impl Credit {
    #[inline]
    pub fn unlimited() -> Self {
        Self { messages: None, bytes: None }
    }

    #[inline]
    pub fn stopped() -> Self {
        Self { messages: Some(0), bytes: Some(0) }
    }

    #[inline]
    pub fn messages(n: u32) -> Self {
        Self { messages: Some(n), bytes: None }
    }

    #[inline]
    fn allows(&self, size: u64) -> bool {
        self.messages.map(|m| m > 0).unwrap_or(true) && self.bytes.map(|b| b >= size).unwrap_or(true)
    }

    #[inline]
    fn take(&mut self, size: u64) {
        if let Some(m) = self.messages.as_mut() {
            *m = m.saturating_sub(1);
        }
        if let Some(b) = self.bytes.as_mut() {
            *b = b.saturating_sub(size);
        }
    }

    #[inline]
    fn give(&mut self, messages: u32, bytes: u64) {
        if let Some(m) = self.messages.as_mut() {
            *m = m.saturating_add(messages);
        }
        if let Some(b) = self.bytes.as_mut() {
            *b = b.saturating_add(bytes);
        }
    }
}

/// Where a consumer's deliveries go, normally a session.
#[async_trait]
pub trait ConsumerTarget: Send + Sync {
    /// Hands the entry over. `false` if the target is gone and the entry must be given back.
    async fn deliver(&self, consumer: &Consumer, entry: &Arc<QueueEntry>) -> bool;
}

pub struct Consumer {
    id: ConsumerId,
    tag: ConsumerTag,
    session: SessionId,
    queue: QueueName,
    acquire_mode: AcquireMode,
    flow_mode: FlowMode,
    credit: Mutex<Credit>,
    //last entry shown to a browsing consumer
    cursor: Mutex<Option<Arc<QueueEntry>>>,
    stopped: AtomicBool,
    target: Arc<dyn ConsumerTarget>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConsumerId,
        tag: ConsumerTag,
        session: SessionId,
        queue: QueueName,
        acquire_mode: AcquireMode,
        flow_mode: FlowMode,
        credit: Credit,
        target: Arc<dyn ConsumerTarget>,
    ) -> Self {
        Self {
            id,
            tag,
            session,
            queue,
            acquire_mode,
            flow_mode,
            credit: Mutex::new(credit),
            cursor: Mutex::new(None),
            stopped: AtomicBool::new(false),
            target,
        }
    }

    #[inline]
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    #[inline]
    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    #[inline]
    pub fn acquire_mode(&self) -> AcquireMode {
        self.acquire_mode
    }

    #[inline]
    pub fn flow_mode(&self) -> FlowMode {
        self.flow_mode
    }

    #[inline]
    pub fn target(&self) -> &Arc<dyn ConsumerTarget> {
        &self.target
    }

    #[inline]
    pub fn credit(&self) -> Credit {
        *self.credit.lock()
    }

    #[inline]
    pub fn has_credit(&self, size: u64) -> bool {
        !self.is_stopped() && self.credit.lock().allows(size)
    }

    /// Takes one message of `size` bytes from the allowance if it fits.
    #[inline]
    pub fn use_credit(&self, size: u64) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut credit = self.credit.lock();
        if credit.allows(size) {
            credit.take(size);
            true
        } else {
            false
        }
    }

    /// Adds to a limited allowance. Unlimited components stay unlimited.
    #[inline]
    pub fn add_credit(&self, messages: u32, bytes: u64) {
        self.credit.lock().give(messages, bytes);
    }

    #[inline]
    pub fn set_credit(&self, credit: Credit) {
        *self.credit.lock() = credit;
    }

    #[inline]
    pub fn set_unlimited(&self) {
        self.set_credit(Credit::unlimited());
    }

    /// In window mode a completed delivery frees its slot again.
    #[inline]
    pub fn restore_credit(&self, size: u64) {
        if self.flow_mode == FlowMode::Window {
            self.add_credit(1, size);
        }
    }

    /// Gives back the credit of a delivery the target refused.
    #[inline]
    pub(crate) fn refund_credit(&self, size: u64) {
        self.add_credit(1, size);
    }

    /// Drops all credit, the consumer stays subscribed.
    #[inline]
    pub fn flush_credit(&self) {
        self.set_credit(Credit::stopped());
    }

    #[inline]
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn cursor(&self) -> Option<Arc<QueueEntry>> {
        self.cursor.lock().clone()
    }

    #[inline]
    pub(crate) fn set_cursor(&self, entry: Arc<QueueEntry>) {
        *self.cursor.lock() = Some(entry);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("session", &self.session)
            .field("queue", &self.queue)
            .field("acquire_mode", &self.acquire_mode)
            .field("flow_mode", &self.flow_mode)
            .field("credit", &self.credit())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every delivery, refuses when `accept` is false.
    pub struct Collect {
        pub accept: AtomicBool,
        pub delivered: Mutex<Vec<Arc<QueueEntry>>>,
    }

    impl Collect {
        pub fn new() -> Arc<Self> {
            Arc::new(Self { accept: AtomicBool::new(true), delivered: Mutex::new(Vec::new()) })
        }

        pub fn numbers(&self) -> Vec<u64> {
            self.delivered.lock().iter().map(|e| e.message().number()).collect()
        }
    }

    #[async_trait]
    impl ConsumerTarget for Collect {
        async fn deliver(&self, _consumer: &Consumer, entry: &Arc<QueueEntry>) -> bool {
            if self.accept.load(Ordering::SeqCst) {
                self.delivered.lock().push(entry.clone());
                true
            } else {
                false
            }
        }
    }

    pub fn consumer(id: ConsumerId, credit: Credit, target: Arc<Collect>) -> Arc<Consumer> {
        Arc::new(Consumer::new(
            id,
            format!("c{}", id).into(),
            1,
            "q".into(),
            AcquireMode::PreAcquired,
            FlowMode::Credit,
            credit,
            target,
        ))
    }

    #[test]
    fn credit_accounting() {
        let c = consumer(1, Credit { messages: Some(2), bytes: Some(100) }, Collect::new());
        assert!(c.use_credit(60));
        assert!(!c.has_credit(60));
        assert!(c.has_credit(40));
        assert!(c.use_credit(40));
        assert!(!c.has_credit(0));
        c.add_credit(1, 10);
        assert_eq!(c.credit(), Credit { messages: Some(1), bytes: Some(10) });

        //restore only applies in window mode
        c.restore_credit(10);
        assert_eq!(c.credit().messages, Some(1));

        c.set_unlimited();
        assert!(c.use_credit(u64::MAX));
        c.stop();
        assert!(!c.has_credit(0));
    }

    #[test]
    fn window_mode_restores() {
        let c = Consumer::new(
            1,
            "w".into(),
            1,
            "q".into(),
            AcquireMode::PreAcquired,
            FlowMode::Window,
            Credit::messages(1),
            Collect::new(),
        );
        assert!(c.use_credit(5));
        assert!(!c.has_credit(0));
        c.restore_credit(5);
        assert!(c.has_credit(0));
        c.flush_credit();
        assert!(!c.has_credit(0));
    }
}
