use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::binding::BindingKey;
use crate::types::{ConsumerTag, QueueName, SessionId};

pub type TaskId = u64;

/// Work to do when the owner (queue, exchange or session) goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseTask {
    RemoveBinding(BindingKey),
    CancelConsumer { session: SessionId, tag: ConsumerTag },
    DeleteQueue(QueueName),
}

/// Close tasks in registration order, each addressable by the id handed out on `add`.
#[derive(Debug, Default)]
pub struct CloseTasks {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<TaskId, CloseTask>>,
}

impl CloseTasks {
    #[inline]
    pub fn add(&self, task: CloseTask) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().insert(id, task);
        id
    }

    #[inline]
    pub fn remove(&self, id: TaskId) -> Option<CloseTask> {
        self.tasks.lock().remove(&id)
    }

    /// Removes the first task equal to `task`.
    #[inline]
    pub fn remove_task(&self, task: &CloseTask) -> Option<TaskId> {
        let mut tasks = self.tasks.lock();
        let id = tasks.iter().find(|(_, t)| *t == task).map(|(id, _)| *id)?;
        tasks.remove(&id);
        Some(id)
    }

    /// Takes every task, oldest first.
    #[inline]
    pub fn drain(&self) -> Vec<CloseTask> {
        std::mem::take(&mut *self.tasks.lock()).into_values().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_and_removable() {
        let tasks = CloseTasks::default();
        let a = tasks.add(CloseTask::DeleteQueue("a".into()));
        tasks.add(CloseTask::CancelConsumer { session: 1, tag: "t".into() });
        tasks.add(CloseTask::DeleteQueue("c".into()));
        assert_eq!(tasks.len(), 3);

        assert_eq!(tasks.remove(a), Some(CloseTask::DeleteQueue("a".into())));
        assert!(tasks.remove(a).is_none());
        assert!(tasks.remove_task(&CloseTask::DeleteQueue("c".into())).is_some());

        assert_eq!(tasks.drain(), vec![CloseTask::CancelConsumer { session: 1, tag: "t".into() }]);
        assert!(tasks.is_empty());
    }
}
