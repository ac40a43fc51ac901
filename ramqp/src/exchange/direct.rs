use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use super::{add_ref, remove_ref, ExchangeRouter, ExchangeType, RoutableMessage, DIRECT};
use crate::binding::BindingKey;
use crate::types::{HashMap, QueueName, RoutingKey};

pub struct DirectExchangeType;

impl ExchangeType for DirectExchangeType {
    fn name(&self) -> &'static str {
        DIRECT
    }

    fn new_router(&self) -> Box<dyn ExchangeRouter> {
        Box::<DirectRouter>::default()
    }
}

/// Exact routing key match.
#[derive(Default)]
pub(crate) struct DirectRouter {
    keys: RwLock<HashMap<RoutingKey, BTreeMap<QueueName, usize>>>,
}

impl ExchangeRouter for DirectRouter {
    fn add_binding(&self, key: &BindingKey) {
        add_ref(self.keys.write().entry(key.key.clone()).or_default(), &key.queue);
    }

    fn remove_binding(&self, key: &BindingKey) {
        let mut keys = self.keys.write();
        if let Some(queues) = keys.get_mut(&key.key) {
            remove_ref(queues, &key.queue);
            if queues.is_empty() {
                keys.remove(&key.key);
            }
        }
    }

    fn route(&self, message: &RoutableMessage<'_>) -> BTreeSet<QueueName> {
        self.keys
            .read()
            .get(message.routing_key)
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn binding_count(&self) -> usize {
        self.keys.read().values().map(|q| q.values().sum::<usize>()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldTable;

    #[test]
    fn exact_match_with_refcount() {
        let router = DirectExchangeType.new_router();
        let k1 = BindingKey::new("amq.direct", "q1", "k", FieldTable::new());
        let k2 = BindingKey::new("amq.direct", "q1", "k", crate::types::field_table([("a", 1i64)]));
        router.add_binding(&k1);
        router.add_binding(&k2);
        router.add_binding(&BindingKey::new("amq.direct", "q2", "other", FieldTable::new()));

        let headers = FieldTable::new();
        let msg = RoutableMessage { routing_key: "k", headers: &headers };
        assert_eq!(router.route(&msg).len(), 1);

        //q1 stays bound through the second binding
        router.remove_binding(&k1);
        assert_eq!(router.route(&msg).len(), 1);
        router.remove_binding(&k2);
        assert!(router.route(&msg).is_empty());
        assert!(router.route(&RoutableMessage { routing_key: "K", headers: &headers }).is_empty());
        assert_eq!(router.binding_count(), 1);
    }
}
