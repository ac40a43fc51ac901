use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use super::{add_ref, remove_ref, ExchangeRouter, ExchangeType, RoutableMessage, FANOUT};
use crate::binding::BindingKey;
use crate::types::QueueName;

pub struct FanoutExchangeType;

impl ExchangeType for FanoutExchangeType {
    fn name(&self) -> &'static str {
        FANOUT
    }

    fn new_router(&self) -> Box<dyn ExchangeRouter> {
        Box::<FanoutRouter>::default()
    }
}

/// Every bound queue, routing key ignored.
#[derive(Default)]
struct FanoutRouter {
    queues: RwLock<BTreeMap<QueueName, usize>>,
}

impl ExchangeRouter for FanoutRouter {
    fn add_binding(&self, key: &BindingKey) {
        add_ref(&mut self.queues.write(), &key.queue);
    }

    fn remove_binding(&self, key: &BindingKey) {
        remove_ref(&mut self.queues.write(), &key.queue);
    }

    fn route(&self, _message: &RoutableMessage<'_>) -> BTreeSet<QueueName> {
        self.queues.read().keys().cloned().collect()
    }

    fn binding_count(&self) -> usize {
        self.queues.read().values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldTable;

    #[test]
    fn all_bound_queues() {
        let router = FanoutExchangeType.new_router();
        router.add_binding(&BindingKey::new("amq.fanout", "q1", "a", FieldTable::new()));
        router.add_binding(&BindingKey::new("amq.fanout", "q2", "", FieldTable::new()));
        let headers = FieldTable::new();
        assert_eq!(router.route(&RoutableMessage { routing_key: "zzz", headers: &headers }).len(), 2);
        router.remove_binding(&BindingKey::new("amq.fanout", "q2", "", FieldTable::new()));
        assert_eq!(router.route(&RoutableMessage { routing_key: "", headers: &headers }).len(), 1);
    }
}
