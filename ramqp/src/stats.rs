//! Broker counters.
//!
//! One [`Stats`] lives in the broker context. Every counter keeps its current
//! value and the highest value seen; the whole set serializes to JSON for
//! whatever management surface embeds the broker.

use serde::Serialize;
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Debug, Default)]
pub struct Stats {
    pub exchanges: Counter,
    pub queues: Counter,
    pub bindings: Counter,
    pub consumers: Counter,
    pub sessions: Counter,
    pub transactions: Counter,

    pub messages: Counter,
    pub messages_published: Counter,
    pub messages_enqueued: Counter,
    pub messages_delivered: Counter,
    pub messages_acked: Counter,
    pub messages_released: Counter,
    pub messages_rejected: Counter,
    pub messages_dead_lettered: Counter,
    pub messages_dropped: Counter,
    pub messages_expired: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "exchanges.count": self.exchanges.count(),
            "exchanges.max": self.exchanges.max(),
            "queues.count": self.queues.count(),
            "queues.max": self.queues.max(),
            "bindings.count": self.bindings.count(),
            "bindings.max": self.bindings.max(),
            "consumers.count": self.consumers.count(),
            "consumers.max": self.consumers.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "transactions.count": self.transactions.count(),
            "transactions.max": self.transactions.max(),

            "messages.count": self.messages.count(),
            "messages.max": self.messages.max(),
            "messages.published": self.messages_published.count(),
            "messages.enqueued": self.messages_enqueued.count(),
            "messages.delivered": self.messages_delivered.count(),
            "messages.acked": self.messages_acked.count(),
            "messages.released": self.messages_released.count(),
            "messages.rejected": self.messages_rejected.count(),
            "messages.dead_lettered": self.messages_dead_lettered.count(),
            "messages.dropped": self.messages_dropped.count(),
            "messages.expired": self.messages_expired.count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_keeps_max() {
        let stats = Stats::new();
        stats.queues.inc();
        stats.queues.inc();
        stats.queues.dec();
        stats.messages_enqueued.incs(3);
        let json = stats.to_json();
        assert_eq!(json["queues.count"], 1);
        assert_eq!(json["queues.max"], 2);
        assert_eq!(json["messages.enqueued"], 3);
    }
}
