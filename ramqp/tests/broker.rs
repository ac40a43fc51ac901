use std::sync::Arc;

use bytes::Bytes;

use ramqp::binding::BindingKey;
use ramqp::conf::Settings;
use ramqp::context::BrokerContext;
use ramqp::exchange::{ExchangeOptions, AMQ_MATCH, TOPIC};
use ramqp::message::{ContentHeader, DeliveryMode, MessagePublishInfo, ServerMessage};
use ramqp::queue::QueueOptions;
use ramqp::session::{DeliveryReceiver, Range, RangeSet, SubscribeOptions};
use ramqp::store::MemoryMessageStore;
use ramqp::types::{field_table, FieldTable};
use ramqp::vhost::VirtualHost;

fn vhost(store: &MemoryMessageStore) -> VirtualHost {
    VirtualHost::new(BrokerContext::new(Settings::default()), Arc::new(store.clone())).unwrap()
}

fn persistent(vhost: &VirtualHost, exchange: &str, key: &str, body: &'static str) -> ServerMessage {
    let header = ContentHeader { delivery_mode: DeliveryMode::Persistent, ..ContentHeader::new() };
    vhost.create_message(MessagePublishInfo::new(exchange, key), header, Bytes::from(body))
}

fn with_headers(vhost: &VirtualHost, headers: FieldTable) -> ServerMessage {
    let header = ContentHeader { headers, ..ContentHeader::new() };
    vhost.create_message(MessagePublishInfo::new(AMQ_MATCH, ""), header, Bytes::from_static(b"doc"))
}

fn durable() -> ExchangeOptions {
    ExchangeOptions { durable: true, ..Default::default() }
}

fn drain(rx: &mut DeliveryReceiver) -> Vec<ramqp::session::Delivery> {
    let mut out = Vec::new();
    while let Ok(Some(d)) = rx.try_next() {
        out.push(d);
    }
    out
}

#[tokio::test]
async fn durable_topic_publish_consume_accept() {
    let store = MemoryMessageStore::default();
    let vhost = vhost(&store);
    vhost.declare_exchange("orders", TOPIC, durable()).await.unwrap();
    vhost.declare_queue("new-orders", QueueOptions::default().durable(true)).await.unwrap();
    assert!(vhost.bind("orders", "new-orders", "orders.*", FieldTable::new()).await.unwrap());

    let (mut session, mut rx) = vhost.create_session().await;
    let routed = session.publish(persistent(&vhost, "orders", "orders.new", "order-1")).await.unwrap();
    assert_eq!(routed.queues().len(), 1);
    assert_eq!(store.queue_entries("new-orders").len(), 1);
    assert_eq!(store.message_count(), 1);

    //no binding for a deeper key
    let unrouted = session.publish(persistent(&vhost, "orders", "orders.new.eu", "order-2")).await.unwrap();
    assert!(!unrouted.is_routed());
    assert_eq!(vhost.ctx.stats.messages_dropped.count(), 1);

    session.subscribe("new-orders", "c1", SubscribeOptions::default()).await.unwrap();
    let deliveries = drain(&mut rx);
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message.content().as_ref(), b"order-1");
    assert_eq!(deliveries[0].queue, "new-orders");

    session.accept(&RangeSet::from(Range::single(deliveries[0].delivery_id))).await.unwrap();
    assert!(store.queue_entries("new-orders").is_empty());
    assert_eq!(store.message_count(), 0);
    assert_eq!(vhost.queue("new-orders").unwrap().message_count(), 0);

    session.close().await.unwrap();
    vhost.close().await.unwrap();
}

#[tokio::test]
async fn durable_state_is_recovered() {
    let store = MemoryMessageStore::default();
    {
        let vhost = vhost(&store);
        vhost.declare_exchange("orders", TOPIC, durable()).await.unwrap();
        vhost.declare_exchange("scratch", TOPIC, ExchangeOptions::default()).await.unwrap();
        vhost.declare_queue("new-orders", QueueOptions::default().durable(true)).await.unwrap();
        vhost.declare_queue("transient", QueueOptions::default()).await.unwrap();
        vhost.bind("orders", "new-orders", "orders.*", FieldTable::new()).await.unwrap();
        vhost.bind("orders", "transient", "orders.*", FieldTable::new()).await.unwrap();
        vhost.bind("scratch", "new-orders", "#", FieldTable::new()).await.unwrap();

        let (mut session, _rx) = vhost.create_session().await;
        let routed = session.publish(persistent(&vhost, "orders", "orders.new", "order-1")).await.unwrap();
        assert_eq!(routed.queues().len(), 2);
        session.close().await.unwrap();
        vhost.close().await.unwrap();
    }
    assert_eq!(store.binding_count(), 1);

    store.reopen();
    let vhost = vhost(&store);
    vhost.recover().await.unwrap();

    assert!(vhost.exchange("orders").is_some());
    assert!(vhost.exchange("scratch").is_none());
    assert!(vhost.queue("transient").is_none());
    let queue = vhost.queue("new-orders").unwrap();
    assert_eq!(queue.message_count(), 1);
    let key = BindingKey::new("orders", "new-orders", "orders.*", FieldTable::new());
    assert!(vhost.bindings.get_binding(&key).is_some());

    let (mut session, mut rx) = vhost.create_session().await;
    session.publish(persistent(&vhost, "orders", "orders.old", "order-2")).await.unwrap();
    assert_eq!(queue.message_count(), 2);

    session.subscribe("new-orders", "c1", SubscribeOptions::default()).await.unwrap();
    let bodies: Vec<_> = drain(&mut rx).into_iter().map(|d| d.message.content().clone()).collect();
    assert_eq!(bodies, vec![Bytes::from_static(b"order-1"), Bytes::from_static(b"order-2")]);
}

#[tokio::test]
async fn close_releases_every_outstanding_delivery() {
    let store = MemoryMessageStore::default();
    let vhost = vhost(&store);
    let queue = vhost.declare_queue("work", QueueOptions::default()).await.unwrap();

    let (mut session, mut rx) = vhost.create_session().await;
    session.subscribe("work", "c1", SubscribeOptions::default()).await.unwrap();
    for body in ["1", "2", "3", "4", "5"] {
        session.enqueue("work", persistent(&vhost, "", "work", body)).await.unwrap();
    }
    let deliveries = drain(&mut rx);
    assert_eq!(deliveries.len(), 5);
    assert_eq!(session.unacked_count(), 5);
    assert!(queue.entries().iter().all(|e| e.is_acquired()));

    session.close().await.unwrap();
    assert_eq!(session.unacked_count(), 0);
    assert_eq!(vhost.ctx.stats.messages_released.count(), 5);
    assert_eq!(queue.consumer_count(), 0);
    assert_eq!(queue.message_count(), 5);
    assert!(queue.entries().iter().all(|e| e.is_available() && e.delivery_count() == 1));

    //another session picks them up again, marked redelivered
    let (mut other, mut rx) = vhost.create_session().await;
    other.subscribe("work", "c2", SubscribeOptions::default()).await.unwrap();
    let again = drain(&mut rx);
    assert_eq!(again.len(), 5);
    assert!(again.iter().all(|d| d.redelivered));
}

#[tokio::test]
async fn headers_exchange_match_all() {
    let store = MemoryMessageStore::default();
    let vhost = vhost(&store);
    vhost.declare_queue("pdf-reports", QueueOptions::default()).await.unwrap();
    let args = field_table([("x-match", "all"), ("format", "pdf"), ("type", "report")]);
    vhost.bind(AMQ_MATCH, "pdf-reports", "", args).await.unwrap();

    let both = with_headers(&vhost, field_table([("format", "pdf"), ("type", "report"), ("lang", "en")]));
    assert_eq!(vhost.route(AMQ_MATCH, &both).unwrap().queues().len(), 1);

    let one = with_headers(&vhost, field_table([("format", "pdf")]));
    assert!(!vhost.route(AMQ_MATCH, &one).unwrap().is_routed());

    let wrong = with_headers(&vhost, field_table([("format", "zip"), ("type", "report")]));
    assert!(!vhost.route(AMQ_MATCH, &wrong).unwrap().is_routed());
}
