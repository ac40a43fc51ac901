use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::store::{StoreError, StoreResult};
use crate::types::{ExchangeName, FieldTable, MessageNumber, RoutingKey, TimestampMillis};
use crate::utils::timestamp_millis;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PublishFlags: u8 {
        const MANDATORY = 0b0000_0001;
        const IMMEDIATE = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    #[default]
    NonPersistent = 1,
    Persistent = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePublishInfo {
    pub exchange: ExchangeName,
    pub routing_key: RoutingKey,
    pub flags: PublishFlags,
}

impl MessagePublishInfo {
    #[inline]
    pub fn new<E: Into<ExchangeName>, R: Into<RoutingKey>>(exchange: E, routing_key: R) -> Self {
        Self { exchange: exchange.into(), routing_key: routing_key.into(), flags: PublishFlags::empty() }
    }

    #[inline]
    pub fn is_mandatory(&self) -> bool {
        self.flags.contains(PublishFlags::MANDATORY)
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.flags.contains(PublishFlags::IMMEDIATE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHeader {
    /// 0..=9, defaults to 4.
    pub priority: u8,
    /// Absolute expiry time.
    pub expiration: Option<TimestampMillis>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: FieldTable,
}

impl ContentHeader {
    pub const DEFAULT_PRIORITY: u8 = 4;

    #[inline]
    pub fn new() -> Self {
        Self { priority: Self::DEFAULT_PRIORITY, ..Default::default() }
    }
}

/// Everything about a message except its body, in the form the store persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetaData {
    pub publish_info: MessagePublishInfo,
    pub header: ContentHeader,
    pub content_size: u64,
    pub arrival_time: TimestampMillis,
}

impl MessageMetaData {
    #[inline]
    pub fn new(publish_info: MessagePublishInfo, header: ContentHeader, content_size: u64) -> Self {
        Self { publish_info, header, content_size, arrival_time: timestamp_millis() }
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.header.delivery_mode == DeliveryMode::Persistent
    }

    #[inline]
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    #[inline]
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        bincode::deserialize(data).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

/// Shared, immutable message. Every queue entry holding the message owns one reference.
#[derive(Clone)]
pub struct ServerMessage(Arc<MessageInner>);

pub struct MessageInner {
    number: MessageNumber,
    meta: MessageMetaData,
    content: Bytes,
}

impl Deref for ServerMessage {
    type Target = MessageInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl ServerMessage {
    #[inline]
    pub fn new(number: MessageNumber, meta: MessageMetaData, content: Bytes) -> Self {
        ServerMessage(Arc::new(MessageInner { number, meta, content }))
    }

    /// Number of live handles, queue entries included.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl MessageInner {
    #[inline]
    pub fn number(&self) -> MessageNumber {
        self.number
    }

    #[inline]
    pub fn meta(&self) -> &MessageMetaData {
        &self.meta
    }

    #[inline]
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.meta.content_size
    }

    #[inline]
    pub fn routing_key(&self) -> &str {
        &self.meta.publish_info.routing_key
    }

    #[inline]
    pub fn headers(&self) -> &FieldTable {
        &self.meta.header.headers
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.meta.header.priority
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.meta.is_persistent()
    }

    #[inline]
    pub fn expiration(&self) -> Option<TimestampMillis> {
        self.meta.header.expiration
    }

    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        matches!(self.meta.header.expiration, Some(exp) if exp > 0 && exp <= now)
    }
}

impl fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMessage")
            .field("number", &self.number)
            .field("exchange", &self.meta.publish_info.exchange)
            .field("routing_key", &self.meta.publish_info.routing_key)
            .field("priority", &self.meta.header.priority)
            .field("persistent", &self.is_persistent())
            .field("size", &self.content.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field_table;

    #[test]
    fn metadata_codec() {
        let mut info = MessagePublishInfo::new("amq.topic", "orders.new");
        info.flags |= PublishFlags::MANDATORY;
        let header = ContentHeader {
            delivery_mode: DeliveryMode::Persistent,
            message_id: Some("m-1".into()),
            headers: field_table([("region", "eu")]),
            ..ContentHeader::new()
        };
        let meta = MessageMetaData::new(info, header, 42);
        let data = meta.encode().unwrap();
        let decoded = MessageMetaData::decode(&data).unwrap();
        assert_eq!(decoded, meta);
        assert!(decoded.is_persistent());
        assert!(decoded.publish_info.is_mandatory());
        assert!(!decoded.publish_info.is_immediate());
        assert!(MessageMetaData::decode(&data[..3]).is_err());
    }

    #[test]
    fn expiry() {
        let header = ContentHeader { expiration: Some(1_000), ..ContentHeader::new() };
        let meta = MessageMetaData::new(MessagePublishInfo::new("", "q"), header, 0);
        let msg = ServerMessage::new(1, meta, Bytes::new());
        assert!(!msg.is_expired(999));
        assert!(msg.is_expired(1_000));
        let other = msg.clone();
        assert_eq!(other.ref_count(), 2);
    }
}
