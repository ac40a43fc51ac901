use std::collections::BTreeMap;
use std::fmt;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use ramqp_utils::{NodeId, TimestampMillis};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type DashSet<K> = dashmap::DashSet<K, ahash::RandomState>;

pub type QueueName = ByteString;
pub type ExchangeName = ByteString;
pub type RoutingKey = ByteString;
pub type ConsumerTag = ByteString;

pub type SessionId = u64;
pub type ConsumerId = u64;
/// Wire-level command id of a message transfer within one session.
pub type DeliveryId = u32;
/// Store-assigned message number, unique per broker instance.
pub type MessageNumber = u64;

/// Name of the distinguished default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

pub const X_MATCH: &str = "x-match";

/// Value of an AMQP argument or application header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    /// Present without a value. As a headers binding argument it only checks presence.
    Void,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Void => f.write_str("void"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Str(s) => write!(f, "{:?}", s),
            FieldValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.into())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Ordered argument table, so two tables with the same entries compare and hash equal.
pub type FieldTable = BTreeMap<String, FieldValue>;

#[inline]
pub fn field_table<K, V, I>(items: I) -> FieldTable
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    items.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Why a message left the broker without being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    NoRoute,
    /// Routed, but every matching queue refused it.
    Filtered,
    Expired,
    Purged,
    QueueDeleted,
    /// Dead-lettered with no alternate exchange to take it.
    NoAlternateExchange,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::NoRoute => "no_route",
            DropReason::Filtered => "filtered",
            DropReason::Expired => "expired",
            DropReason::Purged => "purged",
            DropReason::QueueDeleted => "queue_deleted",
            DropReason::NoAlternateExchange => "no_alternate_exchange",
        };
        f.write_str(s)
    }
}
