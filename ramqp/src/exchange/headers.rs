use std::collections::BTreeSet;

use parking_lot::RwLock;

use super::{ExchangeRouter, ExchangeType, RoutableMessage, HEADERS};
use crate::binding::BindingKey;
use crate::types::{FieldTable, FieldValue, QueueName, X_MATCH};

pub struct HeadersExchangeType;

impl ExchangeType for HeadersExchangeType {
    fn name(&self) -> &'static str {
        HEADERS
    }

    fn new_router(&self) -> Box<dyn ExchangeRouter> {
        Box::<HeadersRouter>::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    All,
    Any,
}

/// Predicate of one headers binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersMatcher {
    mode: MatchMode,
    required: FieldTable,
}

impl HeadersMatcher {
    /// `x-match` selects the mode, other `x-` arguments take no part in matching.
    pub fn new(args: &FieldTable) -> Self {
        let mode = match args.get(X_MATCH).and_then(|v| v.as_str()) {
            Some(m) if m.eq_ignore_ascii_case("any") => MatchMode::Any,
            _ => MatchMode::All,
        };
        let required = args.iter().filter(|(k, _)| !k.starts_with("x-")).map(|(k, v)| (k.clone(), v.clone())).collect();
        Self { mode, required }
    }

    #[inline]
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn matches(&self, headers: &FieldTable) -> bool {
        let hit = |(k, v): (&String, &FieldValue)| match (v, headers.get(k)) {
            (_, None) => false,
            (FieldValue::Void, Some(_)) => true,
            (v, Some(actual)) => v == actual,
        };
        match self.mode {
            MatchMode::All => self.required.iter().all(hit),
            MatchMode::Any => self.required.iter().any(hit),
        }
    }
}

#[derive(Default)]
struct HeadersRouter {
    bindings: RwLock<Vec<(BindingKey, HeadersMatcher)>>,
}

impl ExchangeRouter for HeadersRouter {
    fn add_binding(&self, key: &BindingKey) {
        self.bindings.write().push((key.clone(), HeadersMatcher::new(&key.args)));
    }

    fn remove_binding(&self, key: &BindingKey) {
        let mut bindings = self.bindings.write();
        if let Some(pos) = bindings.iter().position(|(k, _)| k == key) {
            bindings.remove(pos);
        }
    }

    fn route(&self, message: &RoutableMessage<'_>) -> BTreeSet<QueueName> {
        self.bindings
            .read()
            .iter()
            .filter(|(_, m)| m.matches(message.headers))
            .map(|(k, _)| k.queue.clone())
            .collect()
    }

    fn binding_count(&self) -> usize {
        self.bindings.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field_table;

    fn args(mode: &str) -> FieldTable {
        let mut args = field_table([("format", "pdf"), ("type", "report"), ("x-ignored", "zzz")]);
        args.insert(X_MATCH.into(), mode.into());
        args
    }

    #[test]
    fn match_all() {
        let m = HeadersMatcher::new(&args("all"));
        assert_eq!(m.mode(), MatchMode::All);
        assert!(m.matches(&field_table([("format", "pdf"), ("type", "report")])));
        assert!(m.matches(&field_table([("format", "pdf"), ("type", "report"), ("extra", "1")])));
        //one required header missing
        assert!(!m.matches(&field_table([("format", "pdf")])));
        assert!(!m.matches(&field_table([("format", "pdf"), ("type", "invoice")])));
    }

    #[test]
    fn match_any_and_presence() {
        let m = HeadersMatcher::new(&args("any"));
        assert!(m.matches(&field_table([("type", "report")])));
        assert!(!m.matches(&field_table([("x-ignored", "zzz")])));

        let mut a = FieldTable::new();
        a.insert("flag".into(), FieldValue::Void);
        let m = HeadersMatcher::new(&a);
        assert!(m.matches(&field_table([("flag", 7i64)])));
        assert!(!m.matches(&FieldTable::new()));

        //no x-match argument means all, and no requirements match everything
        assert!(HeadersMatcher::new(&FieldTable::new()).matches(&FieldTable::new()));
    }

    #[test]
    fn router_all() {
        let router = HeadersExchangeType.new_router();
        let key = BindingKey::new("amq.match", "q", "", args("all"));
        router.add_binding(&key);

        let missing = field_table([("format", "pdf")]);
        assert!(router.route(&RoutableMessage { routing_key: "", headers: &missing }).is_empty());

        let full = field_table([("format", "pdf"), ("type", "report")]);
        let routed = router.route(&RoutableMessage { routing_key: "", headers: &full });
        assert_eq!(routed.into_iter().collect::<Vec<_>>(), vec![QueueName::from("q")]);

        router.remove_binding(&key);
        assert_eq!(router.binding_count(), 0);
    }
}
