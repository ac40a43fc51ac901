//! Access control for broker operations.
//!
//! Every protocol operation that creates, deletes, binds, publishes or consumes is
//! checked through a [`SecurityManager`] before any state changes. The default
//! implementation, [`AclSecurityManager`], walks an ordered rule list from the
//! `acl` settings section; the first rule that matches decides, otherwise the
//! configured default permission applies.

use crate::conf::{Acl, AclRule, Action, Permission};
use crate::exchange::TopicPattern;

pub trait SecurityManager: Send + Sync {
    fn authorise_bind(&self, exchange: &str, queue: &str, routing_key: &str) -> bool;

    fn authorise_unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> bool;

    fn authorise_create_exchange(&self, exchange: &str, type_name: &str) -> bool;

    fn authorise_create_queue(&self, queue: &str) -> bool;

    /// Deleting an exchange (`queue` is `None`) or a queue (`exchange` is `None`).
    fn authorise_delete(&self, exchange: Option<&str>, queue: Option<&str>) -> bool;

    fn authorise_publish(&self, exchange: &str, routing_key: &str) -> bool;

    fn authorise_consume(&self, queue: &str) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityManager for AllowAll {
    fn authorise_bind(&self, _: &str, _: &str, _: &str) -> bool {
        true
    }

    fn authorise_unbind(&self, _: &str, _: &str, _: &str) -> bool {
        true
    }

    fn authorise_create_exchange(&self, _: &str, _: &str) -> bool {
        true
    }

    fn authorise_create_queue(&self, _: &str) -> bool {
        true
    }

    fn authorise_delete(&self, _: Option<&str>, _: Option<&str>) -> bool {
        true
    }

    fn authorise_publish(&self, _: &str, _: &str) -> bool {
        true
    }

    fn authorise_consume(&self, _: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Request<'a> {
    exchange: Option<&'a str>,
    queue: Option<&'a str>,
    routing_key: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct Rule {
    permission: Permission,
    action: Action,
    exchange: Option<String>,
    queue: Option<String>,
    routing_key: Option<TopicPattern>,
}

impl From<&AclRule> for Rule {
    fn from(r: &AclRule) -> Self {
        Rule {
            permission: r.permission,
            action: r.action,
            exchange: r.exchange.clone(),
            queue: r.queue.clone(),
            routing_key: r.routing_key.as_deref().map(TopicPattern::parse),
        }
    }
}

impl Rule {
    fn matches(&self, action: Action, req: &Request) -> bool {
        if self.action != Action::All && self.action != action {
            return false;
        }
        let field = |want: &Option<String>, got: Option<&str>| match (want, got) {
            (None, _) => true,
            (Some(w), Some(g)) => w == g,
            (Some(_), None) => false,
        };
        field(&self.exchange, req.exchange)
            && field(&self.queue, req.queue)
            && match (&self.routing_key, req.routing_key) {
                (None, _) => true,
                (Some(p), Some(k)) => p.matches_str(k),
                (Some(_), None) => false,
            }
    }
}

pub struct AclSecurityManager {
    default_permission: Permission,
    rules: Vec<Rule>,
}

impl AclSecurityManager {
    pub fn new(acl: Acl) -> Self {
        let rules = acl.rules.iter().map(Rule::from).collect();
        Self { default_permission: acl.default_permission, rules }
    }

    fn check(&self, action: Action, req: Request) -> bool {
        let permission = self
            .rules
            .iter()
            .find(|r| r.matches(action, &req))
            .map(|r| r.permission)
            .unwrap_or(self.default_permission);
        if permission == Permission::Deny {
            log::debug!("acl denied {:?} {:?}", action, req);
        }
        permission == Permission::Allow
    }
}

impl SecurityManager for AclSecurityManager {
    fn authorise_bind(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.check(
            Action::Bind,
            Request { exchange: Some(exchange), queue: Some(queue), routing_key: Some(routing_key) },
        )
    }

    fn authorise_unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.check(
            Action::Unbind,
            Request { exchange: Some(exchange), queue: Some(queue), routing_key: Some(routing_key) },
        )
    }

    fn authorise_create_exchange(&self, exchange: &str, _type_name: &str) -> bool {
        self.check(Action::Create, Request { exchange: Some(exchange), ..Default::default() })
    }

    fn authorise_create_queue(&self, queue: &str) -> bool {
        self.check(Action::Create, Request { queue: Some(queue), ..Default::default() })
    }

    fn authorise_delete(&self, exchange: Option<&str>, queue: Option<&str>) -> bool {
        self.check(Action::Delete, Request { exchange, queue, routing_key: None })
    }

    fn authorise_publish(&self, exchange: &str, routing_key: &str) -> bool {
        self.check(Action::Publish, Request { exchange: Some(exchange), routing_key: Some(routing_key), queue: None })
    }

    fn authorise_consume(&self, queue: &str) -> bool {
        self.check(Action::Consume, Request { queue: Some(queue), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(permission: Permission, action: Action) -> AclRule {
        AclRule { permission, action, exchange: None, queue: None, routing_key: None }
    }

    #[test]
    fn first_match_wins() {
        let acl = Acl {
            default_permission: Permission::Allow,
            rules: vec![
                AclRule {
                    exchange: Some("amq.topic".into()),
                    routing_key: Some("secret.#".into()),
                    ..rule(Permission::Deny, Action::Publish)
                },
                AclRule { queue: Some("private".into()), ..rule(Permission::Deny, Action::All) },
                rule(Permission::Allow, Action::All),
            ],
        };
        let m = AclSecurityManager::new(acl);
        assert!(!m.authorise_publish("amq.topic", "secret.plans"));
        assert!(m.authorise_publish("amq.topic", "public.news"));
        assert!(m.authorise_publish("amq.direct", "secret.plans"));

        assert!(!m.authorise_consume("private"));
        assert!(!m.authorise_bind("amq.direct", "private", "k"));
        assert!(m.authorise_bind("amq.direct", "public", "k"));
        assert!(!m.authorise_delete(None, Some("private")));
        assert!(m.authorise_delete(Some("ex"), None));
    }

    #[test]
    fn default_permission() {
        let m = AclSecurityManager::new(Acl {
            default_permission: Permission::Deny,
            rules: vec![AclRule { queue: Some("q".into()), ..rule(Permission::Allow, Action::Create) }],
        });
        assert!(m.authorise_create_queue("q"));
        assert!(!m.authorise_create_queue("other"));
        assert!(!m.authorise_create_exchange("e", "direct"));
        assert!(AllowAll.authorise_unbind("e", "q", "k"));
    }
}
