use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::acl::{AclSecurityManager, SecurityManager};
use crate::conf::Settings;
use crate::exchange::{ExchangeFactory, ExchangeType};
use crate::hook::{DefaultHookManager, HookManager};
use crate::stats::Stats;
use crate::types::NodeId;
use crate::Result;

/// Everything a broker instance shares between its virtual hosts. Cloning is cheap.
#[derive(Clone)]
pub struct BrokerContext {
    inner: Arc<BrokerContextInner>,
}

pub struct BrokerContextInner {
    pub settings: Settings,
    pub node_id: NodeId,
    pub exchange_factory: ExchangeFactory,
    pub security: Arc<dyn SecurityManager>,
    pub hooks: Arc<dyn HookManager>,
    pub stats: Stats,
}

impl Deref for BrokerContext {
    type Target = BrokerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl BrokerContext {
    /// Context with the built-in exchange types, the configured ACL and the default hook manager.
    pub fn new(settings: Settings) -> Self {
        settings.logs();
        let security = Arc::new(AclSecurityManager::new(settings.acl.clone()));
        let node_id = settings.node.id;
        BrokerContext {
            inner: Arc::new(BrokerContextInner {
                settings,
                node_id,
                exchange_factory: ExchangeFactory::default(),
                security,
                hooks: Arc::new(DefaultHookManager::new()),
                stats: Stats::new(),
            }),
        }
    }

    #[inline]
    pub fn builder(settings: Settings) -> BrokerContextBuilder {
        BrokerContextBuilder::new(settings)
    }
}

impl Default for BrokerContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BrokerContext {{ node_id: {} }}", self.node_id)?;
        Ok(())
    }
}

pub struct BrokerContextBuilder {
    settings: Settings,
    exchange_types: Option<Vec<Arc<dyn ExchangeType>>>,
    security: Option<Arc<dyn SecurityManager>>,
    hooks: Option<Arc<dyn HookManager>>,
}

impl BrokerContextBuilder {
    fn new(settings: Settings) -> Self {
        Self { settings, exchange_types: None, security: None, hooks: None }
    }

    /// Replaces the built-in exchange types, the four base types must be among them.
    pub fn exchange_types(mut self, types: Vec<Arc<dyn ExchangeType>>) -> Self {
        self.exchange_types = Some(types);
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn HookManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<BrokerContext> {
        self.settings.logs();
        let exchange_factory = match self.exchange_types {
            Some(types) => ExchangeFactory::new(types)?,
            None => ExchangeFactory::default(),
        };
        let security = self.security.unwrap_or_else(|| Arc::new(AclSecurityManager::new(self.settings.acl.clone())));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(DefaultHookManager::new()));
        let node_id = self.settings.node.id;
        Ok(BrokerContext {
            inner: Arc::new(BrokerContextInner {
                settings: self.settings,
                node_id,
                exchange_factory,
                security,
                hooks,
                stats: Stats::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AllowAll;
    use crate::exchange::{DirectExchangeType, BASE_TYPES};

    #[test]
    fn builder_validates_exchange_types() {
        let ctx = BrokerContext::builder(Settings::default()).security(Arc::new(AllowAll)).build().unwrap();
        assert!(BASE_TYPES.iter().all(|t| ctx.exchange_factory.get(t).is_some()));
        assert!(ctx.security.authorise_consume("q"));

        let types: Vec<Arc<dyn ExchangeType>> = vec![Arc::new(DirectExchangeType)];
        assert!(BrokerContext::builder(Settings::default()).exchange_types(types).build().is_err());
        assert_eq!(BrokerContext::default().node_id, Settings::default().node.id);
    }
}
