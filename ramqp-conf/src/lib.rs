#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::{Config, File};
use serde::Deserialize;

use ramqp_utils::*;

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub vhost: VirtualHost,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub consumer: Consumer,
    #[serde(default)]
    pub acl: Acl,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/ramqp/ramqp").required(false))
            .add_source(File::with_name("ramqp").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("ramqp").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Embedding process overrides file configuration
        if let Some(id) = opts.node_id {
            inner.node.id = id;
        }
        if let Some(name) = opts.vhost_name.as_ref() {
            inner.vhost.name.clone_from(name);
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node_id is {}", self.node.id);
        log::info!("vhost is {}", self.vhost.name);
        log::info!("queue config is: {:?}", self.queue);
        log::info!("consumer config is: {:?}", self.consumer);
        log::info!("acl default permission is {:?}, rules: {}", self.acl.default_permission, self.acl.rules.len());
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: NodeId,
    #[serde(default = "Node::name_default")]
    pub name: String,
}

impl Default for Node {
    fn default() -> Self {
        Self { id: 0, name: Self::name_default() }
    }
}

impl Node {
    fn name_default() -> String {
        "ramqp".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualHost {
    #[serde(default = "VirtualHost::name_default")]
    pub name: String,
    //Interval of the expired-entry sweep.
    #[serde(default = "VirtualHost::housekeeping_interval_default", deserialize_with = "deserialize_duration")]
    pub housekeeping_interval: Duration,
}

impl Default for VirtualHost {
    fn default() -> Self {
        Self { name: Self::name_default(), housekeeping_interval: Self::housekeeping_interval_default() }
    }
}

impl VirtualHost {
    fn name_default() -> String {
        "default".into()
    }
    fn housekeeping_interval_default() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Queue {
    //Priority levels for new queues, 1 means a plain FIFO list.
    #[serde(default = "Queue::priorities_default")]
    pub priorities: u8,
    //Deliveries before an entry is dead-lettered, 0 disables the limit.
    #[serde(default)]
    pub max_delivery_count: u32,
    #[serde(default, deserialize_with = "deserialize_limit")]
    pub max_messages: Option<u32>,
}

impl Default for Queue {
    fn default() -> Self {
        Self { priorities: Self::priorities_default(), max_delivery_count: 0, max_messages: None }
    }
}

impl Queue {
    fn priorities_default() -> u8 {
        1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowMode {
    #[default]
    Credit,
    Window,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Consumer {
    //Initial message credit, unlimited when absent.
    #[serde(default, deserialize_with = "deserialize_limit")]
    pub credit: Option<u32>,
    //Initial byte credit, unlimited when absent.
    #[serde(default)]
    pub credit_bytes: Option<Bytesize>,
    #[serde(default)]
    pub flow_mode: FlowMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    All,
    Bind,
    Unbind,
    Create,
    Delete,
    Publish,
    Consume,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    pub permission: Permission,
    pub action: Action,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    //Topic-style pattern, `*` one word, `#` any number of words.
    #[serde(default)]
    pub routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub default_permission: Permission,
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.node.id, 0);
        assert_eq!(settings.vhost.name, "default");
        assert_eq!(settings.vhost.housekeeping_interval, Duration::from_secs(30));
        assert_eq!(settings.queue.priorities, 1);
        assert_eq!(settings.queue.max_messages, None);
        assert_eq!(settings.consumer.flow_mode, FlowMode::Credit);
        assert_eq!(settings.acl.default_permission, Permission::Allow);
    }

    #[test]
    fn test_node_id_override() {
        for (node_id, expected) in [(Some(3), 3), (None, 0)] {
            let opts = Options { node_id, ..Default::default() };
            let settings = Settings::new(opts).expect("Settings creation failed");
            assert_eq!(settings.node.id, expected);
        }
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("ramqp-conf-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[vhost]
name = "test"
housekeeping_interval = "5s"

[queue]
priorities = 10
max_delivery_count = 3
max_messages = "unlimited"

[consumer]
credit = 100
credit_bytes = "64K"
flow_mode = "window"

[acl]
default_permission = "deny"

[[acl.rules]]
permission = "allow"
action = "publish"
exchange = "amq.topic"
routing_key = "stock.#"
"#,
        )
        .expect("write config");

        let opts = Options { cfg_name: Some(path.to_string_lossy().into_owned()), ..Default::default() };
        let settings = Settings::new(opts).expect("Settings creation failed");
        let _ = std::fs::remove_file(&path);

        assert_eq!(settings.vhost.name, "test");
        assert_eq!(settings.vhost.housekeeping_interval, Duration::from_secs(5));
        assert_eq!(settings.queue.priorities, 10);
        assert_eq!(settings.queue.max_delivery_count, 3);
        assert_eq!(settings.consumer.credit, Some(100));
        assert_eq!(settings.consumer.credit_bytes, Some(Bytesize(64 * 1024)));
        assert_eq!(settings.consumer.flow_mode, FlowMode::Window);
        assert_eq!(settings.acl.default_permission, Permission::Deny);
        assert_eq!(settings.acl.rules.len(), 1);
        assert_eq!(settings.acl.rules[0].action, Action::Publish);
        assert_eq!(settings.acl.rules[0].routing_key.as_deref(), Some("stock.#"));
    }
}
