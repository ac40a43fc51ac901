use ramqp_utils::NodeId;

/// Overrides supplied by the embedding process, applied on top of file and
/// environment configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded last.
    pub cfg_name: Option<String>,
    pub node_id: Option<NodeId>,
    pub vhost_name: Option<String>,
}
