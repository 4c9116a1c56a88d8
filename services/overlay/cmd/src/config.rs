//! Configuration handling for the overlay node.
//!
//! Settings are read from a YAML file and can be overridden through
//! environment variables and command line flags.

use anyhow::{Context, Result};
use overlay_session::NetworkContactPoint;
use overlay_topology::{NetworkGraph, NodeId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Overlay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Node id announced in handshakes
    pub node_id: String,
    /// Listen address for inbound connections, e.g. 0.0.0.0:21000
    pub listen: Option<String>,
    /// Outbound connections
    pub connections: Vec<ConnectionConfig>,
    /// Static topology snapshot used for routing
    pub topology: TopologyConfig,
    /// Default wait for connection state changes, e.g. "10s"
    pub await_timeout: String,
}

/// One outbound connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Contact point definition, e.g. `relay:21000(autoRetryInitialDelay=10)`
    pub contact_point: NetworkContactPoint,
    /// Name shown in logs
    #[serde(default)]
    pub display_name: Option<String>,
    /// Whether to connect when the node starts
    #[serde(default = "default_connect_on_startup")]
    pub connect_on_startup: bool,
}

/// Static topology description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Directed links between nodes
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// One directed link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Link id, unique within the topology
    pub id: String,
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
}

fn default_connect_on_startup() -> bool {
    true
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            node_id: "overlay-node".to_string(),
            listen: None,
            connections: Vec::new(),
            topology: TopologyConfig::default(),
            await_timeout: "10s".to_string(),
        }
    }
}

impl OverlayConfig {
    /// Load configuration from file and environment variables. A missing or
    /// unparsable file falls back to defaults.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<OverlayConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final overlay configuration: node_id={}, listen={:?}, connections={}, topology links={}",
            config.node_id,
            config.listen,
            config.connections.len(),
            config.topology.links.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("OVERLAY_NODE_ID") {
            if !node_id.is_empty() {
                info!("Node ID overridden by environment: {}", node_id);
                self.node_id = node_id;
            }
        }

        if let Ok(listen) = std::env::var("OVERLAY_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = if listen.is_empty() { None } else { Some(listen) };
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        self.await_timeout()?;
        Ok(())
    }

    /// Parsed `await_timeout`
    pub fn await_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.await_timeout)
            .with_context(|| format!("invalid await_timeout '{}'", self.await_timeout))
    }

    /// Wait for connections to close on shutdown. An explicit override wins
    /// over `await_timeout`.
    pub fn shutdown_timeout(&self, override_timeout: Option<Duration>) -> Result<Duration> {
        match override_timeout {
            Some(timeout) => Ok(timeout),
            None => self.await_timeout(),
        }
    }

    /// Build the static topology graph rooted at this node
    pub fn static_topology(&self) -> Result<NetworkGraph> {
        let graph = NetworkGraph::new(NodeId::new(self.node_id.clone()));
        for link in &self.topology.links {
            graph
                .add_link(
                    link.id.clone(),
                    NodeId::new(link.source.clone()),
                    NodeId::new(link.target.clone()),
                )
                .with_context(|| format!("invalid topology link '{}'", link.id))?;
        }
        Ok(graph)
    }
}
