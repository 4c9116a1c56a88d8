//! Overlay network node binary.
//!
//! Loads the node configuration, builds the routing view of the static
//! topology, accepts inbound TCP channels and keeps the configured outbound
//! connections alive until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use overlay_routing::{Router, RoutingError, RoutingTable};
use overlay_session::{
    listen_tcp, ChannelHandle, ConnectionSetup, ConnectionSetupListener, ConnectionSetupService,
    ConnectionSetupState, DisconnectReason, LoggingSetupListener, TcpChannelService,
};
use overlay_topology::{GraphSnapshot, NetworkGraph, NodeId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::OverlayConfig;
use logging::OverlayLogFormatter;

/// Overlay network node
#[derive(Parser, Debug)]
#[command(name = "overlay-node", version, about = "Overlay network node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "overlay.yaml")]
    config: PathBuf,

    /// Node ID, overrides the configuration
    #[arg(long)]
    node_id: Option<String>,

    /// Listen address, e.g. 0.0.0.0:21000
    #[arg(long)]
    listen: Option<String>,

    /// Contact point to connect to on startup (repeatable),
    /// e.g. "relay:21000(autoRetryInitialDelay=10)"
    #[arg(long)]
    connect: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// How long to wait for connections to close on shutdown, overrides
    /// the configured await timeout
    #[arg(long)]
    shutdown_timeout: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("overlay_node={}", args.log_level).parse()?)
        .add_directive(format!("overlay_session={}", args.log_level).parse()?)
        .add_directive(format!("overlay_routing={}", args.log_level).parse()?)
        .add_directive(format!("overlay_topology={}", args.log_level).parse()?)
        .add_directive(format!("overlay_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(OverlayLogFormatter::new("overlay"))
        .init();

    let mut config = OverlayConfig::load_from_file(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if args.listen.is_some() {
        config.listen = args.listen;
    }
    config.validate()?;
    let shutdown_timeout = config.shutdown_timeout(args.shutdown_timeout.map(Into::into))?;

    info!("Starting overlay node {}", config.node_id);

    let graph = Arc::new(config.static_topology()?);
    let router = Arc::new(RoutingTable::from_snapshot(graph.snapshot())?);
    log_routing(router.as_ref()).await;

    let channels = Arc::new(TcpChannelService::new(config.node_id.clone()));

    if let Some(listen) = &config.listen {
        let listener = listen_tcp(listen)
            .await
            .with_context(|| format!("failed to listen on {}", listen))?;
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(channels.clone().serve(listener, accepted_tx));
        tokio::spawn(drain_inbound(accepted_rx));
    }

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    tokio::spawn(apply_topology_updates(router.clone(), updates_rx));

    let listener = Arc::new(NodeSetupListener {
        logging: LoggingSetupListener,
        graph: graph.clone(),
        updates: updates_tx,
    });
    let setups = ConnectionSetupService::new(channels, listener);

    for connection in &config.connections {
        setups.create_connection_setup(
            connection.contact_point.clone(),
            connection.display_name.clone(),
            connection.connect_on_startup,
        );
    }
    for definition in &args.connect {
        setups
            .create_connection_setup_from_definition(definition, None, true)
            .with_context(|| format!("invalid --connect value '{}'", definition))?;
    }

    let started = setups.start_on_startup();
    info!(
        "Overlay node {} running: {} connection setups, {} started",
        config.node_id,
        setups.len(),
        started
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("Shutdown requested, closing connections");

    setups.stop_all();
    if let Err(e) = setups
        .await_all_disconnected(shutdown_timeout)
        .await
    {
        warn!("Not all connections closed in time: {}", e);
    }

    info!("Overlay node {} stopped", config.node_id);
    Ok(())
}

async fn log_routing(router: &RoutingTable) {
    let routing = router.routing_information().await;
    for (node, link) in routing.next_hop_table() {
        info!(component = "routing", "Next hop to {}: {}", node, link);
    }
    debug!(component = "routing", "Spanning tree:\n{}", routing.spanning_tree());

    let stats = router.get_stats().await;
    info!(
        component = "routing",
        "Routing ready: {} reachable nodes, epoch {}",
        stats.reachable_nodes,
        stats.topology_epoch
    );
}

/// Applies topology snapshots one at a time in the order they were taken
async fn apply_topology_updates(
    router: Arc<RoutingTable>,
    mut updates: mpsc::UnboundedReceiver<Arc<GraphSnapshot>>,
) {
    while let Some(snapshot) = updates.recv().await {
        match router.update_topology(snapshot).await {
            Ok(()) => log_routing(router.as_ref()).await,
            Err(e @ RoutingError::StaleSnapshot { .. }) => {
                debug!(component = "routing", "Topology update skipped: {}", e)
            }
            Err(e) => warn!(component = "routing", "Topology update rejected: {}", e),
        }
    }
}

/// Logs frames arriving on inbound channels until each channel closes
async fn drain_inbound(mut accepted: mpsc::UnboundedReceiver<ChannelHandle>) {
    while let Some(channel) = accepted.recv().await {
        info!(
            "Accepted channel {} from {}",
            channel.channel_id(),
            channel.remote_node_id()
        );
        let Some(mut incoming) = channel.take_incoming() else {
            continue;
        };
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                debug!(
                    "Channel {} sub-channel {}: {:?} ({} bytes)",
                    channel.channel_id(),
                    frame.channel_id,
                    frame.block.message_type(),
                    frame.block.len()
                );
            }
            info!(
                "Channel {} from {} closed",
                channel.channel_id(),
                channel.remote_node_id()
            );
        });
    }
}

/// Logs lifecycle changes and mirrors connected setups into the topology
struct NodeSetupListener {
    logging: LoggingSetupListener,
    graph: Arc<NetworkGraph>,
    updates: mpsc::UnboundedSender<Arc<GraphSnapshot>>,
}

impl NodeSetupListener {
    fn link_id(setup: &ConnectionSetup) -> String {
        format!("setup-{}", setup.id())
    }

    fn publish(&self) {
        if self.updates.send(self.graph.snapshot()).is_err() {
            warn!(component = "routing", "Topology updater stopped, dropping update");
        }
    }
}

impl ConnectionSetupListener for NodeSetupListener {
    fn on_state_changed(
        &self,
        setup: &ConnectionSetup,
        old: ConnectionSetupState,
        new: ConnectionSetupState,
    ) {
        self.logging.on_state_changed(setup, old, new);

        if new == ConnectionSetupState::Connected {
            let Some(channel) = setup.current_channel() else {
                return;
            };
            let remote = NodeId::new(channel.remote_node_id());
            let local = self.graph.local_node().clone();
            if let Err(e) = self.graph.add_link(Self::link_id(setup), local, remote) {
                warn!(component = "routing", "Could not add link for {}: {}", setup, e);
                return;
            }
            self.publish();
        } else if old == ConnectionSetupState::Connected
            && self.graph.remove_link(&Self::link_id(setup)).is_some()
        {
            self.publish();
        }
    }

    fn on_connection_attempt_failed(
        &self,
        setup: &ConnectionSetup,
        first_failure: bool,
        will_auto_retry: bool,
    ) {
        self.logging
            .on_connection_attempt_failed(setup, first_failure, will_auto_retry);
    }

    fn on_connection_closed(
        &self,
        setup: &ConnectionSetup,
        reason: DisconnectReason,
        will_auto_retry: bool,
    ) {
        self.logging
            .on_connection_closed(setup, reason, will_auto_retry);
    }
}
