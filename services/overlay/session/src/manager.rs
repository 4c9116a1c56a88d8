//! Connection setup registry
//!
//! The [`ConnectionSetupService`] creates connection setups, starts those
//! marked for startup, and routes channel-closed notifications from the
//! channel service to the setup that owns the channel.

use crate::channel::{ChannelHandle, MessageChannelLifecycleListener, MessageChannelService};
use crate::contact_point::NetworkContactPoint;
use crate::error::SessionError;
use crate::listener::ConnectionSetupListener;
use crate::setup::ConnectionSetup;
use crate::state::ConnectionSetupState;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

type SetupRegistry = DashMap<u64, ConnectionSetup>;

/// Creates and tracks connection setups
pub struct ConnectionSetupService {
    channel_service: Arc<dyn MessageChannelService>,
    listener: Arc<dyn ConnectionSetupListener>,
    setups: Arc<SetupRegistry>,
    next_id: AtomicU64,
}

impl ConnectionSetupService {
    /// Create the service and register it for channel lifecycle callbacks
    pub fn new(
        channel_service: Arc<dyn MessageChannelService>,
        listener: Arc<dyn ConnectionSetupListener>,
    ) -> Self {
        let setups: Arc<SetupRegistry> = Arc::new(DashMap::new());
        channel_service.add_lifecycle_listener(Arc::new(ChannelClosedRouter {
            setups: Arc::downgrade(&setups),
        }));
        Self {
            channel_service,
            listener,
            setups,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new connection setup in DISCONNECTED
    pub fn create_connection_setup(
        &self,
        contact_point: NetworkContactPoint,
        display_name: Option<String>,
        connect_on_startup: bool,
    ) -> ConnectionSetup {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let display_name = display_name.unwrap_or_else(|| contact_point.address());
        let setup = ConnectionSetup::new(
            id,
            contact_point,
            display_name,
            connect_on_startup,
            self.channel_service.clone(),
            self.listener.clone(),
        );
        info!("Created connection setup {}: {}", id, setup);
        self.setups.insert(id, setup.clone());
        setup
    }

    /// Parse a contact point definition and create a setup for it
    pub fn create_connection_setup_from_definition(
        &self,
        definition: &str,
        display_name: Option<String>,
        connect_on_startup: bool,
    ) -> Result<ConnectionSetup, SessionError> {
        let contact_point: NetworkContactPoint = definition.parse()?;
        Ok(self.create_connection_setup(contact_point, display_name, connect_on_startup))
    }

    /// Look up a setup by id
    pub fn get(&self, id: u64) -> Option<ConnectionSetup> {
        self.setups.get(&id).map(|entry| entry.value().clone())
    }

    /// All setups, ordered by id
    pub fn all(&self) -> Vec<ConnectionSetup> {
        let mut setups: Vec<ConnectionSetup> =
            self.setups.iter().map(|entry| entry.value().clone()).collect();
        setups.sort_by_key(|s| s.id());
        setups
    }

    /// Number of registered setups
    pub fn len(&self) -> usize {
        self.setups.len()
    }

    /// Whether no setups are registered
    pub fn is_empty(&self) -> bool {
        self.setups.is_empty()
    }

    /// Signal start intent to every setup flagged `connect_on_startup`
    pub fn start_on_startup(&self) -> usize {
        let mut started = 0;
        for setup in self.all() {
            if setup.connect_on_startup() {
                debug!("Starting connection {} on startup", setup.display_name());
                setup.signal_start_intent();
                started += 1;
            }
        }
        started
    }

    /// Signal stop intent to every setup
    pub fn stop_all(&self) {
        for setup in self.all() {
            setup.signal_stop_intent();
        }
    }

    /// Wait until every setup is DISCONNECTED
    pub async fn await_all_disconnected(&self, timeout: Duration) -> Result<(), SessionError> {
        let setups = self.all();
        let results = join_all(
            setups
                .iter()
                .map(|s| s.await_state(ConnectionSetupState::Disconnected, timeout)),
        )
        .await;

        let mut first_error = None;
        for (setup, result) in setups.iter().zip(results) {
            if let Err(e) = result {
                warn!("Connection {} did not shut down: {}", setup.display_name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop and unregister a setup
    pub fn dispose(&self, id: u64) -> Option<ConnectionSetup> {
        let (_, setup) = self.setups.remove(&id)?;
        setup.signal_stop_intent();
        info!("Disposed connection setup {}: {}", id, setup.display_name());
        Some(setup)
    }

    /// Forward a channel-closed notification to the setup owning the channel
    pub fn on_channel_closed(&self, channel: &ChannelHandle) {
        route_channel_closed(&self.setups, channel);
    }
}

fn route_channel_closed(setups: &SetupRegistry, channel: &ChannelHandle) {
    let owner = setups
        .iter()
        .find(|entry| entry.value().current_channel_id().as_deref() == Some(channel.channel_id()))
        .map(|entry| entry.value().clone());
    match owner {
        Some(setup) => setup.on_message_channel_closed(channel.as_ref()),
        None => debug!(
            "Channel {} closed without an owning connection setup",
            channel.channel_id()
        ),
    }
}

/// Lifecycle listener registered with the channel service
struct ChannelClosedRouter {
    setups: Weak<SetupRegistry>,
}

impl MessageChannelLifecycleListener for ChannelClosedRouter {
    fn on_outgoing_channel_terminated(&self, channel: &ChannelHandle) {
        if let Some(setups) = self.setups.upgrade() {
            route_channel_closed(&setups, channel);
        }
    }
}
