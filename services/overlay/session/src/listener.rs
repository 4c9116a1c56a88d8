//! Connection setup listeners.

use crate::setup::ConnectionSetup;
use crate::state::{ConnectionSetupState, DisconnectReason};
use tracing::{info, warn};

/// Receives state changes of connection setups.
///
/// Callbacks run on the setup's driver task in event order; implementations
/// must not block.
pub trait ConnectionSetupListener: Send + Sync {
    /// The setup moved from `old` to `new`
    fn on_state_changed(
        &self,
        setup: &ConnectionSetup,
        old: ConnectionSetupState,
        new: ConnectionSetupState,
    );

    /// A connect attempt failed
    fn on_connection_attempt_failed(
        &self,
        _setup: &ConnectionSetup,
        _first_failure: bool,
        _will_auto_retry: bool,
    ) {
    }

    /// An established connection was closed
    fn on_connection_closed(
        &self,
        _setup: &ConnectionSetup,
        _reason: DisconnectReason,
        _will_auto_retry: bool,
    ) {
    }
}

/// Listener that reports connection changes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSetupListener;

impl ConnectionSetupListener for LoggingSetupListener {
    fn on_state_changed(
        &self,
        setup: &ConnectionSetup,
        old: ConnectionSetupState,
        new: ConnectionSetupState,
    ) {
        info!(
            "Connection {} ({}): {} -> {}",
            setup.display_name(),
            setup.contact_point(),
            old,
            new
        );
    }

    fn on_connection_attempt_failed(
        &self,
        setup: &ConnectionSetup,
        first_failure: bool,
        will_auto_retry: bool,
    ) {
        // repeated failures are already logged by the state machine
        if first_failure {
            warn!(
                "Could not connect to {} ({}){}",
                setup.display_name(),
                setup.contact_point(),
                if will_auto_retry {
                    ", will retry automatically"
                } else {
                    ""
                }
            );
        }
    }

    fn on_connection_closed(
        &self,
        setup: &ConnectionSetup,
        reason: DisconnectReason,
        will_auto_retry: bool,
    ) {
        info!(
            "Connection {} closed: {}{}",
            setup.display_name(),
            reason,
            if will_auto_retry {
                ", will reconnect automatically"
            } else {
                ""
            }
        );
    }
}
