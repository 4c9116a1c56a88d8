//! Connection lifecycle management for the overlay network.
//!
//! This crate keeps outbound logical connections to remote nodes alive. A
//! [`ConnectionSetup`] drives one connection through its lifecycle and
//! reconnects with exponential backoff when the contact point enables
//! auto-retry; the [`ConnectionSetupService`] manages all setups of a node.
//! Live connections are represented by [`MessageChannel`]s created by a
//! [`MessageChannelService`], for example the TCP based
//! [`TcpChannelService`].
//!
//! ## Lifecycle
//!
//! ```text
//!                 start                  success
//!  DISCONNECTED ---------> CONNECTING -------------> CONNECTED
//!    ^   |  ^                |   ^                    |     |
//!    |   |  |     failure    |   | retry timer   stop |     | broken /
//!    |   |  +----------------+   |                    v     | remote close
//!    |   |                       |             DISCONNECTING|
//!    |   +---> WAITING_TO_RECONNECT                   |     |
//!    |              |                                 |     |
//!    +--------------+---------------------------------+-----+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use overlay_session::{
//!     ConnectionSetupService, ConnectionSetupState, LoggingSetupListener, TcpChannelService,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), overlay_session::SessionError> {
//! let channels = Arc::new(TcpChannelService::new("node-a"));
//! let service = ConnectionSetupService::new(channels, Arc::new(LoggingSetupListener));
//!
//! let setup = service.create_connection_setup_from_definition(
//!     "relay.example.org:21000(autoRetryInitialDelay=10, autoRetryDelayMultiplier=1.5)",
//!     Some("relay".to_string()),
//!     true,
//! )?;
//! service.start_on_startup();
//! setup
//!     .await_state(ConnectionSetupState::Connected, Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod contact_point;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod listener;
pub mod manager;
pub mod retry;
pub mod setup;
pub mod state;
pub mod transport;

// Re-export main types
pub use channel::{
    ChannelBlockSender, ChannelHandle, MessageChannel, MessageChannelLifecycleListener,
    MessageChannelService, MessageChannelState,
};
pub use contact_point::NetworkContactPoint;
pub use error::SessionError;
pub use handshake::{accept_handshake, initiate_handshake, HandshakeOutcome};
pub use keepalive::{
    HeartbeatTracker, KeepaliveAction, KeepaliveConfig, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_MISSED_HEARTBEATS,
};
pub use listener::{ConnectionSetupListener, LoggingSetupListener};
pub use manager::ConnectionSetupService;
pub use retry::{AutoRetryPolicy, MIN_INITIAL_DELAY};
pub use setup::{ConnectionSetup, STATE_POLL_INTERVAL};
pub use state::{ConnectionSetupState, DisconnectReason, Effect, SetupCore, SetupEvent};
pub use transport::{listen_tcp, TcpChannelService, TcpMessageChannel, DEFAULT_HANDSHAKE_TIMEOUT};
