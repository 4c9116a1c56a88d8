//! Session error types.

use crate::state::ConnectionSetupState;
use overlay_wire::{ProtocolError, ProtocolErrorType};
use std::time::Duration;
use thiserror::Error;

/// Failures of connection setup and message channels
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport-level connect failure
    #[error("failed to connect to {target}: {reason}")]
    Connect {
        /// Contact point or address that was dialed
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Peer violated the protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer refused the connection with an error goodbye
    #[error("connection refused by remote side: {message}")]
    Refused {
        /// Error classification, if the peer sent a known code
        error_type: Option<ProtocolErrorType>,
        /// Peer's error message
        message: String,
    },

    /// A connection setup did not reach the awaited state in time
    #[error("connection did not reach state {expected} within {timeout:?} (current state: {actual})")]
    Timeout {
        /// Awaited state
        expected: ConnectionSetupState,
        /// State when the wait ended
        actual: ConnectionSetupState,
        /// Wait duration
        timeout: Duration,
    },

    /// The handshake did not complete in time
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// The message channel is no longer usable
    #[error("message channel {0} is closed")]
    ChannelClosed(String),

    /// Contact point definition could not be parsed
    #[error("invalid contact point definition '{0}'")]
    InvalidContactPoint(String),

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
