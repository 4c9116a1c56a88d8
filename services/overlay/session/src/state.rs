//! Connection setup state machine.
//!
//! [`SetupCore`] is the synchronous heart of a connection setup: it consumes
//! [`SetupEvent`]s one at a time and returns the [`Effect`]s the surrounding
//! driver has to execute (spawning connect attempts, closing channels,
//! arming retry timers and notifying listeners). It never performs I/O.
//!
//! Asynchronous work is fenced with generation counters. Every connect
//! attempt carries an `attempt_id` and every retry timer a `timer_id`; results
//! tagged with a superseded id are discarded.

use crate::channel::{ChannelHandle, MessageChannelState};
use crate::retry::AutoRetryPolicy;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one outbound logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSetupState {
    /// No channel and no pending activity
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// A channel is established
    Connected,
    /// The channel is being closed on local request
    Disconnecting,
    /// Waiting for the auto-retry delay to expire
    WaitingToReconnect,
}

impl ConnectionSetupState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionSetupState) -> bool {
        use ConnectionSetupState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, WaitingToReconnect)
                | (WaitingToReconnect, Connecting)
                | (WaitingToReconnect, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionSetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionSetupState::Disconnected => "DISCONNECTED",
            ConnectionSetupState::Connecting => "CONNECTING",
            ConnectionSetupState::Connected => "CONNECTED",
            ConnectionSetupState::Disconnecting => "DISCONNECTING",
            ConnectionSetupState::WaitingToReconnect => "WAITING_TO_RECONNECT",
        };
        f.write_str(name)
    }
}

/// Why a connection ended up disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Closed on local request
    ActiveShutdown,
    /// The channel broke down
    Error,
    /// The remote side closed the channel
    RemoteShutdown,
    /// A manually started connect attempt failed
    FailedToConnect,
    /// An automatic reconnect attempt failed
    FailedToAutoReconnect,
}

impl DisconnectReason {
    /// Human readable description
    pub fn display_text(self) -> &'static str {
        match self {
            DisconnectReason::ActiveShutdown => "Closed by user",
            DisconnectReason::Error => "Connection error",
            DisconnectReason::RemoteShutdown => "Closed by remote side",
            DisconnectReason::FailedToConnect => "Failed to connect",
            DisconnectReason::FailedToAutoReconnect => "Failed to auto-reconnect",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_text())
    }
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum SetupEvent {
    /// Application wants the connection up
    StartRequested,
    /// Application wants the connection down
    StopRequested,
    /// A connect attempt produced a channel
    ConnectAttemptSuccessful {
        /// Attempt that produced the channel
        attempt_id: u64,
        /// The new channel
        channel: ChannelHandle,
    },
    /// A connect attempt failed
    ConnectAttemptFailed {
        /// Attempt that failed
        attempt_id: u64,
        /// Failure description
        error: String,
    },
    /// A retry timer fired
    AutoRetryDelayExpired {
        /// Timer that fired
        timer_id: u64,
    },
    /// A channel closed after a local close request
    ChannelClosedByOwnRequest {
        /// Channel that closed
        channel_id: String,
    },
    /// A channel broke down
    ChannelBroken {
        /// Channel that broke
        channel_id: String,
    },
    /// The remote side closed a channel
    ChannelClosedByRemote {
        /// Channel that closed
        channel_id: String,
    },
}

/// Work requested by the state machine
#[derive(Debug, Clone)]
pub enum Effect {
    /// Start a connect attempt
    SpawnConnect {
        /// Id to tag the result with
        attempt_id: u64,
        /// Whether this is an automatic reconnect
        auto_retry: bool,
    },
    /// Best-effort cancellation of a connect attempt
    CancelConnect {
        /// Attempt to cancel
        attempt_id: u64,
    },
    /// Close a channel
    Disconnect {
        /// Channel to close
        channel: ChannelHandle,
    },
    /// Arm a retry timer
    ScheduleRetry {
        /// Id to tag the expiry with
        timer_id: u64,
        /// Delay until expiry
        delay: Duration,
    },
    /// Report a state change
    NotifyStateChanged {
        /// Previous state
        old: ConnectionSetupState,
        /// New state
        new: ConnectionSetupState,
    },
    /// Report a failed connect attempt
    NotifyAttemptFailed {
        /// First failure since the last manual start or healthy connection
        first_failure: bool,
        /// Whether a retry has been scheduled
        will_auto_retry: bool,
    },
    /// Report a closed connection
    NotifyConnectionClosed {
        /// Why the connection closed
        reason: DisconnectReason,
        /// Whether a retry has been scheduled
        will_auto_retry: bool,
    },
}

/// Synchronous state machine of one connection setup
#[derive(Debug)]
pub struct SetupCore {
    display_name: String,
    state: ConnectionSetupState,
    policy: Option<AutoRetryPolicy>,
    connection_intended: bool,
    attempt_id: u64,
    timer_id: u64,
    current_attempt_is_auto: bool,
    consecutive_failures: u32,
    current_channel: Option<ChannelHandle>,
    last_channel_id: Option<String>,
    last_disconnect_reason: Option<DisconnectReason>,
}

impl SetupCore {
    /// Create a state machine in DISCONNECTED
    pub fn new(display_name: impl Into<String>, policy: Option<AutoRetryPolicy>) -> Self {
        Self {
            display_name: display_name.into(),
            state: ConnectionSetupState::Disconnected,
            policy,
            connection_intended: false,
            attempt_id: 0,
            timer_id: 0,
            current_attempt_is_auto: false,
            consecutive_failures: 0,
            current_channel: None,
            last_channel_id: None,
            last_disconnect_reason: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionSetupState {
        self.state
    }

    /// Reason of the most recent disconnect, kept until the next connect attempt
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.last_disconnect_reason
    }

    /// Active channel, if connected
    pub fn current_channel(&self) -> Option<&ChannelHandle> {
        self.current_channel.as_ref()
    }

    /// Id of the most recently established channel
    pub fn last_channel_id(&self) -> Option<&str> {
        self.last_channel_id.as_deref()
    }

    /// Consecutive failures since the last manual start or healthy connection
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the application currently wants the connection up
    pub fn is_connection_intended(&self) -> bool {
        self.connection_intended
    }

    /// Auto-retry policy, if enabled
    pub fn policy(&self) -> Option<&AutoRetryPolicy> {
        self.policy.as_ref()
    }

    /// Id of the current connect attempt
    pub fn attempt_id(&self) -> u64 {
        self.attempt_id
    }

    /// Id of the current retry timer
    pub fn timer_id(&self) -> u64 {
        self.timer_id
    }

    /// Process one event
    pub fn handle(&mut self, event: SetupEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            SetupEvent::StartRequested => self.on_start_requested(&mut effects),
            SetupEvent::StopRequested => self.on_stop_requested(&mut effects),
            SetupEvent::ConnectAttemptSuccessful {
                attempt_id,
                channel,
            } => self.on_connect_successful(attempt_id, channel, &mut effects),
            SetupEvent::ConnectAttemptFailed { attempt_id, error } => {
                self.on_connect_failed(attempt_id, &error, &mut effects)
            }
            SetupEvent::AutoRetryDelayExpired { timer_id } => {
                self.on_retry_delay_expired(timer_id, &mut effects)
            }
            SetupEvent::ChannelClosedByOwnRequest { channel_id } => self.on_channel_closed(
                &channel_id,
                DisconnectReason::ActiveShutdown,
                &mut effects,
            ),
            SetupEvent::ChannelBroken { channel_id } => {
                self.on_channel_closed(&channel_id, DisconnectReason::Error, &mut effects)
            }
            SetupEvent::ChannelClosedByRemote { channel_id } => self.on_channel_closed(
                &channel_id,
                DisconnectReason::RemoteShutdown,
                &mut effects,
            ),
        }
        effects
    }

    fn on_start_requested(&mut self, effects: &mut Vec<Effect>) {
        self.connection_intended = true;
        match self.state {
            ConnectionSetupState::Disconnected | ConnectionSetupState::WaitingToReconnect => {
                self.start_connect_attempt(false, effects);
            }
            other => {
                debug!(
                    "Ignoring start request for connection {} in state {}",
                    self.display_name, other
                );
            }
        }
    }

    fn on_stop_requested(&mut self, effects: &mut Vec<Effect>) {
        self.connection_intended = false;
        match self.state {
            ConnectionSetupState::Connected => {
                self.last_disconnect_reason = Some(DisconnectReason::ActiveShutdown);
                if let Some(channel) = self.current_channel.clone() {
                    effects.push(Effect::Disconnect { channel });
                }
                self.transition(ConnectionSetupState::Disconnecting, effects);
            }
            ConnectionSetupState::Connecting => {
                effects.push(Effect::CancelConnect {
                    attempt_id: self.attempt_id,
                });
                self.attempt_id += 1;
                self.last_disconnect_reason = Some(DisconnectReason::ActiveShutdown);
                self.transition(ConnectionSetupState::Disconnected, effects);
            }
            ConnectionSetupState::WaitingToReconnect => {
                self.timer_id += 1;
                self.last_disconnect_reason = Some(DisconnectReason::ActiveShutdown);
                self.transition(ConnectionSetupState::Disconnected, effects);
            }
            other => {
                debug!(
                    "Ignoring stop request for connection {} in state {}",
                    self.display_name, other
                );
            }
        }
    }

    fn on_connect_successful(
        &mut self,
        attempt_id: u64,
        channel: ChannelHandle,
        effects: &mut Vec<Effect>,
    ) {
        if attempt_id != self.attempt_id {
            debug!(
                "Closing channel {} from outdated connect attempt {} of connection {} (current attempt: {})",
                channel.channel_id(),
                attempt_id,
                self.display_name,
                self.attempt_id
            );
            effects.push(Effect::Disconnect { channel });
            return;
        }
        if !self.connection_intended || self.state != ConnectionSetupState::Connecting {
            debug!(
                "Closing channel {} of connection {} as it is no longer wanted (state {})",
                channel.channel_id(),
                self.display_name,
                self.state
            );
            effects.push(Effect::Disconnect { channel });
            return;
        }

        // The channel may have closed before this result was processed; its
        // close notification found no owner then, so apply it here.
        let closed_early = match channel.state() {
            MessageChannelState::Established => None,
            MessageChannelState::MarkedAsBroken => Some(DisconnectReason::Error),
            MessageChannelState::Closed if channel.is_closed_because_remote_closed() => {
                Some(DisconnectReason::RemoteShutdown)
            }
            MessageChannelState::Closed => Some(DisconnectReason::Error),
        };

        let channel_id = channel.channel_id().to_string();
        self.consecutive_failures = 0;
        self.last_channel_id = Some(channel_id.clone());
        self.current_channel = Some(channel);
        self.transition(ConnectionSetupState::Connected, effects);

        if let Some(reason) = closed_early {
            debug!(
                "Channel {} of connection {} closed before it was adopted",
                channel_id, self.display_name
            );
            self.on_channel_closed(&channel_id, reason, effects);
        }
    }

    fn on_connect_failed(&mut self, attempt_id: u64, error: &str, effects: &mut Vec<Effect>) {
        if attempt_id != self.attempt_id || self.state != ConnectionSetupState::Connecting {
            debug!(
                "Ignoring failure of outdated connect attempt {} of connection {}: {}",
                attempt_id, self.display_name, error
            );
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let first_failure = self.consecutive_failures == 1;
        let will_auto_retry = self.connection_intended && self.policy.is_some();

        if self.current_attempt_is_auto {
            info!(
                "Failed to auto-reconnect {} (consecutive failures: {}): {}",
                self.display_name, self.consecutive_failures, error
            );
            self.last_disconnect_reason = Some(DisconnectReason::FailedToAutoReconnect);
        } else {
            warn!("Failed to connect to {}: {}", self.display_name, error);
            self.last_disconnect_reason = Some(DisconnectReason::FailedToConnect);
        }

        effects.push(Effect::NotifyAttemptFailed {
            first_failure,
            will_auto_retry,
        });
        self.transition(ConnectionSetupState::Disconnected, effects);
        if will_auto_retry {
            self.transition(ConnectionSetupState::WaitingToReconnect, effects);
        }
    }

    fn on_retry_delay_expired(&mut self, timer_id: u64, effects: &mut Vec<Effect>) {
        if timer_id != self.timer_id || self.state != ConnectionSetupState::WaitingToReconnect {
            debug!(
                "Ignoring outdated retry timer {} of connection {}",
                timer_id, self.display_name
            );
            return;
        }
        self.start_connect_attempt(true, effects);
    }

    fn on_channel_closed(
        &mut self,
        channel_id: &str,
        reason: DisconnectReason,
        effects: &mut Vec<Effect>,
    ) {
        let is_current = self
            .current_channel
            .as_ref()
            .is_some_and(|c| c.channel_id() == channel_id);
        if !is_current {
            debug!(
                "Ignoring close event for channel {} which is not the active channel of connection {}",
                channel_id, self.display_name
            );
            return;
        }

        // A stop in progress keeps its reason whichever close event arrives first
        let reason = if self.state == ConnectionSetupState::Disconnecting {
            DisconnectReason::ActiveShutdown
        } else {
            reason
        };
        let will_auto_retry = match reason {
            DisconnectReason::ActiveShutdown => false,
            _ => self.connection_intended && self.policy.is_some(),
        };
        match reason {
            DisconnectReason::Error => warn!(
                "Channel {} of connection {} broke down",
                channel_id, self.display_name
            ),
            _ => info!(
                "Channel {} of connection {} closed: {}",
                channel_id, self.display_name, reason
            ),
        }

        self.last_disconnect_reason = Some(reason);
        effects.push(Effect::NotifyConnectionClosed {
            reason,
            will_auto_retry,
        });
        self.transition(ConnectionSetupState::Disconnected, effects);
        if will_auto_retry {
            self.consecutive_failures = 1;
            self.transition(ConnectionSetupState::WaitingToReconnect, effects);
        }
    }

    fn start_connect_attempt(&mut self, auto_retry: bool, effects: &mut Vec<Effect>) {
        if !auto_retry {
            self.consecutive_failures = 0;
        }
        if !self.transition(ConnectionSetupState::Connecting, effects) {
            return;
        }
        self.current_attempt_is_auto = auto_retry;
        self.attempt_id += 1;
        effects.push(Effect::SpawnConnect {
            attempt_id: self.attempt_id,
            auto_retry,
        });
    }

    /// Apply a transition including its entry actions. Illegal transitions are
    /// logged and leave the state untouched.
    fn transition(&mut self, next: ConnectionSetupState, effects: &mut Vec<Effect>) -> bool {
        let old = self.state;
        if !old.can_transition_to(next) {
            error!(
                "Invalid state transition for connection {}: {} -> {}",
                self.display_name, old, next
            );
            return false;
        }

        match next {
            ConnectionSetupState::Connecting => {
                if let Some(stale) = self.current_channel.take() {
                    error!(
                        "Connection {} still referenced channel {} when connecting",
                        self.display_name,
                        stale.channel_id()
                    );
                }
                self.last_disconnect_reason = None;
            }
            ConnectionSetupState::Disconnected => {
                self.current_channel = None;
            }
            ConnectionSetupState::WaitingToReconnect => {
                self.current_channel = None;
                self.timer_id += 1;
                let delay = self
                    .policy
                    .as_ref()
                    .map(|p| p.delay_for(self.consecutive_failures))
                    .unwrap_or_default();
                debug!(
                    "Connection {} will retry in {:?} (consecutive failures: {})",
                    self.display_name, delay, self.consecutive_failures
                );
                effects.push(Effect::ScheduleRetry {
                    timer_id: self.timer_id,
                    delay,
                });
            }
            ConnectionSetupState::Connected | ConnectionSetupState::Disconnecting => {}
        }

        self.state = next;
        debug!(
            "Connection {} changed state: {} -> {}",
            self.display_name, old, next
        );
        effects.push(Effect::NotifyStateChanged { old, new: next });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use std::sync::Arc;
    use ConnectionSetupState::*;

    fn policy() -> Option<AutoRetryPolicy> {
        AutoRetryPolicy::new(Duration::from_secs(5), 2.0, Some(Duration::from_secs(30)))
    }

    fn transitions(effects: &[Effect]) -> Vec<(ConnectionSetupState, ConnectionSetupState)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::NotifyStateChanged { old, new } => Some((*old, *new)),
                _ => None,
            })
            .collect()
    }

    fn spawned_attempt(effects: &[Effect]) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::SpawnConnect { attempt_id, .. } => Some(*attempt_id),
            _ => None,
        })
    }

    fn scheduled(effects: &[Effect]) -> Option<(u64, Duration)> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleRetry { timer_id, delay } => Some((*timer_id, *delay)),
            _ => None,
        })
    }

    fn connected(core: &mut SetupCore, channel_id: &str) -> ChannelHandle {
        let effects = core.handle(SetupEvent::StartRequested);
        let attempt_id = spawned_attempt(&effects).unwrap();
        let channel = MockChannel::handle(channel_id);
        core.handle(SetupEvent::ConnectAttemptSuccessful {
            attempt_id,
            channel: channel.clone(),
        });
        assert_eq!(core.state(), Connected);
        channel
    }

    #[test]
    fn test_transition_table() {
        let all = [
            Disconnected,
            Connecting,
            Connected,
            Disconnecting,
            WaitingToReconnect,
        ];
        let legal: usize = all
            .iter()
            .map(|a| all.iter().filter(|b| a.can_transition_to(**b)).count())
            .sum();
        assert_eq!(legal, 9);
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(WaitingToReconnect));
        assert!(!Disconnecting.can_transition_to(Connecting));
    }

    #[test]
    fn test_connect_and_stop() {
        let mut core = SetupCore::new("test", None);
        let channel = connected(&mut core, "ch-1");
        assert_eq!(core.last_channel_id(), Some("ch-1"));

        let effects = core.handle(SetupEvent::StopRequested);
        assert!(matches!(effects[0], Effect::Disconnect { .. }));
        assert_eq!(transitions(&effects), vec![(Connected, Disconnecting)]);

        let effects = core.handle(SetupEvent::ChannelClosedByOwnRequest {
            channel_id: channel.channel_id().to_string(),
        });
        assert_eq!(transitions(&effects), vec![(Disconnecting, Disconnected)]);
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );
        assert!(core.current_channel().is_none());
    }

    #[test]
    fn test_stale_success_does_not_change_state() {
        let mut core = SetupCore::new("test", None);
        let first = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        core.handle(SetupEvent::StopRequested);
        let second = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        assert!(second > first);

        let effects = core.handle(SetupEvent::ConnectAttemptSuccessful {
            attempt_id: second - 1,
            channel: MockChannel::handle("stale"),
        });
        assert_eq!(core.state(), Connecting);
        assert!(matches!(effects.as_slice(), [Effect::Disconnect { .. }]));

        let effects = core.handle(SetupEvent::ConnectAttemptFailed {
            attempt_id: first,
            error: "late".into(),
        });
        assert!(effects.is_empty());
        assert_eq!(core.state(), Connecting);
    }

    #[test]
    fn test_stop_while_connecting_cancels_without_retry() {
        let mut core = SetupCore::new("test", policy());
        let attempt_id = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();

        let effects = core.handle(SetupEvent::StopRequested);
        assert!(matches!(
            effects[0],
            Effect::CancelConnect { attempt_id: id } if id == attempt_id
        ));
        assert_eq!(transitions(&effects), vec![(Connecting, Disconnected)]);
        assert!(scheduled(&effects).is_none());
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );
    }

    #[test]
    fn test_failure_without_policy() {
        let mut core = SetupCore::new("test", None);
        let attempt_id = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        let effects = core.handle(SetupEvent::ConnectAttemptFailed {
            attempt_id,
            error: "refused".into(),
        });
        assert!(matches!(
            effects[0],
            Effect::NotifyAttemptFailed {
                first_failure: true,
                will_auto_retry: false
            }
        ));
        assert_eq!(transitions(&effects), vec![(Connecting, Disconnected)]);
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::FailedToConnect)
        );
    }

    #[test]
    fn test_backoff_across_failures() {
        let mut core = SetupCore::new("test", policy());
        let mut attempt_id = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        let mut delays = Vec::new();

        for round in 0..5 {
            let effects = core.handle(SetupEvent::ConnectAttemptFailed {
                attempt_id,
                error: "refused".into(),
            });
            assert!(matches!(
                effects[0],
                Effect::NotifyAttemptFailed { first_failure, will_auto_retry: true }
                    if first_failure == (round == 0)
            ));
            assert_eq!(
                transitions(&effects),
                vec![(Connecting, Disconnected), (Disconnected, WaitingToReconnect)]
            );
            let expected_reason = if round == 0 {
                DisconnectReason::FailedToConnect
            } else {
                DisconnectReason::FailedToAutoReconnect
            };
            assert_eq!(core.last_disconnect_reason(), Some(expected_reason));

            let (timer_id, delay) = scheduled(&effects).unwrap();
            delays.push(delay.as_secs());
            let effects = core.handle(SetupEvent::AutoRetryDelayExpired { timer_id });
            assert_eq!(
                transitions(&effects),
                vec![(WaitingToReconnect, Connecting)]
            );
            attempt_id = spawned_attempt(&effects).unwrap();
        }
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn test_stop_while_waiting_fences_timer() {
        let mut core = SetupCore::new("test", policy());
        let attempt_id = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        let effects = core.handle(SetupEvent::ConnectAttemptFailed {
            attempt_id,
            error: "refused".into(),
        });
        let (timer_id, _) = scheduled(&effects).unwrap();

        let effects = core.handle(SetupEvent::StopRequested);
        assert_eq!(transitions(&effects), vec![(WaitingToReconnect, Disconnected)]);

        let effects = core.handle(SetupEvent::AutoRetryDelayExpired { timer_id });
        assert!(effects.is_empty());
        assert_eq!(core.state(), Disconnected);
    }

    #[test]
    fn test_manual_start_while_waiting_resets_failures() {
        let mut core = SetupCore::new("test", policy());
        let attempt_id = spawned_attempt(&core.handle(SetupEvent::StartRequested)).unwrap();
        core.handle(SetupEvent::ConnectAttemptFailed {
            attempt_id,
            error: "refused".into(),
        });
        assert_eq!(core.consecutive_failures(), 1);

        let effects = core.handle(SetupEvent::StartRequested);
        assert_eq!(transitions(&effects), vec![(WaitingToReconnect, Connecting)]);
        assert_eq!(core.consecutive_failures(), 0);
    }

    #[test]
    fn test_break_seeds_failure_counter() {
        let mut core = SetupCore::new("test", policy());
        let channel = connected(&mut core, "ch-1");

        let effects = core.handle(SetupEvent::ChannelBroken {
            channel_id: channel.channel_id().to_string(),
        });
        assert!(matches!(
            effects[0],
            Effect::NotifyConnectionClosed {
                reason: DisconnectReason::Error,
                will_auto_retry: true
            }
        ));
        assert_eq!(
            transitions(&effects),
            vec![(Connected, Disconnected), (Disconnected, WaitingToReconnect)]
        );
        assert_eq!(core.consecutive_failures(), 1);
        assert_eq!(scheduled(&effects).unwrap().1, Duration::from_secs(5));

        let (timer_id, _) = scheduled(&effects).unwrap();
        let effects = core.handle(SetupEvent::AutoRetryDelayExpired { timer_id });
        let attempt_id = spawned_attempt(&effects).unwrap();
        let effects = core.handle(SetupEvent::ConnectAttemptFailed {
            attempt_id,
            error: "refused".into(),
        });
        assert!(matches!(
            effects[0],
            Effect::NotifyAttemptFailed {
                first_failure: false,
                will_auto_retry: true
            }
        ));
        assert_eq!(scheduled(&effects).unwrap().1, Duration::from_secs(10));
    }

    #[test]
    fn test_remote_close_without_policy() {
        let mut core = SetupCore::new("test", None);
        let channel = connected(&mut core, "ch-1");
        let effects = core.handle(SetupEvent::ChannelClosedByRemote {
            channel_id: channel.channel_id().to_string(),
        });
        assert_eq!(transitions(&effects), vec![(Connected, Disconnected)]);
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::RemoteShutdown)
        );
    }

    #[test]
    fn test_close_of_foreign_channel_is_ignored() {
        let mut core = SetupCore::new("test", policy());
        connected(&mut core, "ch-1");
        let effects = core.handle(SetupEvent::ChannelBroken {
            channel_id: "ch-other".into(),
        });
        assert!(effects.is_empty());
        assert_eq!(core.state(), Connected);
    }

    #[test]
    fn test_channel_closed_before_success_is_processed() {
        let mut core = SetupCore::new("test", policy());
        let effects = core.handle(SetupEvent::StartRequested);
        let attempt_id = spawned_attempt(&effects).unwrap();

        let mock = Arc::new(MockChannel::new("ch-1"));
        mock.mark_remote_closed();
        let effects = core.handle(SetupEvent::ConnectAttemptSuccessful {
            attempt_id,
            channel: mock,
        });
        assert_eq!(
            transitions(&effects),
            vec![
                (Connecting, Connected),
                (Connected, Disconnected),
                (Disconnected, WaitingToReconnect)
            ]
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::NotifyConnectionClosed {
                reason: DisconnectReason::RemoteShutdown,
                will_auto_retry: true
            }
        )));
        assert!(core.current_channel().is_none());
        assert_eq!(core.last_channel_id(), Some("ch-1"));
    }

    #[test]
    fn test_broken_before_success_without_policy() {
        let mut core = SetupCore::new("test", None);
        let effects = core.handle(SetupEvent::StartRequested);
        let attempt_id = spawned_attempt(&effects).unwrap();

        let mock = Arc::new(MockChannel::new("ch-1"));
        mock.mark_broken();
        core.handle(SetupEvent::ConnectAttemptSuccessful {
            attempt_id,
            channel: mock,
        });
        assert_eq!(core.state(), Disconnected);
        assert_eq!(core.last_disconnect_reason(), Some(DisconnectReason::Error));
    }

    #[test]
    fn test_break_while_disconnecting_keeps_active_shutdown() {
        let mut core = SetupCore::new("test", policy());
        let channel = connected(&mut core, "ch-1");
        core.handle(SetupEvent::StopRequested);

        let effects = core.handle(SetupEvent::ChannelBroken {
            channel_id: channel.channel_id().to_string(),
        });
        assert_eq!(transitions(&effects), vec![(Disconnecting, Disconnected)]);
        assert!(scheduled(&effects).is_none());
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );

        // the own-request confirmation that follows is a no-op
        let effects = core.handle(SetupEvent::ChannelClosedByOwnRequest {
            channel_id: channel.channel_id().to_string(),
        });
        assert!(effects.is_empty());
        assert_eq!(
            core.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );
    }

    #[test]
    fn test_observed_transitions_are_always_legal() {
        let mut core = SetupCore::new("test", policy());
        let mut observed = Vec::new();
        let mut next_channel = 0;

        // deterministic pseudo-random event sequence
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let attempt_id = core.attempt_id().saturating_sub((seed >> 60) & 1);
            let event = match seed % 6 {
                0 => SetupEvent::StartRequested,
                1 => SetupEvent::StopRequested,
                2 => {
                    next_channel += 1;
                    SetupEvent::ConnectAttemptSuccessful {
                        attempt_id,
                        channel: MockChannel::handle(&format!("ch-{}", next_channel)),
                    }
                }
                3 => SetupEvent::ConnectAttemptFailed {
                    attempt_id,
                    error: "refused".into(),
                },
                4 => SetupEvent::AutoRetryDelayExpired {
                    timer_id: core.timer_id(),
                },
                _ => SetupEvent::ChannelBroken {
                    channel_id: format!("ch-{}", next_channel),
                },
            };
            observed.extend(transitions(&core.handle(event)));
        }

        assert!(!observed.is_empty());
        for (old, new) in observed {
            assert!(old.can_transition_to(new), "{} -> {}", old, new);
        }
    }
}
