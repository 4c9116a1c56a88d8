//! Connection setups.
//!
//! A [`ConnectionSetup`] owns the lifecycle of one outbound logical
//! connection. Events are serialized through an unbounded queue and applied
//! to the [`SetupCore`] by a per-setup driver task; the resulting effects
//! (connect attempts, channel closes, retry timers) run on separate tasks and
//! report back as new events.

use crate::channel::{ChannelHandle, MessageChannel, MessageChannelService, MessageChannelState};
use crate::contact_point::NetworkContactPoint;
use crate::error::SessionError;
use crate::listener::ConnectionSetupListener;
use crate::retry::AutoRetryPolicy;
use crate::state::{ConnectionSetupState, DisconnectReason, Effect, SetupCore, SetupEvent};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Polling interval of [`ConnectionSetup::await_state`]
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Handle to one outbound logical connection
#[derive(Clone)]
pub struct ConnectionSetup {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    display_name: String,
    contact_point: NetworkContactPoint,
    connect_on_startup: bool,
    core: Mutex<SetupCore>,
    events_tx: mpsc::UnboundedSender<SetupEvent>,
}

impl ConnectionSetup {
    /// Create a setup in DISCONNECTED and start its driver task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: u64,
        contact_point: NetworkContactPoint,
        display_name: impl Into<String>,
        connect_on_startup: bool,
        channel_service: Arc<dyn MessageChannelService>,
        listener: Arc<dyn ConnectionSetupListener>,
    ) -> Self {
        let display_name = display_name.into();
        let policy = AutoRetryPolicy::from_attributes(contact_point.attributes());
        debug!(
            "Creating connection setup {} ({}) for {}, auto-retry: {:?}",
            id, display_name, contact_point, policy
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            core: Mutex::new(SetupCore::new(display_name.clone(), policy)),
            display_name,
            contact_point,
            connect_on_startup,
            events_tx,
        });

        let driver = SetupDriver {
            shared: Arc::downgrade(&shared),
            channel_service,
            listener,
            connect_tasks: HashMap::new(),
        };
        tokio::spawn(driver.run(events_rx));

        Self { shared }
    }

    /// Setup id, unique within its [`crate::ConnectionSetupService`]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Name used in logs and listings
    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    /// Contact point this setup connects to
    pub fn contact_point(&self) -> &NetworkContactPoint {
        &self.shared.contact_point
    }

    /// Whether the setup should be started together with the node
    pub fn connect_on_startup(&self) -> bool {
        self.shared.connect_on_startup
    }

    /// Current state
    pub fn state(&self) -> ConnectionSetupState {
        self.core().state()
    }

    /// Reason of the most recent disconnect
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.core().last_disconnect_reason()
    }

    /// Active channel while CONNECTED or DISCONNECTING
    pub fn current_channel(&self) -> Option<ChannelHandle> {
        self.core().current_channel().cloned()
    }

    /// Id of the active channel
    pub fn current_channel_id(&self) -> Option<String> {
        self.core()
            .current_channel()
            .map(|c| c.channel_id().to_string())
    }

    /// Id of the most recently established channel, kept after disconnect
    pub fn last_channel_id(&self) -> Option<String> {
        self.core().last_channel_id().map(str::to_string)
    }

    /// Consecutive failed connect attempts
    pub fn consecutive_failures(&self) -> u32 {
        self.core().consecutive_failures()
    }

    /// Request the connection to be established and kept up
    pub fn signal_start_intent(&self) {
        self.post(SetupEvent::StartRequested);
    }

    /// Request the connection to be closed and not retried
    pub fn signal_stop_intent(&self) {
        self.post(SetupEvent::StopRequested);
    }

    /// Report that a channel closed. Channels that are not this setup's
    /// active channel are ignored by the state machine.
    pub fn on_message_channel_closed(&self, channel: &dyn MessageChannel) {
        let channel_id = channel.channel_id().to_string();
        let event = if channel.state() == MessageChannelState::MarkedAsBroken {
            SetupEvent::ChannelBroken { channel_id }
        } else if channel.is_closed_because_remote_closed() {
            SetupEvent::ChannelClosedByRemote { channel_id }
        } else {
            SetupEvent::ChannelClosedByOwnRequest { channel_id }
        };
        self.post(event);
    }

    /// Wait until the setup reaches `target`, polling its state every
    /// [`STATE_POLL_INTERVAL`]
    pub async fn await_state(
        &self,
        target: ConnectionSetupState,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    expected: target,
                    actual: current,
                    timeout,
                });
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }

    fn post(&self, event: SetupEvent) {
        if self.shared.events_tx.send(event).is_err() {
            debug!(
                "Driver of connection {} is gone; dropping event",
                self.shared.display_name
            );
        }
    }

    fn core(&self) -> MutexGuard<'_, SetupCore> {
        self.shared.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSetup")
            .field("id", &self.shared.id)
            .field("display_name", &self.shared.display_name)
            .field("contact_point", &self.shared.contact_point.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) [{}]",
            self.shared.display_name,
            self.shared.contact_point,
            self.state()
        )
    }
}

/// Applies events to the state machine and executes the resulting effects
struct SetupDriver {
    shared: Weak<Shared>,
    channel_service: Arc<dyn MessageChannelService>,
    listener: Arc<dyn ConnectionSetupListener>,
    connect_tasks: HashMap<u64, JoinHandle<()>>,
}

impl SetupDriver {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<SetupEvent>) {
        while let Some(event) = events_rx.recv().await {
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            trace!("Connection {} processing {:?}", shared.display_name, event);

            let effects = shared
                .core
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle(event);

            let setup = ConnectionSetup { shared };
            for effect in effects {
                self.execute(&setup, effect);
            }
        }

        for (_, task) in self.connect_tasks.drain() {
            task.abort();
        }
        trace!("Connection setup driver stopped");
    }

    fn execute(&mut self, setup: &ConnectionSetup, effect: Effect) {
        match effect {
            Effect::SpawnConnect {
                attempt_id,
                auto_retry,
            } => {
                self.connect_tasks.retain(|_, task| !task.is_finished());
                debug!(
                    "Connection {}: starting {} connect attempt {} to {}",
                    setup.display_name(),
                    if auto_retry { "automatic" } else { "manual" },
                    attempt_id,
                    setup.contact_point()
                );

                let service = self.channel_service.clone();
                let contact_point = setup.contact_point().clone();
                let events_tx = setup.shared.events_tx.clone();
                let task = tokio::spawn(async move {
                    let event = match service.connect(&contact_point).await {
                        Ok(channel) => SetupEvent::ConnectAttemptSuccessful {
                            attempt_id,
                            channel,
                        },
                        Err(e) => SetupEvent::ConnectAttemptFailed {
                            attempt_id,
                            error: e.to_string(),
                        },
                    };
                    let _ = events_tx.send(event);
                });
                self.connect_tasks.insert(attempt_id, task);
            }
            Effect::CancelConnect { attempt_id } => {
                if let Some(task) = self.connect_tasks.remove(&attempt_id) {
                    debug!(
                        "Connection {}: cancelling connect attempt {}",
                        setup.display_name(),
                        attempt_id
                    );
                    task.abort();
                }
            }
            Effect::Disconnect { channel } => {
                let service = self.channel_service.clone();
                let events_tx = setup.shared.events_tx.clone();
                tokio::spawn(async move {
                    let channel_id = channel.channel_id().to_string();
                    service.close_outgoing_channel(channel).await;
                    let _ = events_tx.send(SetupEvent::ChannelClosedByOwnRequest { channel_id });
                });
            }
            Effect::ScheduleRetry { timer_id, delay } => {
                let events_tx = setup.shared.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events_tx.send(SetupEvent::AutoRetryDelayExpired { timer_id });
                });
            }
            Effect::NotifyStateChanged { old, new } => {
                self.listener.on_state_changed(setup, old, new);
            }
            Effect::NotifyAttemptFailed {
                first_failure,
                will_auto_retry,
            } => {
                self.listener
                    .on_connection_attempt_failed(setup, first_failure, will_auto_retry);
            }
            Effect::NotifyConnectionClosed {
                reason,
                will_auto_retry,
            } => {
                self.listener
                    .on_connection_closed(setup, reason, will_auto_retry);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::channel::MessageChannelLifecycleListener;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Connect outcome scripted for [`MockService`]
    pub(crate) enum Outcome {
        Succeed,
        Fail,
        Hang(Duration),
        /// Remote closes right after the handshake, before the result is reported
        ClosedOnArrival,
    }

    pub(crate) struct MockService {
        outcomes: Mutex<VecDeque<Outcome>>,
        pub connect_times: Mutex<Vec<Instant>>,
        pub channels: Mutex<Vec<Arc<MockChannel>>>,
        pub closed: Mutex<Vec<String>>,
        listeners: Mutex<Vec<Arc<dyn MessageChannelLifecycleListener>>>,
    }

    impl MockService {
        pub fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                connect_times: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageChannelService for MockService {
        async fn connect(
            &self,
            contact_point: &NetworkContactPoint,
        ) -> Result<ChannelHandle, SessionError> {
            self.connect_times.lock().unwrap().push(Instant::now());
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Fail);
            let closed_on_arrival = matches!(outcome, Outcome::ClosedOnArrival);
            match outcome {
                Outcome::Succeed | Outcome::ClosedOnArrival => {}
                Outcome::Fail => {
                    return Err(SessionError::Connect {
                        target: contact_point.to_string(),
                        reason: "connection refused".into(),
                    })
                }
                Outcome::Hang(d) => tokio::time::sleep(d).await,
            }
            let channel = {
                let mut channels = self.channels.lock().unwrap();
                let channel =
                    Arc::new(MockChannel::new(&format!("mock-{}", channels.len() + 1)));
                channels.push(channel.clone());
                channel
            };
            let handle: ChannelHandle = channel.clone();
            if closed_on_arrival {
                channel.mark_remote_closed();
                let listeners = self.listeners.lock().unwrap().clone();
                for listener in listeners {
                    listener.on_outgoing_channel_terminated(&handle);
                }
            }
            Ok(handle)
        }

        async fn close_outgoing_channel(&self, channel: ChannelHandle) {
            channel.close().await;
            self.closed
                .lock()
                .unwrap()
                .push(channel.channel_id().to_string());
        }

        fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>) {
            self.listeners.lock().unwrap().push(listener);
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub transitions: Mutex<Vec<(ConnectionSetupState, ConnectionSetupState)>>,
        pub failures: Mutex<Vec<(bool, bool)>>,
        pub closures: Mutex<Vec<(DisconnectReason, bool)>>,
    }

    impl ConnectionSetupListener for RecordingListener {
        fn on_state_changed(
            &self,
            _setup: &ConnectionSetup,
            old: ConnectionSetupState,
            new: ConnectionSetupState,
        ) {
            self.transitions.lock().unwrap().push((old, new));
        }

        fn on_connection_attempt_failed(
            &self,
            _setup: &ConnectionSetup,
            first_failure: bool,
            will_auto_retry: bool,
        ) {
            self.failures
                .lock()
                .unwrap()
                .push((first_failure, will_auto_retry));
        }

        fn on_connection_closed(
            &self,
            _setup: &ConnectionSetup,
            reason: DisconnectReason,
            will_auto_retry: bool,
        ) {
            self.closures.lock().unwrap().push((reason, will_auto_retry));
        }
    }

    fn retrying_contact_point() -> NetworkContactPoint {
        NetworkContactPoint::new("relay.test", 21000)
            .with_attribute("autoRetryInitialDelay", "5")
            .with_attribute("autoRetryDelayMultiplier", "2")
            .with_attribute("autoRetryMaximumDelay", "30")
    }

    fn setup(
        contact_point: NetworkContactPoint,
        service: Arc<MockService>,
    ) -> (ConnectionSetup, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let setup = ConnectionSetup::new(1, contact_point, "test", false, service, listener.clone());
        (setup, listener)
    }

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect() {
        let service = MockService::new(vec![Outcome::Succeed]);
        let (setup, listener) = setup(NetworkContactPoint::new("relay.test", 21000), service.clone());

        setup.signal_start_intent();
        setup
            .await_state(ConnectionSetupState::Connected, WAIT)
            .await
            .unwrap();
        assert_eq!(setup.current_channel_id().as_deref(), Some("mock-1"));

        setup.signal_stop_intent();
        setup
            .await_state(ConnectionSetupState::Disconnected, WAIT)
            .await
            .unwrap();
        assert_eq!(
            setup.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );
        assert_eq!(setup.last_channel_id().as_deref(), Some("mock-1"));
        assert!(setup.current_channel().is_none());
        assert_eq!(*service.closed.lock().unwrap(), vec!["mock-1".to_string()]);

        use ConnectionSetupState::*;
        assert_eq!(
            *listener.transitions.lock().unwrap(),
            vec![
                (Disconnected, Connecting),
                (Connecting, Connected),
                (Connected, Disconnecting),
                (Disconnecting, Disconnected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_backoff() {
        let service = MockService::new(vec![]);
        let (setup, listener) = setup(retrying_contact_point(), service.clone());

        setup.signal_start_intent();
        tokio::time::sleep(Duration::from_secs(40)).await;

        let times = service.connect_times.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![5, 10, 20]);

        let failures = listener.failures.lock().unwrap().clone();
        assert_eq!(failures[0], (true, true));
        assert!(failures[1..].iter().all(|f| *f == (false, true)));
        assert_eq!(
            setup.last_disconnect_reason(),
            Some(DisconnectReason::FailedToAutoReconnect)
        );

        setup.signal_stop_intent();
        setup
            .await_state(ConnectionSetupState::Disconnected, WAIT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(service.connect_times.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connecting() {
        let service = MockService::new(vec![Outcome::Hang(Duration::from_secs(10))]);
        let (setup, _listener) = setup(retrying_contact_point(), service.clone());

        setup.signal_start_intent();
        setup
            .await_state(ConnectionSetupState::Connecting, WAIT)
            .await
            .unwrap();
        setup.signal_stop_intent();
        setup
            .await_state(ConnectionSetupState::Disconnected, WAIT)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(setup.state(), ConnectionSetupState::Disconnected);
        assert_eq!(
            setup.last_disconnect_reason(),
            Some(DisconnectReason::ActiveShutdown)
        );
        assert!(service.channels.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_channel_reconnects() {
        let service = MockService::new(vec![Outcome::Succeed, Outcome::Succeed]);
        let (setup, listener) = setup(retrying_contact_point(), service.clone());

        setup.signal_start_intent();
        setup
            .await_state(ConnectionSetupState::Connected, WAIT)
            .await
            .unwrap();

        let channel = service.channels.lock().unwrap()[0].clone();
        channel.mark_broken();
        setup.on_message_channel_closed(channel.as_ref());
        setup
            .await_state(ConnectionSetupState::WaitingToReconnect, WAIT)
            .await
            .unwrap();
        assert_eq!(setup.consecutive_failures(), 1);
        assert_eq!(
            *listener.closures.lock().unwrap(),
            vec![(DisconnectReason::Error, true)]
        );

        setup
            .await_state(ConnectionSetupState::Connected, Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(setup.current_channel_id().as_deref(), Some("mock-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_without_retry() {
        let service = MockService::new(vec![Outcome::Succeed]);
        let (setup, listener) = setup(NetworkContactPoint::new("relay.test", 21000), service.clone());

        setup.signal_start_intent();
        setup
            .await_state(ConnectionSetupState::Connected, WAIT)
            .await
            .unwrap();
        let channel = service.channels.lock().unwrap()[0].clone();
        channel.mark_remote_closed();
        setup.on_message_channel_closed(channel.as_ref());
        setup
            .await_state(ConnectionSetupState::Disconnected, WAIT)
            .await
            .unwrap();

        assert_eq!(
            setup.last_disconnect_reason(),
            Some(DisconnectReason::RemoteShutdown)
        );
        assert_eq!(
            *listener.closures.lock().unwrap(),
            vec![(DisconnectReason::RemoteShutdown, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_closed_on_arrival_triggers_retry() {
        let service = MockService::new(vec![Outcome::ClosedOnArrival, Outcome::Succeed]);
        let (setup, listener) = setup(retrying_contact_point(), service.clone());

        setup.signal_start_intent();
        setup
            .await_state(ConnectionSetupState::WaitingToReconnect, WAIT)
            .await
            .unwrap();
        assert_eq!(
            *listener.closures.lock().unwrap(),
            vec![(DisconnectReason::RemoteShutdown, true)]
        );
        assert_eq!(setup.last_channel_id().as_deref(), Some("mock-1"));

        setup
            .await_state(ConnectionSetupState::Connected, Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(setup.current_channel_id().as_deref(), Some("mock-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_state_timeout() {
        let service = MockService::new(vec![]);
        let (setup, _listener) = setup(NetworkContactPoint::new("relay.test", 21000), service);

        let err = setup
            .await_state(ConnectionSetupState::Connected, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Timeout {
                expected: ConnectionSetupState::Connected,
                actual: ConnectionSetupState::Disconnected,
                ..
            }
        ));
    }
}
