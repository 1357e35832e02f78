//! Serialized session loop. One bounded queue carries platform broadcasts, request
//! completions and user commands; a single task applies them in arrival order.

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use wfd_core::{
    ConnectConfig, Event, Notification, Phase, Session, SessionState, UserCommand,
};

use crate::config::{Config, ConfigError};
use crate::observer::PublishingObserver;
use crate::platform::{ChannelPlatform, SimulatedBackend};

/// Everything the session task consumes.
#[derive(Debug)]
pub enum HostMessage {
    Event(Event),
    Command(UserCommand),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("session task has stopped")]
    Closed,
}

/// Cheap handle for talking to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    queue: mpsc::Sender<HostMessage>,
    state: watch::Receiver<SessionState>,
    notifications: broadcast::Sender<Notification>,
}

impl SessionHandle {
    pub async fn command(&self, command: UserCommand) -> Result<(), HostError> {
        self.send(HostMessage::Command(command)).await
    }

    /// Inject a platform event, as an external event source would.
    pub async fn event(&self, event: Event) -> Result<(), HostError> {
        self.send(HostMessage::Event(event)).await
    }

    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.send(HostMessage::Shutdown).await
    }

    /// Latest published state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    async fn send(&self, msg: HostMessage) -> Result<(), HostError> {
        self.queue.send(msg).await.map_err(|_| HostError::Closed)
    }
}

/// Host-side conveniences layered over the session: discover on radio-on, connect to a
/// named peer once it shows up.
struct AutoPolicy {
    discover: bool,
    connect: Option<String>,
    connect_attempted: bool,
    last_phase: Phase,
    last_retry_used: bool,
}

/// Owns the session and drains the queue.
pub struct SessionDriver {
    session: Session<ChannelPlatform, PublishingObserver>,
    queue: mpsc::Receiver<HostMessage>,
    auto: AutoPolicy,
}

impl SessionDriver {
    pub async fn run(mut self) {
        let span = tracing::info_span!("session", id = %self.session.id());
        async move {
            self.session.start();
            while let Some(msg) = self.queue.recv().await {
                match msg {
                    HostMessage::Event(e) => self.session.handle_event(e),
                    HostMessage::Command(c) => self.session.handle_command(c),
                    HostMessage::Shutdown => break,
                }
                self.apply_auto_policy();
            }
            self.session.shutdown();
            info!("session stopped");
        }
        .instrument(span)
        .await
    }

    fn apply_auto_policy(&mut self) {
        let state = self.session.state();
        let phase = state.phase;
        let radio_came_on = phase == Phase::RadioOn
            && matches!(
                self.auto.last_phase,
                Phase::Idle | Phase::RadioOff | Phase::ChannelLost
            );
        self.auto.last_phase = phase;
        // The channel retry wiped the peer list without passing through RadioOff.
        let channel_reopened =
            phase == Phase::RadioOn && state.channel_retry_used && !self.auto.last_retry_used;
        self.auto.last_retry_used = state.channel_retry_used;

        let wanted = match &self.auto.connect {
            Some(w)
                if !self.auto.connect_attempted
                    && matches!(phase, Phase::RadioOn | Phase::Discovering)
                    && state.connection.peer().is_none() =>
            {
                state
                    .peers
                    .iter()
                    .find(|d| d.name == *w || d.address.to_string() == *w)
                    .cloned()
            }
            _ => None,
        };

        if self.auto.discover && (radio_came_on || channel_reopened) {
            debug!(channel_reopened, "starting discovery");
            self.session.discover_peers();
        }
        if let Some(device) = wanted {
            info!(peer = %device.name, "auto-connecting");
            self.auto.connect_attempted = true;
            let config = ConnectConfig::for_device(&device);
            self.session.connect(device, config);
        }
    }
}

/// A spawned session with its backend.
pub struct RunningSession {
    pub handle: SessionHandle,
    pub driver: JoinHandle<()>,
    pub backend: JoinHandle<()>,
}

/// Spawn the session task and a simulated backend wired to it.
pub fn spawn_session(config: &Config) -> Result<RunningSession, ConfigError> {
    if config.queue_capacity == 0 {
        return Err(ConfigError::QueueCapacity);
    }
    let this_device = config.backend.this_device()?;
    let peers = config.backend.peer_devices()?;

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let (observer, state_rx) = PublishingObserver::new();
    let notifications = observer.notifier();
    let session = Session::new(ChannelPlatform::new(request_tx), observer);

    let backend = SimulatedBackend::new(
        config.backend.latency(),
        config.backend.radio_enabled,
        this_device,
        peers,
        request_rx,
        queue_tx.clone(),
    );
    let driver = SessionDriver {
        session,
        queue: queue_rx,
        auto: AutoPolicy {
            discover: config.auto_discover,
            connect: config.auto_connect.clone(),
            connect_attempted: false,
            last_phase: Phase::Idle,
            last_retry_used: false,
        },
    };

    Ok(RunningSession {
        handle: SessionHandle {
            queue: queue_tx,
            state: state_rx,
            notifications,
        },
        driver: tokio::spawn(driver.run()),
        backend: tokio::spawn(backend.run()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use wfd_core::ConnectionState;

    use crate::config::PeerEntry;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> Config {
        let mut c = Config::default();
        c.backend.latency_ms = 1;
        c
    }

    async fn wait_for(handle: &SessionHandle, pred: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = handle.watch_state();
        let state = timeout(WAIT, rx.wait_for(pred))
            .await
            .expect("timed out waiting for state")
            .expect("session closed");
        state.clone()
    }

    async fn wait_notification(
        rx: &mut broadcast::Receiver<Notification>,
        mut pred: impl FnMut(&Notification) -> bool,
    ) -> Notification {
        timeout(WAIT, async {
            loop {
                let n = rx.recv().await.expect("notification channel closed");
                if pred(&n) {
                    return n;
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }

    #[tokio::test]
    async fn auto_discovery_populates_peers() {
        let running = spawn_session(&fast_config()).unwrap();
        let state = wait_for(&running.handle, |s| s.peers.len() == 2).await;
        assert!(state.radio_enabled);
        assert_eq!(state.phase, Phase::Discovering);
        assert_eq!(
            state.this_device.as_ref().map(|d| d.name.as_str()),
            Some("wfd-linux")
        );
        running.handle.shutdown().await.unwrap();
        running.driver.await.unwrap();
    }

    #[tokio::test]
    async fn connect_then_disconnect_end_to_end() {
        let running = spawn_session(&fast_config()).unwrap();
        let handle = running.handle.clone();
        let state = wait_for(&handle, |s| s.peers.len() == 2).await;
        let pixel = state
            .peers
            .iter()
            .find(|d| d.name == "Pixel")
            .cloned()
            .unwrap();

        let config = ConnectConfig::for_device(&pixel);
        handle
            .command(UserCommand::Connect {
                device: pixel.clone(),
                config,
            })
            .await
            .unwrap();
        let state = wait_for(&handle, |s| s.phase == Phase::Connected).await;
        match &state.connection {
            ConnectionState::Connected { peer, info } => {
                assert_eq!(peer.address, pixel.address);
                assert_eq!(info.group_owner_address, Some("192.168.49.1".parse().unwrap()));
            }
            other => panic!("expected Connected, got {:?}", other),
        }
        assert_eq!(state.peers.connected().count(), 1);

        // Connected target: cancel means leave the group.
        handle.command(UserCommand::CancelConnect).await.unwrap();
        let state = wait_for(&handle, |s| {
            s.connection == ConnectionState::Disconnected && s.peers.len() == 2
        })
        .await;
        assert_eq!(state.peers.connected().count(), 0);

        handle.shutdown().await.unwrap();
        running.driver.await.unwrap();
    }

    #[tokio::test]
    async fn auto_connect_reaches_named_peer() {
        let mut config = fast_config();
        config.auto_connect = Some("Android_TV".to_string());
        let running = spawn_session(&config).unwrap();
        let state = wait_for(&running.handle, |s| s.phase == Phase::Connected).await;
        assert_eq!(
            state.connection.peer().map(|d| d.name.as_str()),
            Some("Android_TV")
        );
        running.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_connect_is_transient() {
        let mut config = fast_config();
        config.backend.peers = vec![PeerEntry {
            name: "printer".to_string(),
            address: "02:00:00:00:00:20".to_string(),
            reject: true,
        }];
        let running = spawn_session(&config).unwrap();
        let handle = running.handle.clone();
        let mut notes = handle.subscribe();
        let state = wait_for(&handle, |s| s.peers.len() == 1).await;
        let printer = state.peers.iter().next().cloned().unwrap();

        let config = ConnectConfig::for_device(&printer);
        handle
            .command(UserCommand::Connect {
                device: printer,
                config,
            })
            .await
            .unwrap();
        let n = wait_notification(&mut notes, |n| {
            matches!(n, Notification::TransientError(_))
        })
        .await;
        assert_eq!(
            n,
            Notification::TransientError("Connect failed. Retry.".to_string())
        );
        let state = wait_for(&handle, |s| matches!(s.connection, ConnectionState::Failed { .. })).await;
        assert_ne!(state.phase, Phase::Connected);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn discovery_with_radio_off_warns() {
        let mut config = fast_config();
        config.backend.radio_enabled = false;
        let running = spawn_session(&config).unwrap();
        let handle = running.handle.clone();
        wait_for(&handle, |s| s.phase == Phase::RadioOff).await;

        let mut notes = handle.subscribe();
        handle.command(UserCommand::DiscoverPeers).await.unwrap();
        let n = wait_notification(&mut notes, |n| {
            matches!(n, Notification::TransientError(_))
        })
        .await;
        assert_eq!(
            n,
            Notification::TransientError(wfd_core::core::P2P_OFF_WARNING.to_string())
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn discovery_resumes_after_channel_retry() {
        let running = spawn_session(&fast_config()).unwrap();
        let handle = running.handle.clone();
        wait_for(&handle, |s| s.peers.len() == 2).await;

        handle.event(Event::ChannelLost).await.unwrap();
        let state = wait_for(&handle, |s| s.channel_retry_used && s.peers.len() == 2).await;
        assert_eq!(state.phase, Phase::Discovering);
        handle.shutdown().await.unwrap();
        running.driver.await.unwrap();
    }

    #[tokio::test]
    async fn second_channel_loss_is_fatal() {
        let running = spawn_session(&fast_config()).unwrap();
        let handle = running.handle.clone();
        wait_for(&handle, |s| s.radio_enabled).await;
        let mut notes = handle.subscribe();

        handle.event(Event::ChannelLost).await.unwrap();
        let state = wait_for(&handle, |s| s.channel_retry_used).await;
        assert_ne!(state.phase, Phase::ChannelLost);

        handle.event(Event::ChannelLost).await.unwrap();
        wait_notification(&mut notes, |n| matches!(n, Notification::FatalChannelLoss)).await;
        let state = wait_for(&handle, |s| s.phase == Phase::ChannelLost).await;
        assert!(state.peers.is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn zero_queue_capacity_is_rejected() {
        let mut config = fast_config();
        config.queue_capacity = 0;
        assert!(matches!(
            spawn_session(&config),
            Err(ConfigError::QueueCapacity)
        ));
    }
}
