//! Session: a state machine bound to its platform handle and observer.

use tracing::info;
use uuid::Uuid;

use crate::core::{Notification, Output, SessionMachine, SessionState};
use crate::device::{ConnectConfig, Device};
use crate::dispatch::P2pPlatform;
use crate::event::{Event, UserCommand};

/// UI side of the session. Called synchronously on the session's thread.
pub trait SessionObserver {
    /// Called after every transition that changed the state.
    fn on_state_changed(&mut self, state: &SessionState);
    /// The channel is gone for good; the user must toggle the radio.
    fn on_fatal_channel_loss(&mut self);
    /// A request was rejected. Not fatal; the user may retry.
    fn on_transient_error(&mut self, message: &str);
    /// Informational messages ("Discovery Initiated", ...).
    fn on_notice(&mut self, _message: &str) {}
}

/// Owns the machine, the platform handle and the observer for one application session.
pub struct Session<P: P2pPlatform, O: SessionObserver> {
    machine: SessionMachine,
    platform: P,
    observer: O,
    started: bool,
}

impl<P: P2pPlatform, O: SessionObserver> Session<P, O> {
    pub fn new(platform: P, observer: O) -> Self {
        Self::with_machine(SessionMachine::new(), platform, observer)
    }

    pub fn with_machine(machine: SessionMachine, platform: P, observer: O) -> Self {
        Self {
            machine,
            platform,
            observer,
            started: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.machine.id()
    }

    pub fn state(&self) -> &SessionState {
        self.machine.state()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Initialize the platform channel. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let out = self.machine.start();
        self.apply(out);
    }

    pub fn handle_event(&mut self, event: Event) {
        let out = self.machine.handle_event(event);
        self.apply(out);
    }

    pub fn handle_command(&mut self, command: UserCommand) {
        let out = self.machine.handle_command(command);
        self.apply(out);
    }

    pub fn discover_peers(&mut self) {
        let out = self.machine.discover_peers();
        self.apply(out);
    }

    pub fn connect(&mut self, device: Device, config: ConnectConfig) {
        let out = self.machine.connect(device, config);
        self.apply(out);
    }

    pub fn cancel_connect(&mut self) {
        let out = self.machine.cancel_connect();
        self.apply(out);
    }

    pub fn remove_group(&mut self) {
        let out = self.machine.remove_group();
        self.apply(out);
    }

    /// End the session: release the platform channel and hand back the collaborators.
    pub fn shutdown(mut self) -> (P, O) {
        info!(id = %self.machine.id(), "session shutting down");
        self.platform.teardown();
        (self.platform, self.observer)
    }

    fn apply(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Request(request) => request.dispatch_to(&mut self.platform),
                Output::Notify(Notification::StateChanged(state)) => {
                    self.observer.on_state_changed(&state)
                }
                Output::Notify(Notification::FatalChannelLoss) => {
                    self.observer.on_fatal_channel_loss()
                }
                Output::Notify(Notification::TransientError(message)) => {
                    self.observer.on_transient_error(&message)
                }
                Output::Notify(Notification::Notice(message)) => self.observer.on_notice(&message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use crate::device::{ConnectionInfo, DeviceAddress, DeviceStatus};
    use crate::dispatch::RequestId;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Initialize(RequestId),
        Discover(RequestId),
        Connect(RequestId, DeviceAddress),
        Cancel(RequestId),
        Remove(RequestId),
        Info(RequestId),
        Peers(RequestId),
    }

    #[derive(Default)]
    struct FakePlatform {
        calls: Vec<Call>,
        torn_down: bool,
    }

    impl FakePlatform {
        fn last(&self) -> Call {
            self.calls.last().cloned().expect("no platform call")
        }
    }

    impl P2pPlatform for FakePlatform {
        fn initialize(&mut self, id: RequestId) {
            self.calls.push(Call::Initialize(id));
        }
        fn discover_peers(&mut self, id: RequestId) {
            self.calls.push(Call::Discover(id));
        }
        fn connect(&mut self, id: RequestId, device: &Device, _config: &ConnectConfig) {
            self.calls.push(Call::Connect(id, device.address));
        }
        fn cancel_connect(&mut self, id: RequestId) {
            self.calls.push(Call::Cancel(id));
        }
        fn remove_group(&mut self, id: RequestId) {
            self.calls.push(Call::Remove(id));
        }
        fn request_connection_info(&mut self, id: RequestId) {
            self.calls.push(Call::Info(id));
        }
        fn request_peers(&mut self, id: RequestId) {
            self.calls.push(Call::Peers(id));
        }
        fn teardown(&mut self) {
            self.torn_down = true;
        }
    }

    #[derive(Default)]
    struct Recorder {
        states: Vec<SessionState>,
        fatal: usize,
        errors: Vec<String>,
        notices: Vec<String>,
    }

    impl SessionObserver for Recorder {
        fn on_state_changed(&mut self, state: &SessionState) {
            self.states.push(state.clone());
        }
        fn on_fatal_channel_loss(&mut self) {
            self.fatal += 1;
        }
        fn on_transient_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
        fn on_notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    fn device(n: u8, status: DeviceStatus) -> Device {
        Device::new(DeviceAddress::new([0xaa, 0, 0, 0, 0, n]), format!("d{}", n), status)
    }

    #[test]
    fn start_is_idempotent() {
        let mut s = Session::new(FakePlatform::default(), Recorder::default());
        s.start();
        s.start();
        assert_eq!(s.platform().calls.len(), 1);
        assert!(matches!(s.platform().last(), Call::Initialize(_)));
    }

    #[test]
    fn full_connect_flow_through_collaborators() {
        let mut s = Session::new(FakePlatform::default(), Recorder::default());
        s.start();
        s.handle_event(Event::RadioStateChanged { enabled: true });

        s.discover_peers();
        let Call::Discover(discover) = s.platform().last() else {
            panic!("expected discover call");
        };
        s.handle_event(Event::ActionSucceeded { request: discover });
        assert_eq!(s.observer().notices, vec!["Discovery Initiated".to_string()]);

        s.handle_event(Event::PeersChanged);
        let Call::Peers(peers) = s.platform().last() else {
            panic!("expected peers call");
        };
        let a = device(1, DeviceStatus::Available);
        s.handle_event(Event::PeersAvailable {
            request: peers,
            peers: vec![a.clone(), device(2, DeviceStatus::Available), device(3, DeviceStatus::Available)],
        });
        assert_eq!(s.state().peers.len(), 3);

        s.connect(a.clone(), ConnectConfig::for_device(&a));
        assert!(matches!(s.platform().last(), Call::Connect(_, addr) if addr == a.address));
        s.handle_event(Event::ConnectionChanged { connected: true });
        let Call::Info(info) = s.platform().last() else {
            panic!("expected info call");
        };
        s.handle_event(Event::ConnectionInfoAvailable {
            request: info,
            info: ConnectionInfo {
                group_formed: true,
                is_group_owner: true,
                group_owner_address: Some("192.168.49.1".parse().unwrap()),
            },
        });
        assert_eq!(s.state().phase, Phase::Connected);
        let last = s.observer().states.last().unwrap();
        assert_eq!(last.phase, Phase::Connected);

        s.cancel_connect();
        assert!(matches!(s.platform().last(), Call::Remove(_)));
    }

    #[test]
    fn observer_sees_fatal_channel_loss_once() {
        let mut s = Session::new(FakePlatform::default(), Recorder::default());
        s.handle_event(Event::RadioStateChanged { enabled: true });
        s.handle_event(Event::ChannelLost);
        assert!(matches!(s.platform().last(), Call::Initialize(_)));
        assert_eq!(s.observer().fatal, 0);
        s.handle_event(Event::ChannelLost);
        s.handle_event(Event::ChannelLost);
        assert_eq!(s.observer().fatal, 1);
        assert_eq!(s.platform().calls.len(), 1);

        s.discover_peers();
        assert_eq!(s.observer().errors.len(), 1);
    }

    #[test]
    fn transient_errors_reach_observer() {
        let mut s = Session::new(FakePlatform::default(), Recorder::default());
        s.handle_command(UserCommand::DiscoverPeers);
        assert_eq!(s.observer().errors.len(), 1);
        assert!(s.platform().calls.is_empty());
    }

    #[test]
    fn shutdown_tears_down_platform() {
        let mut s = Session::new(FakePlatform::default(), Recorder::default());
        s.start();
        let (platform, _observer) = s.shutdown();
        assert!(platform.torn_down);
    }
}
