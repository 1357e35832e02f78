//! Host-driven API: SessionMachine receives platform events and user commands, returns outputs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::{ConnectConfig, ConnectionInfo, Device, DeviceAddress, DeviceStatus, PeerSet};
use crate::dispatch::{self, ChannelLoss, Dispatcher, Origin, Request, RequestId, RequestKind, RequestTag};
use crate::event::{Event, FailureReason, UserCommand};

/// Shown when discovery is requested with the radio off.
pub const P2P_OFF_WARNING: &str = "Enable P2P from action bar button above or system settings";
/// Shown when an operation is attempted after the channel is permanently lost.
pub const CHANNEL_LOST_WARNING: &str =
    "Severe! Channel is probably lost permanently. Try Disable/Re-Enable P2P.";

const CHANNEL_RETRY_NOTICE: &str = "Channel lost. Trying again";

/// Coarse session phase, derived from state after every transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    /// No radio report yet.
    Idle,
    RadioOff,
    RadioOn,
    Discovering,
    Connecting,
    Connected,
    /// Channel lost twice. Only a radio toggle recovers.
    ChannelLost,
}

/// Connection to a single peer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting for the platform; `attempt` is the connect request.
    Connecting { target: Device, attempt: RequestId },
    Connected { peer: Device, info: ConnectionInfo },
    /// Last attempt was rejected; `target` stays selected for a later cancel.
    Failed { target: Device, reason: FailureReason },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting { .. })
    }

    /// Device being connected to or connected with.
    pub fn peer(&self) -> Option<&Device> {
        match self {
            ConnectionState::Connecting { target, .. } => Some(target),
            ConnectionState::Connected { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

/// Snapshot handed to observers.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub radio_enabled: bool,
    pub peers: PeerSet,
    pub connection: ConnectionState,
    pub channel_retry_used: bool,
    pub this_device: Option<Device>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            radio_enabled: false,
            peers: PeerSet::new(),
            connection: ConnectionState::Disconnected,
            channel_retry_used: false,
            this_device: None,
        }
    }
}

/// Something for the observer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    StateChanged(SessionState),
    FatalChannelLoss,
    TransientError(String),
    Notice(String),
}

/// Output for host to act on, in order.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Output {
    Request(Request),
    Notify(Notification),
}

/// Session state machine. Host passes events and commands one at a time; machine returns outputs.
pub struct SessionMachine {
    id: Uuid,
    state: SessionState,
    dispatcher: Dispatcher,
    radio_reported: bool,
    discovering: bool,
    channel_lost: bool,
    /// Device the platform last reported CONNECTED, before reconciliation.
    reported_connected: Option<Device>,
    /// Statuses from the last peer list exactly as the platform sent them.
    reported_status: HashMap<DeviceAddress, DeviceStatus>,
    /// Group info received before the counterpart was known.
    pending_group: Option<ConnectionInfo>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            state: SessionState::default(),
            dispatcher: Dispatcher::new(),
            radio_reported: false,
            discovering: false,
            channel_lost: false,
            reported_connected: None,
            reported_status: HashMap::new(),
            pending_group: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Open the platform channel. Call once when the session begins.
    pub fn start(&mut self) -> Vec<Output> {
        self.step(|m, out| {
            info!("session starting");
            m.issue(RequestKind::Initialize, Origin::Internal, out);
        })
    }

    pub fn handle_event(&mut self, event: Event) -> Vec<Output> {
        self.step(|m, out| match event {
            Event::RadioStateChanged { enabled } => m.on_radio_state_changed(enabled, out),
            Event::PeersChanged => m.query_peers(out),
            Event::ConnectionChanged { connected } => m.on_connection_changed(connected, out),
            Event::SelfDeviceChanged { device } => {
                debug!(address = %device.address, "this device changed");
                m.state.this_device = Some(device);
            }
            Event::ChannelLost => m.on_channel_lost(out),
            Event::ActionSucceeded { request } => m.on_action_succeeded(request, out),
            Event::ActionFailed { request, reason } => m.on_action_failed(request, reason, out),
            Event::PeersAvailable { request, peers } => m.on_peers_available(request, peers),
            Event::ConnectionInfoAvailable { request, info } => {
                m.on_connection_info(request, info, out)
            }
        })
    }

    pub fn handle_command(&mut self, command: UserCommand) -> Vec<Output> {
        match command {
            UserCommand::DiscoverPeers => self.discover_peers(),
            UserCommand::Connect { device, config } => self.connect(device, config),
            UserCommand::CancelConnect => self.cancel_connect(),
            UserCommand::RemoveGroup => self.remove_group(),
        }
    }

    pub fn discover_peers(&mut self) -> Vec<Output> {
        self.step(|m, out| {
            if !m.usable(out) {
                return;
            }
            if !m.state.radio_enabled {
                out.push(transient(P2P_OFF_WARNING));
                return;
            }
            m.issue(RequestKind::DiscoverPeers, Origin::User, out);
        })
    }

    pub fn connect(&mut self, device: Device, config: ConnectConfig) -> Vec<Output> {
        self.step(|m, out| {
            if !m.usable(out) {
                return;
            }
            if !m.state.radio_enabled {
                out.push(transient(P2P_OFF_WARNING));
                return;
            }
            if let Err(e) = config.validate(&device) {
                out.push(transient(e.to_string()));
                return;
            }
            if let Some(current) = m.state.connection.peer() {
                out.push(transient(format!(
                    "Already connecting or connected to {}",
                    current.name
                )));
                return;
            }
            let request = m.dispatcher.issue(
                RequestKind::Connect {
                    device: device.clone(),
                    config,
                },
                Origin::User,
            );
            info!(target_device = %device.address, request = %request.id, "connecting");
            m.state.connection = ConnectionState::Connecting {
                target: device,
                attempt: request.id,
            };
            out.push(Output::Request(request));
        })
    }

    /// Abort the current attempt, or leave the group if already connected.
    /// With nothing selected this falls back to leaving any group.
    pub fn cancel_connect(&mut self) -> Vec<Output> {
        self.step(|m, out| {
            if !m.usable(out) {
                return;
            }
            let status = match &m.state.connection {
                ConnectionState::Connected { .. } => DeviceStatus::Connected,
                ConnectionState::Connecting { target, .. }
                | ConnectionState::Failed { target, .. } => m.reported_status_of(target),
                ConnectionState::Disconnected => {
                    debug!("cancel with no target; removing group");
                    DeviceStatus::Connected
                }
            };
            match status {
                DeviceStatus::Connected => {
                    m.issue(RequestKind::RemoveGroup, Origin::User, out);
                }
                DeviceStatus::Available | DeviceStatus::Invited => {
                    m.issue(RequestKind::CancelConnect, Origin::User, out);
                }
                DeviceStatus::Failed | DeviceStatus::Unavailable => {
                    debug!(%status, "cancel ignored for target status");
                }
            }
        })
    }

    /// Leave the current group. The reset itself arrives as ConnectionChanged(false).
    pub fn remove_group(&mut self) -> Vec<Output> {
        self.step(|m, out| {
            if m.usable(out) {
                m.issue(RequestKind::RemoveGroup, Origin::User, out);
            }
        })
    }

    /// Ask the platform for its peer list. Same path as a PeersChanged broadcast.
    pub fn request_peers(&mut self) -> Vec<Output> {
        self.step(|m, out| m.query_peers(out))
    }

    /// Ask the platform for group info. Same path as a ConnectionChanged(true) broadcast.
    pub fn request_connection_info(&mut self) -> Vec<Output> {
        self.step(|m, out| m.query_connection_info(out))
    }

    fn on_radio_state_changed(&mut self, enabled: bool, out: &mut Vec<Output>) {
        let was_enabled = self.radio_reported && self.state.radio_enabled;
        self.radio_reported = true;
        self.state.radio_enabled = enabled;
        info!(enabled, "p2p state changed");
        if enabled {
            if self.channel_lost && !was_enabled {
                info!("radio toggled after channel loss; reinitializing");
                self.channel_lost = false;
                self.issue(RequestKind::Initialize, Origin::Internal, out);
            }
            return;
        }
        self.reset_session_data();
        self.dispatcher.invalidate(&[
            RequestTag::DiscoverPeers,
            RequestTag::Connect,
            RequestTag::ConnectionInfo,
            RequestTag::Peers,
        ]);
    }

    fn query_peers(&mut self, out: &mut Vec<Output>) {
        if self.channel_lost || !self.state.radio_enabled {
            debug!("peer query skipped");
            return;
        }
        self.issue(RequestKind::RequestPeers, Origin::Internal, out);
    }

    fn query_connection_info(&mut self, out: &mut Vec<Output>) {
        if self.channel_lost || !self.state.radio_enabled {
            debug!("connection info query skipped");
            return;
        }
        self.issue(RequestKind::RequestConnectionInfo, Origin::Internal, out);
    }

    fn on_connection_changed(&mut self, connected: bool, out: &mut Vec<Output>) {
        if self.channel_lost {
            debug!(connected, "connection change ignored after channel loss");
            return;
        }
        if connected {
            self.query_connection_info(out);
            return;
        }
        info!("p2p disconnected");
        self.reset_session_data();
        self.dispatcher.invalidate(&[
            RequestTag::Connect,
            RequestTag::ConnectionInfo,
            RequestTag::Peers,
        ]);
        if self.state.radio_enabled {
            self.issue(RequestKind::DiscoverPeers, Origin::Internal, out);
        }
    }

    fn on_channel_lost(&mut self, out: &mut Vec<Output>) {
        if self.channel_lost {
            debug!("channel loss repeated after fatal loss");
            return;
        }
        self.reset_session_data();
        match self.dispatcher.on_channel_lost() {
            ChannelLoss::Retry(request) => {
                warn!(request = %request.id, "channel lost; retrying once");
                out.push(Output::Notify(Notification::Notice(
                    CHANNEL_RETRY_NOTICE.to_string(),
                )));
                out.push(Output::Request(request));
            }
            ChannelLoss::Fatal => {
                error!("channel lost permanently");
                self.channel_lost = true;
                out.push(Output::Notify(Notification::FatalChannelLoss));
            }
        }
    }

    fn on_action_succeeded(&mut self, id: RequestId, out: &mut Vec<Output>) {
        let Some(done) = self.dispatcher.complete(id) else {
            debug!(request = %id, "stale success ignored");
            return;
        };
        match done.tag {
            RequestTag::DiscoverPeers => {
                if self.state.radio_enabled {
                    self.discovering = true;
                }
                if done.origin == Origin::User {
                    out.push(notice("Discovery Initiated"));
                }
            }
            RequestTag::Connect => match &self.state.connection {
                ConnectionState::Connecting { attempt, .. } if *attempt == id => {
                    debug!(request = %id, "connect accepted; waiting for group");
                }
                _ => debug!(request = %id, "late connect success ignored"),
            },
            RequestTag::CancelConnect => {
                out.push(notice("Aborting connection"));
                if matches!(
                    self.state.connection,
                    ConnectionState::Connecting { .. } | ConnectionState::Failed { .. }
                ) {
                    self.state.connection = ConnectionState::Disconnected;
                    self.dispatcher.invalidate(&[RequestTag::Connect]);
                }
            }
            RequestTag::RemoveGroup => debug!(request = %id, "group removal accepted"),
            RequestTag::Initialize => info!(request = %id, "channel initialized"),
            RequestTag::ConnectionInfo | RequestTag::Peers => {
                warn!(request = %id, tag = ?done.tag, "query completed without a result")
            }
        }
    }

    fn on_action_failed(&mut self, id: RequestId, reason: FailureReason, out: &mut Vec<Output>) {
        let Some(done) = self.dispatcher.complete(id) else {
            debug!(request = %id, %reason, "stale failure ignored");
            return;
        };
        if done.tag == RequestTag::Connect {
            if let ConnectionState::Connecting { target, attempt } = &self.state.connection {
                if *attempt == id {
                    self.state.connection = ConnectionState::Failed {
                        target: target.clone(),
                        reason,
                    };
                }
            }
        }
        if done.origin == Origin::User {
            out.push(transient(dispatch::failure_message(done.tag, reason)));
        } else {
            warn!(request = %id, tag = ?done.tag, %reason, "internal request failed");
        }
    }

    fn on_peers_available(&mut self, id: RequestId, peers: Vec<Device>) {
        match self.dispatcher.complete(id) {
            Some(done) if done.tag == RequestTag::Peers => {}
            Some(done) => {
                warn!(request = %id, tag = ?done.tag, "peer list for a non-peer request");
                return;
            }
            None => {
                debug!(request = %id, "stale peer list ignored");
                return;
            }
        }
        self.dispatcher.discard_older(RequestTag::Peers, id);
        if self.channel_lost || !self.state.radio_enabled {
            return;
        }
        debug!(count = peers.len(), "peer list replaced");

        // Prefer the device we are already dealing with if several claim CONNECTED.
        let target = self.state.connection.peer().map(|d| d.address);
        self.reported_connected = peers
            .iter()
            .filter(|d| d.status == DeviceStatus::Connected)
            .max_by_key(|d| Some(d.address) == target)
            .cloned();
        self.reported_status = peers.iter().map(|d| (d.address, d.status)).collect();

        if let ConnectionState::Connected { peer, .. } = &mut self.state.connection {
            if let Some(fresh) = peers.iter().find(|d| d.address == peer.address) {
                *peer = fresh.with_status(DeviceStatus::Connected);
            }
        }
        self.state.peers.replace_all(peers);

        if let (Some(info), Some(device)) = (self.pending_group, self.reported_connected.clone()) {
            self.enter_connected(device, info);
        }
    }

    fn on_connection_info(&mut self, id: RequestId, info: ConnectionInfo, out: &mut Vec<Output>) {
        if self.dispatcher.complete(id).is_none() {
            debug!(request = %id, "stale connection info ignored");
            return;
        }
        if self.channel_lost || !self.state.radio_enabled {
            return;
        }
        if !info.group_formed {
            debug!("connection info without a formed group");
            return;
        }
        let counterpart = self
            .state
            .connection
            .peer()
            .cloned()
            .or_else(|| self.reported_connected.clone());
        match counterpart {
            Some(device) => self.enter_connected(device, info),
            None => {
                debug!("group formed with unknown peer; refreshing peer list");
                self.pending_group = Some(info);
                self.query_peers(out);
            }
        }
    }

    fn enter_connected(&mut self, device: Device, info: ConnectionInfo) {
        info!(
            peer = %device.address,
            group_owner = info.is_group_owner,
            owner_address = ?info.group_owner_address,
            "connected"
        );
        self.pending_group = None;
        self.dispatcher.invalidate(&[RequestTag::Connect]);
        self.state.connection = ConnectionState::Connected {
            peer: device.with_status(DeviceStatus::Connected),
            info,
        };
    }

    fn reset_session_data(&mut self) {
        self.state.peers.clear();
        self.state.connection = ConnectionState::Disconnected;
        self.discovering = false;
        self.reported_connected = None;
        self.reported_status.clear();
        self.pending_group = None;
    }

    /// Target status as last reported by the platform, not as normalized in the peer set.
    fn reported_status_of(&self, target: &Device) -> DeviceStatus {
        self.reported_status
            .get(&target.address)
            .copied()
            .unwrap_or(target.status)
    }

    /// False (with a warning pushed) once the channel is gone for good.
    fn usable(&self, out: &mut Vec<Output>) -> bool {
        if self.channel_lost {
            out.push(transient(CHANNEL_LOST_WARNING));
            return false;
        }
        true
    }

    fn issue(&mut self, kind: RequestKind, origin: Origin, out: &mut Vec<Output>) {
        let request = self.dispatcher.issue(kind, origin);
        debug!(request = %request.id, tag = ?request.kind.tag(), "request issued");
        out.push(Output::Request(request));
    }

    /// Run one transition, then restore invariants and report a state change if any.
    fn step(&mut self, f: impl FnOnce(&mut Self, &mut Vec<Output>)) -> Vec<Output> {
        let span = tracing::debug_span!("session", id = %self.id);
        let _enter = span.enter();
        let before = self.state.clone();
        let mut out = Vec::new();
        f(self, &mut out);
        self.reconcile();
        if self.state != before {
            out.push(Output::Notify(Notification::StateChanged(self.state.clone())));
        }
        out
    }

    fn reconcile(&mut self) {
        if !self.state.radio_enabled {
            self.state.peers.clear();
            self.state.connection = ConnectionState::Disconnected;
        }
        let peer = match &self.state.connection {
            ConnectionState::Connected { peer, .. } => Some(peer.clone()),
            _ => None,
        };
        self.state.peers.reconcile_connected(peer.as_ref());
        self.state.channel_retry_used = self.dispatcher.channel_retry_used();
        self.state.phase = self.derive_phase();
    }

    fn derive_phase(&self) -> Phase {
        if self.channel_lost {
            return Phase::ChannelLost;
        }
        if !self.radio_reported {
            return Phase::Idle;
        }
        if !self.state.radio_enabled {
            return Phase::RadioOff;
        }
        match self.state.connection {
            ConnectionState::Connected { .. } => Phase::Connected,
            ConnectionState::Connecting { .. } => Phase::Connecting,
            _ if self.discovering => Phase::Discovering,
            _ => Phase::RadioOn,
        }
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn transient(message: impl Into<String>) -> Output {
    Output::Notify(Notification::TransientError(message.into()))
}

fn notice(message: impl Into<String>) -> Output {
    Output::Notify(Notification::Notice(message.into()))
}
