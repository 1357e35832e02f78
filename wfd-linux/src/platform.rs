//! Platform side: channel adapter for the session, and a simulated P2P service behind it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use wfd_core::{
    ConnectConfig, ConnectionInfo, Device, DeviceAddress, DeviceStatus, Event, FailureReason,
    P2pPlatform, Request, RequestId, RequestKind,
};

use crate::runtime::HostMessage;

/// Group owner address the simulated service hands out (the platform default).
const GROUP_OWNER_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 49, 1);

/// Forwards session requests to the backend task. Never blocks the session.
pub struct ChannelPlatform {
    requests: mpsc::UnboundedSender<Request>,
}

impl ChannelPlatform {
    pub fn new(requests: mpsc::UnboundedSender<Request>) -> Self {
        Self { requests }
    }

    fn send(&mut self, id: RequestId, kind: RequestKind) {
        if self.requests.send(Request { id, kind }).is_err() {
            debug!(request = %id, "backend gone; request dropped");
        }
    }
}

impl P2pPlatform for ChannelPlatform {
    fn initialize(&mut self, id: RequestId) {
        self.send(id, RequestKind::Initialize);
    }

    fn discover_peers(&mut self, id: RequestId) {
        self.send(id, RequestKind::DiscoverPeers);
    }

    fn connect(&mut self, id: RequestId, device: &Device, config: &ConnectConfig) {
        self.send(
            id,
            RequestKind::Connect {
                device: device.clone(),
                config: config.clone(),
            },
        );
    }

    fn cancel_connect(&mut self, id: RequestId) {
        self.send(id, RequestKind::CancelConnect);
    }

    fn remove_group(&mut self, id: RequestId) {
        self.send(id, RequestKind::RemoveGroup);
    }

    fn request_connection_info(&mut self, id: RequestId) {
        self.send(id, RequestKind::RequestConnectionInfo);
    }

    fn request_peers(&mut self, id: RequestId) {
        self.send(id, RequestKind::RequestPeers);
    }
}

/// In-process stand-in for the platform P2P service. Answers each request after a fixed
/// latency and posts broadcasts and completions back onto the session queue.
pub struct SimulatedBackend {
    latency: Duration,
    radio_enabled: bool,
    this_device: Device,
    peers: Vec<Device>,
    rejecting: HashSet<DeviceAddress>,
    discovered: bool,
    /// Peer being invited and when group formation completes.
    pending: Option<(DeviceAddress, Instant)>,
    group: Option<DeviceAddress>,
    requests: mpsc::UnboundedReceiver<Request>,
    session: mpsc::Sender<HostMessage>,
}

impl SimulatedBackend {
    pub fn new(
        latency: Duration,
        radio_enabled: bool,
        this_device: Device,
        peers: Vec<(Device, bool)>,
        requests: mpsc::UnboundedReceiver<Request>,
        session: mpsc::Sender<HostMessage>,
    ) -> Self {
        let rejecting = peers
            .iter()
            .filter(|(_, reject)| *reject)
            .map(|(d, _)| d.address)
            .collect();
        Self {
            latency,
            radio_enabled,
            this_device,
            peers: peers.into_iter().map(|(d, _)| d).collect(),
            rejecting,
            discovered: false,
            pending: None,
            group: None,
            requests,
            session,
        }
    }

    /// Serve requests until the session side closes.
    pub async fn run(mut self) {
        loop {
            let formation = self.pending.map(|(_, at)| at);
            tokio::select! {
                req = self.requests.recv() => match req {
                    Some(r) => {
                        tokio::time::sleep(self.latency).await;
                        if !self.handle(r).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(formation.unwrap_or_else(Instant::now)),
                    if formation.is_some() => {
                    if !self.form_group().await {
                        break;
                    }
                }
            }
        }
        debug!("simulated backend stopped");
    }

    /// Returns false once the session queue is closed.
    async fn handle(&mut self, request: Request) -> bool {
        let id = request.id;
        debug!(request = %id, kind = ?request.kind.tag(), "backend request");
        match request.kind {
            RequestKind::Initialize => {
                self.ok(id).await
                    && self.emit(Event::RadioStateChanged { enabled: self.radio_enabled }).await
                    && self
                        .emit(Event::SelfDeviceChanged {
                            device: self.this_device.clone(),
                        })
                        .await
            }
            RequestKind::DiscoverPeers => {
                if !self.radio_enabled {
                    return self.fail(id, FailureReason::Busy).await;
                }
                self.discovered = true;
                self.ok(id).await && self.emit(Event::PeersChanged).await
            }
            RequestKind::RequestPeers => {
                let peers = if self.discovered { self.peers.clone() } else { Vec::new() };
                self.emit(Event::PeersAvailable { request: id, peers }).await
            }
            RequestKind::Connect { device, .. } => {
                let known = self.peers.iter().any(|p| p.address == device.address);
                if !known || self.rejecting.contains(&device.address) {
                    return self.fail(id, FailureReason::Error).await;
                }
                if self.pending.is_some() || self.group.is_some() {
                    return self.fail(id, FailureReason::Busy).await;
                }
                info!(peer = %device.address, "simulated invite sent");
                self.set_status(device.address, DeviceStatus::Invited);
                self.pending = Some((device.address, Instant::now() + self.latency));
                self.ok(id).await && self.emit(Event::PeersChanged).await
            }
            RequestKind::CancelConnect => match self.pending.take() {
                Some((address, _)) => {
                    self.set_status(address, DeviceStatus::Available);
                    self.ok(id).await && self.emit(Event::PeersChanged).await
                }
                None => self.fail(id, FailureReason::Busy).await,
            },
            RequestKind::RemoveGroup => match self.group.take() {
                Some(address) => {
                    self.set_status(address, DeviceStatus::Available);
                    self.ok(id).await
                        && self.emit(Event::ConnectionChanged { connected: false }).await
                        && self.emit(Event::PeersChanged).await
                }
                None => self.fail(id, FailureReason::Error).await,
            },
            RequestKind::RequestConnectionInfo => {
                let info = ConnectionInfo {
                    group_formed: self.group.is_some(),
                    is_group_owner: false,
                    group_owner_address: self.group.map(|_| GROUP_OWNER_ADDR),
                };
                self.emit(Event::ConnectionInfoAvailable { request: id, info })
                    .await
            }
        }
    }

    async fn form_group(&mut self) -> bool {
        let Some((address, _)) = self.pending.take() else {
            return true;
        };
        info!(peer = %address, "simulated group formed");
        self.set_status(address, DeviceStatus::Connected);
        self.group = Some(address);
        self.emit(Event::ConnectionChanged { connected: true }).await
            && self.emit(Event::PeersChanged).await
    }

    fn set_status(&mut self, address: DeviceAddress, status: DeviceStatus) {
        for p in self.peers.iter_mut().filter(|p| p.address == address) {
            *p = p.with_status(status);
        }
    }

    async fn ok(&self, request: RequestId) -> bool {
        self.emit(Event::ActionSucceeded { request }).await
    }

    async fn fail(&self, request: RequestId, reason: FailureReason) -> bool {
        self.emit(Event::ActionFailed { request, reason }).await
    }

    async fn emit(&self, event: Event) -> bool {
        self.session.send(HostMessage::Event(event)).await.is_ok()
    }
}
