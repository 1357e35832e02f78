//! Outbound requests: ids, pending table, stale detection, channel-loss retry policy.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{ConnectConfig, Device};
use crate::event::FailureReason;

/// Identifies one outbound request. Monotonically increasing within a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        RequestId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Platform call to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Initialize,
    DiscoverPeers,
    Connect {
        device: Device,
        config: ConnectConfig,
    },
    CancelConnect,
    RemoveGroup,
    RequestConnectionInfo,
    RequestPeers,
}

impl RequestKind {
    pub fn tag(&self) -> RequestTag {
        match self {
            RequestKind::Initialize => RequestTag::Initialize,
            RequestKind::DiscoverPeers => RequestTag::DiscoverPeers,
            RequestKind::Connect { .. } => RequestTag::Connect,
            RequestKind::CancelConnect => RequestTag::CancelConnect,
            RequestKind::RemoveGroup => RequestTag::RemoveGroup,
            RequestKind::RequestConnectionInfo => RequestTag::ConnectionInfo,
            RequestKind::RequestPeers => RequestTag::Peers,
        }
    }
}

/// Payload-free request discriminant, kept in the pending table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RequestTag {
    Initialize,
    DiscoverPeers,
    Connect,
    CancelConnect,
    RemoveGroup,
    ConnectionInfo,
    Peers,
}

/// Who asked. Internal requests never surface failures to the observer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Origin {
    User,
    Internal,
}

/// An issued request. The host forwards it to the platform and reports completion by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
}

impl Request {
    /// Forward this request to the matching platform call.
    pub fn dispatch_to<P: P2pPlatform + ?Sized>(&self, platform: &mut P) {
        match &self.kind {
            RequestKind::Initialize => platform.initialize(self.id),
            RequestKind::DiscoverPeers => platform.discover_peers(self.id),
            RequestKind::Connect { device, config } => platform.connect(self.id, device, config),
            RequestKind::CancelConnect => platform.cancel_connect(self.id),
            RequestKind::RemoveGroup => platform.remove_group(self.id),
            RequestKind::RequestConnectionInfo => platform.request_connection_info(self.id),
            RequestKind::RequestPeers => platform.request_peers(self.id),
        }
    }
}

/// Platform P2P service. Every call is fire-and-forget; the result comes back later
/// as an [`Event`](crate::Event) carrying the same [`RequestId`].
pub trait P2pPlatform {
    /// (Re)open the channel to the platform service.
    fn initialize(&mut self, id: RequestId);
    fn discover_peers(&mut self, id: RequestId);
    fn connect(&mut self, id: RequestId, device: &Device, config: &ConnectConfig);
    fn cancel_connect(&mut self, id: RequestId);
    fn remove_group(&mut self, id: RequestId);
    /// Answered with `ConnectionInfoAvailable`.
    fn request_connection_info(&mut self, id: RequestId);
    /// Answered with `PeersAvailable`.
    fn request_peers(&mut self, id: RequestId);
    /// Release the channel. Called once when the session ends.
    fn teardown(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    tag: RequestTag,
    origin: Origin,
}

/// A pending request that has just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub tag: RequestTag,
    pub origin: Origin,
}

/// Result of reporting a channel loss to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLoss {
    /// First loss: re-initialize once with this request.
    Retry(Request),
    /// Retry already spent.
    Fatal,
}

/// Tracks outstanding requests so completions can be matched or dropped as stale.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_id: u64,
    pending: HashMap<RequestId, Pending>,
    channel_retry_used: bool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and record the request as pending.
    pub fn issue(&mut self, kind: RequestKind, origin: Origin) -> Request {
        self.next_id = self.next_id.saturating_add(1);
        let id = RequestId(self.next_id);
        self.pending.insert(
            id,
            Pending {
                tag: kind.tag(),
                origin,
            },
        );
        Request { id, kind }
    }

    /// Take a pending request. None means the completion is stale.
    pub fn complete(&mut self, id: RequestId) -> Option<Completed> {
        self.pending.remove(&id).map(|p| Completed {
            tag: p.tag,
            origin: p.origin,
        })
    }

    /// Drop pending requests of `tag` issued before `id`; their results are superseded.
    pub fn discard_older(&mut self, tag: RequestTag, id: RequestId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|k, p| !(p.tag == tag && *k < id));
        before - self.pending.len()
    }

    /// Forget pending requests with any of `tags`. Returns how many were dropped.
    pub fn invalidate(&mut self, tags: &[RequestTag]) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| !tags.contains(&p.tag));
        before - self.pending.len()
    }

    pub fn invalidate_all(&mut self) {
        self.pending.clear();
    }

    pub fn channel_retry_used(&self) -> bool {
        self.channel_retry_used
    }

    /// The channel died: every pending request is lost. Re-initialize exactly once per session.
    pub fn on_channel_lost(&mut self) -> ChannelLoss {
        self.invalidate_all();
        if self.channel_retry_used {
            return ChannelLoss::Fatal;
        }
        self.channel_retry_used = true;
        ChannelLoss::Retry(self.issue(RequestKind::Initialize, Origin::Internal))
    }
}

/// User-visible text for a rejected request.
pub fn failure_message(tag: RequestTag, reason: FailureReason) -> String {
    match tag {
        RequestTag::DiscoverPeers => format!("Discovery Failed : {}", reason.code()),
        RequestTag::Connect => "Connect failed. Retry.".to_string(),
        RequestTag::CancelConnect => format!(
            "Connect abort request failed. Reason Code: {}",
            reason.code()
        ),
        RequestTag::RemoveGroup => format!("Disconnect failed. Reason: {}", reason.code()),
        RequestTag::Initialize => format!("Channel initialization failed: {}", reason),
        RequestTag::ConnectionInfo => format!("Connection info request failed: {}", reason),
        RequestTag::Peers => format!("Peer list request failed: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(&'static str, RequestId)>,
    }

    impl P2pPlatform for Recorder {
        fn initialize(&mut self, id: RequestId) {
            self.calls.push(("initialize", id));
        }
        fn discover_peers(&mut self, id: RequestId) {
            self.calls.push(("discover", id));
        }
        fn connect(&mut self, id: RequestId, _device: &Device, _config: &ConnectConfig) {
            self.calls.push(("connect", id));
        }
        fn cancel_connect(&mut self, id: RequestId) {
            self.calls.push(("cancel", id));
        }
        fn remove_group(&mut self, id: RequestId) {
            self.calls.push(("remove", id));
        }
        fn request_connection_info(&mut self, id: RequestId) {
            self.calls.push(("info", id));
        }
        fn request_peers(&mut self, id: RequestId) {
            self.calls.push(("peers", id));
        }
    }

    #[test]
    fn ids_increase_and_complete_once() {
        let mut d = Dispatcher::new();
        let a = d.issue(RequestKind::DiscoverPeers, Origin::User);
        let b = d.issue(RequestKind::RequestPeers, Origin::Internal);
        assert!(b.id > a.id);
        assert_eq!(d.pending.len(), 2);
        let done = d.complete(a.id).unwrap();
        assert_eq!(done.tag, RequestTag::DiscoverPeers);
        assert_eq!(done.origin, Origin::User);
        assert!(d.complete(a.id).is_none());
    }

    #[test]
    fn discard_older_keeps_newest() {
        let mut d = Dispatcher::new();
        let first = d.issue(RequestKind::RequestPeers, Origin::Internal);
        let other = d.issue(RequestKind::DiscoverPeers, Origin::User);
        let second = d.issue(RequestKind::RequestPeers, Origin::Internal);
        assert_eq!(d.discard_older(RequestTag::Peers, second.id), 1);
        assert!(!d.pending.contains_key(&first.id));
        assert!(d.pending.contains_key(&other.id));
        assert!(d.pending.contains_key(&second.id));
    }

    #[test]
    fn invalidate_by_tag() {
        let mut d = Dispatcher::new();
        d.issue(RequestKind::RequestPeers, Origin::Internal);
        d.issue(RequestKind::RequestConnectionInfo, Origin::Internal);
        let keep = d.issue(RequestKind::DiscoverPeers, Origin::User);
        assert_eq!(
            d.invalidate(&[RequestTag::Peers, RequestTag::ConnectionInfo]),
            2
        );
        assert!(d.pending.contains_key(&keep.id));
    }

    #[test]
    fn channel_loss_retries_once() {
        let mut d = Dispatcher::new();
        d.issue(RequestKind::DiscoverPeers, Origin::User);
        let first = d.on_channel_lost();
        let retry = match first {
            ChannelLoss::Retry(r) => r,
            ChannelLoss::Fatal => panic!("first loss should retry"),
        };
        assert_eq!(retry.kind, RequestKind::Initialize);
        assert!(d.channel_retry_used());
        // Only the re-init is pending; the discovery died with the channel.
        assert_eq!(d.pending.len(), 1);
        assert_eq!(d.on_channel_lost(), ChannelLoss::Fatal);
        assert_eq!(d.pending.len(), 0);
    }

    #[test]
    fn dispatch_routes_to_platform() {
        let mut d = Dispatcher::new();
        let mut platform = Recorder::default();
        let r = d.issue(RequestKind::CancelConnect, Origin::User);
        r.dispatch_to(&mut platform);
        let r2 = d.issue(RequestKind::RemoveGroup, Origin::User);
        r2.dispatch_to(&mut platform);
        assert_eq!(platform.calls, vec![("cancel", r.id), ("remove", r2.id)]);
    }

    #[test]
    fn failure_messages() {
        assert_eq!(
            failure_message(RequestTag::DiscoverPeers, FailureReason::Busy),
            "Discovery Failed : 2"
        );
        assert_eq!(
            failure_message(RequestTag::CancelConnect, FailureReason::Error),
            "Connect abort request failed. Reason Code: 0"
        );
        assert_eq!(
            failure_message(RequestTag::Connect, FailureReason::Busy),
            "Connect failed. Retry."
        );
    }
}
