//! Inputs to the session: platform notifications, request completions, user commands.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{ConnectConfig, ConnectionInfo, Device};
use crate::dispatch::RequestId;

/// Reason a platform request was rejected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    Error,
    P2pUnsupported,
    Busy,
    NoServiceRequests,
    Other(i32),
}

impl FailureReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FailureReason::Error,
            1 => FailureReason::P2pUnsupported,
            2 => FailureReason::Busy,
            3 => FailureReason::NoServiceRequests,
            c => FailureReason::Other(c),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            FailureReason::Error => 0,
            FailureReason::P2pUnsupported => 1,
            FailureReason::Busy => 2,
            FailureReason::NoServiceRequests => 3,
            FailureReason::Other(c) => c,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Error => write!(f, "internal error"),
            FailureReason::P2pUnsupported => write!(f, "p2p unsupported"),
            FailureReason::Busy => write!(f, "framework busy"),
            FailureReason::NoServiceRequests => write!(f, "no service requests"),
            FailureReason::Other(c) => write!(f, "code {}", c),
        }
    }
}

/// Everything the platform can deliver. Arrives unordered; may be duplicated or late.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// P2P radio enabled or disabled.
    RadioStateChanged { enabled: bool },
    /// The platform's peer list changed; contents must be requested.
    PeersChanged,
    /// Group connectivity changed.
    ConnectionChanged { connected: bool },
    /// This device's own details changed.
    SelfDeviceChanged { device: Device },
    /// Channel to the platform service died.
    ChannelLost,
    /// A request was accepted by the platform.
    ActionSucceeded { request: RequestId },
    /// A request was rejected by the platform.
    ActionFailed {
        request: RequestId,
        reason: FailureReason,
    },
    /// Result of a peer-list request.
    PeersAvailable {
        request: RequestId,
        peers: Vec<Device>,
    },
    /// Result of a connection-info request.
    ConnectionInfoAvailable {
        request: RequestId,
        info: ConnectionInfo,
    },
}

/// User-initiated operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserCommand {
    DiscoverPeers,
    Connect {
        device: Device,
        config: ConnectConfig,
    },
    CancelConnect,
    RemoveGroup,
}
