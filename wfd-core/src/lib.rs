//! Wi-Fi Direct peer session manager.
//! Host-driven: no I/O; host passes platform events and user commands, receives outputs.

pub mod device;
pub mod dispatch;
pub mod event;
pub mod wire;

pub use device::{
    AddressParseError, ConfigError, ConnectConfig, ConnectionInfo, Device, DeviceAddress,
    DeviceStatus, PeerSet, WpsSetup,
};
pub use dispatch::{P2pPlatform, Request, RequestId, RequestKind};
pub use event::{Event, FailureReason, UserCommand};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, WIRE_VERSION};
pub use crate::core::{ConnectionState, Notification, Output, Phase, SessionMachine, SessionState};
pub use session::{Session, SessionObserver};

pub mod core;
pub mod ffi;
pub mod session;
