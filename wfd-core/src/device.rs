//! Peer data model: device snapshots, peer set, group info, connect config.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Device capability bit: service discovery supported.
pub const DEVICE_CAPAB_SERVICE_DISCOVERY: u8 = 0x01;
/// Group capability bit: device is currently group owner.
pub const GROUP_CAPAB_GROUP_OWNER: u8 = 0x01;
/// Group capability bit: persistent group.
pub const GROUP_CAPAB_PERSISTENT_GROUP: u8 = 0x02;
/// Group capability bit: group is full.
pub const GROUP_CAPAB_GROUP_LIMIT: u8 = 0x04;

/// Highest group owner intent accepted by the platform.
pub const MAX_GROUP_OWNER_INTENT: u8 = 15;

/// P2P device address (6-byte MAC). Displayed as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        DeviceAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(AddressParseError::WrongLength)?;
            if part.len() != 2 {
                return Err(AddressParseError::InvalidOctet(part.to_string()));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::InvalidOctet(part.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError::WrongLength);
        }
        Ok(DeviceAddress(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("device address must have six octets")]
    WrongLength,
    #[error("invalid octet {0:?} in device address")]
    InvalidOctet(String),
}

/// Peer status as reported by the platform.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Connected,
    Invited,
    Failed,
    Available,
    Unavailable,
}

impl DeviceStatus {
    /// Map a platform status code. Unknown codes are treated as unavailable.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => DeviceStatus::Connected,
            1 => DeviceStatus::Invited,
            2 => DeviceStatus::Failed,
            3 => DeviceStatus::Available,
            _ => DeviceStatus::Unavailable,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DeviceStatus::Connected => 0,
            DeviceStatus::Invited => 1,
            DeviceStatus::Failed => 2,
            DeviceStatus::Available => 3,
            DeviceStatus::Unavailable => 4,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Connected => "Connected",
            DeviceStatus::Invited => "Invited",
            DeviceStatus::Failed => "Failed",
            DeviceStatus::Available => "Available",
            DeviceStatus::Unavailable => "Unavailable",
        };
        f.write_str(s)
    }
}

/// Immutable device snapshot. A newer snapshot supersedes an older one entirely.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: String,
    pub primary_type: String,
    pub device_capability: u8,
    pub group_capability: u8,
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(address: DeviceAddress, name: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            address,
            name: name.into(),
            primary_type: String::new(),
            device_capability: 0,
            group_capability: 0,
            status,
        }
    }

    /// Copy of this snapshot with a different status.
    pub fn with_status(&self, status: DeviceStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn is_group_owner(&self) -> bool {
        self.group_capability & GROUP_CAPAB_GROUP_OWNER != 0
    }

    pub fn is_service_discovery_capable(&self) -> bool {
        self.device_capability & DEVICE_CAPAB_SERVICE_DISCOVERY != 0
    }

    pub fn is_group_limit(&self) -> bool {
        self.group_capability & GROUP_CAPAB_GROUP_LIMIT != 0
    }
}

/// Known peers keyed by address. Replaced wholesale on every peer list.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerSet {
    devices: HashMap<DeviceAddress, Device>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every entry with `devices`. A later duplicate address wins.
    pub fn replace_all(&mut self, devices: Vec<Device>) {
        self.devices = devices.into_iter().map(|d| (d.address, d)).collect();
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Device> {
        self.devices.get(address)
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.devices.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices currently reported with status CONNECTED.
    pub fn connected(&self) -> impl Iterator<Item = &Device> {
        self.devices
            .values()
            .filter(|d| d.status == DeviceStatus::Connected)
    }

    /// Force the set to agree with the session's connection: only `peer` (if any)
    /// may be CONNECTED. Other CONNECTED entries are demoted to AVAILABLE.
    pub(crate) fn reconcile_connected(&mut self, peer: Option<&Device>) {
        let keep = peer.map(|p| p.address);
        for device in self.devices.values_mut() {
            if device.status == DeviceStatus::Connected && Some(device.address) != keep {
                *device = device.with_status(DeviceStatus::Available);
            }
        }
        if let Some(p) = peer {
            self.devices
                .insert(p.address, p.with_status(DeviceStatus::Connected));
        }
    }
}

/// Group information returned by a connection-info request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub group_formed: bool,
    pub is_group_owner: bool,
    pub group_owner_address: Option<Ipv4Addr>,
}

/// WPS provisioning method for a connect request.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum WpsSetup {
    #[default]
    PushButton,
    Display,
    Keypad,
    Label,
}

/// Parameters for a connect request.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub device_address: DeviceAddress,
    pub wps: WpsSetup,
    /// 0 (prefer client) ..= 15 (prefer group owner). None lets the platform decide.
    pub group_owner_intent: Option<u8>,
}

impl ConnectConfig {
    /// Push-button config for `device`, the platform default.
    pub fn for_device(device: &Device) -> Self {
        Self {
            device_address: device.address,
            wps: WpsSetup::PushButton,
            group_owner_intent: None,
        }
    }

    pub fn with_group_owner_intent(mut self, intent: u8) -> Result<Self, ConfigError> {
        if intent > MAX_GROUP_OWNER_INTENT {
            return Err(ConfigError::GroupOwnerIntent(intent));
        }
        self.group_owner_intent = Some(intent);
        Ok(self)
    }

    /// Check this config can be sent for `target`.
    pub fn validate(&self, target: &Device) -> Result<(), ConfigError> {
        if self.device_address != target.address {
            return Err(ConfigError::AddressMismatch {
                config: self.device_address,
                target: target.address,
            });
        }
        match self.group_owner_intent {
            Some(i) if i > MAX_GROUP_OWNER_INTENT => Err(ConfigError::GroupOwnerIntent(i)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("group owner intent {0} out of range (0..=15)")]
    GroupOwnerIntent(u8),
    #[error("config address {config} does not match target {target}")]
    AddressMismatch {
        config: DeviceAddress,
        target: DeviceAddress,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn address_parse_and_display() {
        let a: DeviceAddress = "de:ad:be:ef:00:1a".parse().unwrap();
        assert_eq!(a.as_bytes(), &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x1a]);
        assert_eq!(a.to_string(), "de:ad:be:ef:00:1a");
    }

    #[test]
    fn address_parse_errors() {
        assert_eq!(
            "de:ad:be:ef:00".parse::<DeviceAddress>(),
            Err(AddressParseError::WrongLength)
        );
        assert_eq!(
            "de:ad:be:ef:00:1a:22".parse::<DeviceAddress>(),
            Err(AddressParseError::WrongLength)
        );
        assert!(matches!(
            "zz:ad:be:ef:00:1a".parse::<DeviceAddress>(),
            Err(AddressParseError::InvalidOctet(_))
        ));
    }

    #[test]
    fn status_codes() {
        for s in [
            DeviceStatus::Connected,
            DeviceStatus::Invited,
            DeviceStatus::Failed,
            DeviceStatus::Available,
            DeviceStatus::Unavailable,
        ] {
            assert_eq!(DeviceStatus::from_code(s.code()), s);
        }
        assert_eq!(DeviceStatus::from_code(42), DeviceStatus::Unavailable);
    }

    #[test]
    fn replace_all_drops_previous_entries() {
        let mut peers = PeerSet::new();
        peers.replace_all(vec![
            Device::new(addr(1), "a", DeviceStatus::Available),
            Device::new(addr(2), "b", DeviceStatus::Available),
        ]);
        peers.replace_all(vec![Device::new(addr(3), "c", DeviceStatus::Invited)]);
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&addr(3)));
        assert!(!peers.contains(&addr(1)));
    }

    #[test]
    fn reconcile_keeps_single_connected() {
        let mut peers = PeerSet::new();
        peers.replace_all(vec![
            Device::new(addr(1), "a", DeviceStatus::Connected),
            Device::new(addr(2), "b", DeviceStatus::Connected),
        ]);
        let b = Device::new(addr(2), "b", DeviceStatus::Invited);
        peers.reconcile_connected(Some(&b));
        let connected: Vec<_> = peers.connected().map(|d| d.address).collect();
        assert_eq!(connected, vec![addr(2)]);
        assert_eq!(peers.get(&addr(1)).unwrap().status, DeviceStatus::Available);

        peers.reconcile_connected(None);
        assert_eq!(peers.connected().count(), 0);
    }

    #[test]
    fn connect_config_validation() {
        let d = Device::new(addr(1), "a", DeviceStatus::Available);
        let cfg = ConnectConfig::for_device(&d);
        assert_eq!(cfg.wps, WpsSetup::PushButton);
        assert!(cfg.validate(&d).is_ok());
        assert_eq!(
            cfg.clone().with_group_owner_intent(16),
            Err(ConfigError::GroupOwnerIntent(16))
        );
        let other = Device::new(addr(2), "b", DeviceStatus::Available);
        assert!(matches!(
            cfg.validate(&other),
            Err(ConfigError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn capability_flags() {
        let mut d = Device::new(addr(1), "a", DeviceStatus::Available);
        assert!(!d.is_group_owner());
        d.group_capability = GROUP_CAPAB_GROUP_OWNER | GROUP_CAPAB_PERSISTENT_GROUP;
        d.device_capability = DEVICE_CAPAB_SERVICE_DISCOVERY;
        assert!(d.is_group_owner());
        assert!(d.is_service_discovery_capable());
        assert!(!d.is_group_limit());
    }
}
