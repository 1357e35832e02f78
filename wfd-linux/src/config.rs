//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wfd_core::{AddressParseError, Device, DeviceAddress, DeviceStatus};

/// Host configuration. File: ~/.config/wfd/config.toml or /etc/wfd/config.toml.
/// Env overrides: WFD_QUEUE_CAPACITY, WFD_AUTO_DISCOVER, WFD_AUTO_CONNECT, WFD_LOG_FILTER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Capacity of the serialized session queue (default 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Start discovery whenever the radio comes on (default true).
    #[serde(default = "default_auto_discover")]
    pub auto_discover: bool,
    /// Connect to the first peer whose name or address matches.
    #[serde(default)]
    pub auto_connect: Option<String>,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Simulated P2P service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Delay before each platform response, in milliseconds (default 50).
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Radio state reported once the channel opens (default true).
    #[serde(default = "default_radio_enabled")]
    pub radio_enabled: bool,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_device_address")]
    pub device_address: String,
    #[serde(default = "default_peers")]
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub name: String,
    pub address: String,
    /// Peer refuses connections (connect is rejected by the platform).
    #[serde(default)]
    pub reject: bool,
}

fn default_queue_capacity() -> usize {
    64
}
fn default_auto_discover() -> bool {
    true
}
fn default_log_filter() -> String {
    "info".to_string()
}
fn default_latency_ms() -> u64 {
    50
}
fn default_radio_enabled() -> bool {
    true
}
fn default_device_name() -> String {
    "wfd-linux".to_string()
}
fn default_device_address() -> String {
    "02:00:00:00:00:01".to_string()
}
fn default_peers() -> Vec<PeerEntry> {
    vec![
        PeerEntry {
            name: "Android_TV".to_string(),
            address: "02:00:00:00:00:10".to_string(),
            reject: false,
        },
        PeerEntry {
            name: "Pixel".to_string(),
            address: "02:00:00:00:00:11".to_string(),
            reject: false,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            auto_discover: default_auto_discover(),
            auto_connect: None,
            log_filter: default_log_filter(),
            backend: BackendConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            radio_enabled: default_radio_enabled(),
            device_name: default_device_name(),
            device_address: default_device_address(),
            peers: default_peers(),
        }
    }
}

impl BackendConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// This device as the platform would report it.
    pub fn this_device(&self) -> Result<Device, ConfigError> {
        let address = parse_address(&self.device_address)?;
        Ok(Device::new(address, &self.device_name, DeviceStatus::Available))
    }

    /// Configured peers as available devices, with the addresses that reject connects.
    pub fn peer_devices(&self) -> Result<Vec<(Device, bool)>, ConfigError> {
        self.peers
            .iter()
            .map(|p| {
                let address = parse_address(&p.address)?;
                Ok((
                    Device::new(address, &p.name, DeviceStatus::Available),
                    p.reject,
                ))
            })
            .collect()
    }
}

fn parse_address(s: &str) -> Result<DeviceAddress, ConfigError> {
    s.parse().map_err(|source| ConfigError::Address {
        value: s.to_string(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid device address {value:?}: {source}")]
    Address {
        value: String,
        source: AddressParseError,
    },
    #[error("queue capacity must be at least 1")]
    QueueCapacity,
}

/// Load config: explicit path if given, else the first default path that exists, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    if c.queue_capacity == 0 {
        return Err(ConfigError::QueueCapacity);
    }
    // Fail early on bad addresses rather than when the backend starts.
    c.backend.this_device()?;
    c.backend.peer_devices()?;
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("WFD_QUEUE_CAPACITY") {
        if let Ok(n) = s.parse::<usize>() {
            c.queue_capacity = n;
        }
    }
    if let Some(s) = var("WFD_AUTO_DISCOVER") {
        if let Ok(b) = s.parse::<bool>() {
            c.auto_discover = b;
        }
    }
    if let Some(s) = var("WFD_AUTO_CONNECT") {
        c.auto_connect = if s.is_empty() { None } else { Some(s) };
    }
    if let Some(s) = var("WFD_LOG_FILTER") {
        c.log_filter = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wfd/config.toml"));
    }
    out.push(PathBuf::from("/etc/wfd/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
