//! Runtime settings for discovery, sessions and polling.
//!
//! All durations are given in milliseconds when read from YAML:
//!
//! ```yaml
//! listen_port: 4882
//! probe_timeout: 2000
//! poll_interval: 5000
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::util::packet::{DEVICE_PORT, LISTEN_PORT};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Port the device listens on.
    pub device_port: u16,
    /// Local port the device answers to. Must be free on this host.
    pub listen_port: u16,
    pub broadcast_address: Ipv4Addr,

    #[serde(with = "duration_millis")]
    pub discovery_timeout: Duration,
    /// Delay before the discovery query is repeated.
    #[serde(with = "duration_millis")]
    pub rebroadcast_delay: Duration,

    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,
    /// Length of a single receive attempt while waiting for a probe reply.
    #[serde(with = "duration_millis")]
    pub probe_slice: Duration,

    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Effect speed used until the caller picks one, 1..=100.
    pub default_speed: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            device_port: DEVICE_PORT,
            listen_port: LISTEN_PORT,
            broadcast_address: Ipv4Addr::BROADCAST,
            discovery_timeout: Duration::from_secs(5),
            rebroadcast_delay: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(2),
            probe_slice: Duration::from_millis(500),
            poll_interval: Duration::from_secs(5),
            default_speed: 80,
        }
    }
}

impl ControlConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}

mod duration_millis {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: u64 = Deserialize::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
