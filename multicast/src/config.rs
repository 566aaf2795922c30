//! Stable multicast configuration.
//!
//! Durations are carried as milliseconds so the config round-trips through
//! JSON unchanged.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{MulticastError, MulticastResult},
    message::MAX_DATAGRAM_SIZE,
};

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(230, 0, 0, 1);
pub const DEFAULT_DISCOVERY_PORT: u16 = 4446;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MulticastConfig {
    /// Data endpoint. Its address is what this process announces.
    pub bind: SocketAddr,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Period of the stability sweep.
    #[serde(default = "default_stability_interval_ms")]
    pub stability_interval_ms: u64,

    /// Receive buffer size and send-side payload limit.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Upper bound on group size, matrix dimension and decoded vector length.
    #[serde(default = "default_max_members")]
    pub max_members: usize,

    /// How long shutdown waits for each task before aborting it.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Presence channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Multicast group to join and announce to. `None` disables multicast and
    /// relies on `announce` alone.
    #[serde(default = "default_group")]
    pub group: Option<Ipv4Addr>,

    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Address the presence socket binds to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Interface used to join the multicast group.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Additional presence targets (unicast or broadcast).
    #[serde(default)]
    pub announce: Vec<SocketAddr>,

    #[serde(default = "default_discovery_interval_ms")]
    pub interval_ms: u64,

    /// How long each tick waits for presence before recomputing membership.
    #[serde(default = "default_listen_window_ms")]
    pub listen_window_ms: u64,

    #[serde(default = "default_multicast_loop")]
    pub multicast_loop: bool,

    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
}

fn default_stability_interval_ms() -> u64 {
    1000
}

fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

fn default_max_members() -> usize {
    1024
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

fn default_group() -> Option<Ipv4Addr> {
    Some(DEFAULT_GROUP)
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_discovery_interval_ms() -> u64 {
    2000
}

fn default_listen_window_ms() -> u64 {
    default_discovery_interval_ms() / 2
}

fn default_multicast_loop() -> bool {
    true
}

fn default_multicast_ttl() -> u32 {
    1
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_discovery_port(),
            bind_ip: default_bind_ip(),
            interface: default_interface(),
            announce: Vec::new(),
            interval_ms: default_discovery_interval_ms(),
            listen_window_ms: default_listen_window_ms(),
            multicast_loop: default_multicast_loop(),
            multicast_ttl: default_multicast_ttl(),
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms)
    }

    /// Address the presence socket binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Every destination a presence announcement goes to.
    pub fn targets(&self) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = self
            .group
            .map(|group| SocketAddr::from((group, self.port)))
            .into_iter()
            .collect();
        for addr in &self.announce {
            if !targets.contains(addr) {
                targets.push(*addr);
            }
        }
        targets
    }
}

impl MulticastConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            discovery: DiscoveryConfig::default(),
            stability_interval_ms: default_stability_interval_ms(),
            max_datagram_size: default_max_datagram_size(),
            max_members: default_max_members(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_stability_interval(mut self, interval: Duration) -> Self {
        self.stability_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = max_members;
        self
    }

    pub fn stability_interval(&self) -> Duration {
        Duration::from_millis(self.stability_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn from_json(raw: &str) -> MulticastResult<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| MulticastError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MulticastResult<()> {
        if self.bind.ip().is_unspecified() {
            return Err(MulticastError::Config(format!(
                "data address {} must be a concrete, reachable address",
                self.bind
            )));
        }
        if self.stability_interval_ms == 0 {
            return Err(MulticastError::Config(
                "stability_interval_ms must be positive".to_string(),
            ));
        }
        if self.discovery.interval_ms == 0 {
            return Err(MulticastError::Config(
                "discovery.interval_ms must be positive".to_string(),
            ));
        }
        if self.discovery.listen_window_ms >= self.discovery.interval_ms {
            return Err(MulticastError::Config(format!(
                "discovery.listen_window_ms ({}) must be shorter than discovery.interval_ms ({})",
                self.discovery.listen_window_ms, self.discovery.interval_ms
            )));
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(MulticastError::Config(format!(
                "max_datagram_size must be within 1..={}",
                MAX_DATAGRAM_SIZE
            )));
        }
        if self.max_members == 0 || self.max_members > u32::MAX as usize {
            return Err(MulticastError::Config(format!(
                "max_members must be within 1..={}",
                u32::MAX
            )));
        }
        if let Some(group) = self.discovery.group {
            if !group.is_multicast() {
                return Err(MulticastError::Config(format!(
                    "discovery.group {} is not a multicast address",
                    group
                )));
            }
        }
        if self.discovery.targets().is_empty() {
            return Err(MulticastError::Config(
                "discovery needs a multicast group or at least one announce target".to_string(),
            ));
        }
        Ok(())
    }
}
