//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanchat_core::{CLEANUP_INTERVAL, DISCOVERY_PORT, EXPIRY_FACTOR, HEARTBEAT_INTERVAL, TRANSPORT_PORT};
use serde::Deserialize;

/// Node configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_USERNAME, LANCHAT_DISCOVERY_PORT, LANCHAT_TRANSPORT_PORT, LANCHAT_BROADCAST_ADDR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to peers (default: host name).
    #[serde(default = "default_username")]
    pub username: String,
    /// Discovery UDP port (default 5000).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port, both listened on and dialled (default 5001).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Heartbeat destination (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Ignore heartbeats whose source is one of this host's interface addresses.
    #[serde(default = "default_filter_self")]
    pub filter_self: bool,
    /// Capacity of the event queue handed to the front-end.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_username() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "User".to_string())
}
fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_transport_port() -> u16 {
    TRANSPORT_PORT
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL.as_millis() as u64
}
fn default_cleanup_interval_ms() -> u64 {
    CLEANUP_INTERVAL.as_millis() as u64
}
fn default_filter_self() -> bool {
    true
}
fn default_event_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: default_username(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            broadcast_addr: default_broadcast_addr(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            filter_self: default_filter_self(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// A peer silent for longer than this is declared lost.
    pub fn peer_expiry(&self) -> Duration {
        self.heartbeat_interval() * EXPIRY_FACTOR
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = load_file(explicit).unwrap_or_default();
    if let Ok(s) = std::env::var("LANCHAT_USERNAME") {
        if !s.is_empty() {
            c.username = s;
        }
    }
    override_from_env("LANCHAT_DISCOVERY_PORT", &mut c.discovery_port);
    override_from_env("LANCHAT_TRANSPORT_PORT", &mut c.transport_port);
    override_from_env("LANCHAT_BROADCAST_ADDR", &mut c.broadcast_addr);
    c
}

fn override_from_env<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(s) = std::env::var(var) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("ignoring invalid {}={:?}", var, s),
        }
    }
}

fn config_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p.to_path_buf()];
    }
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file(explicit: Option<&Path>) -> Option<Config> {
    for p in config_paths(explicit) {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => {
                        tracing::debug!("loaded config from {}", p.display());
                        return Some(c);
                    }
                    Err(e) => tracing::warn!("ignoring config {}: {}", p.display(), e),
                },
                Err(e) => tracing::warn!("cannot read config {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}
