//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::dialer::{RetryPolicy, Target};
use crate::keepalive::ProbeConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryPolicy,
    pub probe: ProbeConfig,
}

/// HTTP proxy front-end configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub keepalive: bool,
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    pub max_idle_conns: usize,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// How long shutdown waits for open sessions
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Where upstream connections go
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// SOCKS5 relay as `host:port`; hostnames are resolved per connect
    pub socks_addr: Target,
    /// Dial targets directly instead of through the SOCKS5 relay
    pub pure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ServerConfig {
    /// How long a tunnel may sit without traffic before it is torn down
    pub fn tunnel_idle_timeout(&self) -> Duration {
        if self.keepalive {
            self.keepalive_timeout
        } else {
            self.read_timeout
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            keepalive: true,
            keepalive_timeout: Duration::from_secs(60),
            max_idle_conns: 100,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            socks_addr: Target::from(SocketAddr::from(([127, 0, 0, 1], 1081))),
            pure: false,
            username: None,
            password: None,
        }
    }
}
