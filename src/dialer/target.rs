//! Dial Targets

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DialError;

/// Host part of a dial target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Create from socket address
    pub fn from_socket_addr(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => TargetAddr::Ipv4(*v4.ip()),
            SocketAddr::V6(v6) => TargetAddr::Ipv6(*v6.ip()),
        }
    }

    fn from_host(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => TargetAddr::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => TargetAddr::Ipv6(ip),
            Err(_) => TargetAddr::Domain(host.to_string()),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "[{}]", ip),
            TargetAddr::Domain(domain) => f.write_str(domain),
        }
    }
}

/// A `host:port` pair handed to the dialer
///
/// Serialized as its `host:port` string; a port is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
    pub addr: TargetAddr,
    pub port: u16,
}

impl Target {
    pub fn new(addr: TargetAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parse `host:port`, `[v6]:port` or a bare host with `default_port`.
    pub fn parse_with_default(input: &str, default_port: u16) -> Result<Self, DialError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DialError::InvalidTarget(input.to_string()));
        }

        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self::from(addr));
        }

        // Bracketed IPv6 without a port, or with one that failed to parse above
        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| DialError::InvalidTarget(input.to_string()))?;
            let ip = host
                .parse::<Ipv6Addr>()
                .map_err(|_| DialError::InvalidTarget(input.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, input)?,
                None if tail.is_empty() => default_port,
                None => return Err(DialError::InvalidTarget(input.to_string())),
            };
            return Ok(Self::new(TargetAddr::Ipv6(ip), port));
        }

        // A bare IPv6 literal has several colons and no port
        if let Ok(ip) = input.parse::<Ipv6Addr>() {
            return Ok(Self::new(TargetAddr::Ipv6(ip), default_port));
        }

        match input.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                Ok(Self::new(TargetAddr::from_host(host), parse_port(port, input)?))
            }
            Some(_) => Err(DialError::InvalidTarget(input.to_string())),
            None => Ok(Self::new(TargetAddr::from_host(input), default_port)),
        }
    }

    /// Parse a target that must carry an explicit port.
    pub fn parse(input: &str) -> Result<Self, DialError> {
        let target = Self::parse_with_default(input, 0)?;
        if target.port == 0 {
            return Err(DialError::InvalidTarget(input.to_string()));
        }
        Ok(target)
    }

    /// Host and port in the form `tokio::net::lookup_host` accepts.
    pub fn host_port(&self) -> String {
        self.to_string()
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, DialError> {
    port.parse::<u16>()
        .map_err(|_| DialError::InvalidTarget(input.to_string()))
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self::new(TargetAddr::from_socket_addr(&addr), addr.port())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for Target {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Target {
    type Error = DialError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}
