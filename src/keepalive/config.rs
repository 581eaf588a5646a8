//! Probe Configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// What a [`KeepaliveConnection`](super::KeepaliveConnection) does with a
/// read or write error once the probe has been attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Hand the original error back to the caller
    #[default]
    Retry,
    /// Pretend the operation succeeded
    Ignore,
    /// Raise a fatal fault for the supervisor to act on
    Fatal,
}

/// Result of applying an [`ErrorPolicy`] to a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Propagate,
    Suppress,
    Terminate,
}

impl ErrorPolicy {
    pub fn outcome(self) -> PolicyOutcome {
        match self {
            ErrorPolicy::Retry => PolicyOutcome::Propagate,
            ErrorPolicy::Ignore => PolicyOutcome::Suppress,
            ErrorPolicy::Fatal => PolicyOutcome::Terminate,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorPolicy::Retry => "retry",
            ErrorPolicy::Ignore => "ignore",
            ErrorPolicy::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(ErrorPolicy::Retry),
            "ignore" => Ok(ErrorPolicy::Ignore),
            "fatal" => Ok(ErrorPolicy::Fatal),
            other => bail!("unknown error policy '{}': expected retry, ignore or fatal", other),
        }
    }
}

/// Null-packet probing parameters, fixed for the lifetime of a connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    pub size: usize,
    pub error_policy: ErrorPolicy,
}

impl ProbeConfig {
    /// Probing turned off; the wrapper becomes a pass-through.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Cadence the probe timer actually runs at.
    pub fn effective_interval(&self) -> Duration {
        self.interval.min(self.min_interval)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(5),
            size: 1,
            error_policy: ErrorPolicy::Retry,
        }
    }
}
