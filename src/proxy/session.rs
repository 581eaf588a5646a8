//! Proxy Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dialer::Target;
use crate::keepalive::KeepaliveStatsSnapshot;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Both sides closed
    Closed,
    /// No traffic for the idle timeout
    Idle,
    /// Server shutdown
    Shutdown,
    /// A read or write failed
    Error,
}

/// One client request being served
#[derive(Debug)]
pub struct ProxySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target: Target,
    pub method: String,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Statistics for a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target: String,
    pub method: String,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub end: SessionEnd,
    pub keepalive: Option<KeepaliveStatsSnapshot>,
}

impl ProxySession {
    pub fn new(client_addr: SocketAddr, target: Target, method: impl Into<String>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let method = method.into();
        debug!(
            "Creating proxy session {} ({} {} from {})",
            session_id, method, target, client_addr
        );

        Self {
            session_id,
            client_addr,
            target,
            method,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes sent from the client to the target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes sent from the target to the client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn to_stats(&self, end: SessionEnd, keepalive: Option<KeepaliveStatsSnapshot>) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            target: self.target.to_string(),
            method: self.method.clone(),
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            end,
            keepalive,
        }
    }

    /// Log session statistics
    pub fn log_stats(&self, stats: &SessionStats) {
        let (probes_sent, probes_failed) = stats
            .keepalive
            .as_ref()
            .map(|k| (k.probes_sent, k.probes_failed))
            .unwrap_or_default();

        info!(
            session_id = %stats.session_id,
            client_addr = %stats.client_addr,
            upstream = %stats.target,
            method = %stats.method,
            duration_ms = stats.duration_ms,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            probes_sent,
            probes_failed,
            end = ?stats.end,
            "Proxy session completed"
        );
    }
}
