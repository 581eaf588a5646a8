//! Keepalive Statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::ErrorClass;

/// Per-connection counters, shared between the owner and the probe task
#[derive(Debug, Default)]
pub struct KeepaliveStats {
    probes_sent: AtomicU64,
    probes_failed: AtomicU64,
    recoverable_errors: AtomicU64,
    generic_errors: AtomicU64,
    suppressed_errors: AtomicU64,
}

/// Point-in-time copy of [`KeepaliveStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveStatsSnapshot {
    pub probes_sent: u64,
    pub probes_failed: u64,
    pub recoverable_errors: u64,
    pub generic_errors: u64,
    pub suppressed_errors: u64,
}

impl KeepaliveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probe_failed(&self) {
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, class: ErrorClass) {
        let counter = if class.is_recoverable() {
            &self.recoverable_errors
        } else {
            &self.generic_errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KeepaliveStatsSnapshot {
        KeepaliveStatsSnapshot {
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            generic_errors: self.generic_errors.load(Ordering::Relaxed),
            suppressed_errors: self.suppressed_errors.load(Ordering::Relaxed),
        }
    }
}

impl KeepaliveStatsSnapshot {
    /// Probes that were attempted, whether or not they went out
    pub fn probes_attempted(&self) -> u64 {
        self.probes_sent + self.probes_failed
    }
}
