//! Keepalive Module
//!
//! Wraps upstream connections with periodic null-packet probing and a
//! configurable policy for read/write failures.

pub mod classify;
pub mod config;
pub mod connection;
mod gate;
pub mod stats;
mod timer;

pub use classify::{ErrorClass, NetworkCondition};
pub use config::{ErrorPolicy, PolicyOutcome, ProbeConfig};
pub use connection::KeepaliveConnection;
pub use stats::{KeepaliveStats, KeepaliveStatsSnapshot};
