//! Keepalive Proxy Library
//!
//! Resilient upstream connections for a forward proxy: a dialer that keeps
//! retrying with linear backoff, and a connection wrapper that keeps idle
//! upstreams warm with null packets and applies a configurable error policy.

pub mod config;
pub mod dialer;
pub mod error;
pub mod keepalive;
pub mod proxy;
pub mod shutdown;
pub mod socks;
pub mod supervisor;

pub use config::Config;
pub use dialer::{ResilientDialer, RetryPolicy, Target};
pub use error::{DialError, FatalFault};
pub use keepalive::{ErrorPolicy, KeepaliveConnection, ProbeConfig};
pub use proxy::ProxyServer;
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{FaultReporter, FaultSupervisor};

/// Common error type for the proxy server
pub type Result<T> = anyhow::Result<T>;
