//! Dialer Module
//!
//! Establishes upstream connections, directly or through a SOCKS5 relay,
//! retrying with linear backoff.

pub mod connector;
pub mod deadline;
pub mod resilient;
pub mod retry;
pub mod target;

pub use connector::{Connector, DirectConnector};
pub use deadline::DeadlineStream;
pub use resilient::ResilientDialer;
pub use retry::RetryPolicy;
pub use target::{Target, TargetAddr};
