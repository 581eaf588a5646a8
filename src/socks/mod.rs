//! SOCKS5 Relay Client
//!
//! Client half of the SOCKS5 protocol, used to reach targets through an
//! upstream relay.

pub mod connector;
pub mod constants;
pub mod handler;

pub use connector::{RelayAuth, Socks5Connector};
pub use handler::{Socks5Handler, Socks5Reply};
