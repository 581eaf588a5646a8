//! HTTP forward proxy front-end
//!
//! Accepts `CONNECT` tunnels and absolute-form `http://` requests and sends
//! them upstream through the resilient dialer.

pub mod request;
pub mod server;
pub mod session;

pub use request::{ProxyRequest, RequestError, RequestKind};
pub use server::ProxyServer;
pub use session::{ProxySession, SessionEnd, SessionStats};
