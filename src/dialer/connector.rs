//! Connectors perform a single connection attempt

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::Target;

/// One attempt at reaching a target, with no retrying of its own
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, target: &Target) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP connect with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct DirectConnector {
    connect_timeout: Duration,
}

impl DirectConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Connector for DirectConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> io::Result<TcpStream> {
        debug!("Connecting directly to {}", target);

        let stream = timeout(self.connect_timeout, TcpStream::connect(target.host_port()))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", target, self.connect_timeout),
                )
            })??;

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
