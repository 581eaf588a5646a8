//! SOCKS5 relay connector

use std::io;

use tokio::net::TcpStream;
use tracing::debug;

use super::Socks5Handler;
use crate::dialer::{Connector, Target};

/// Credentials for a relay that requires username/password auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAuth {
    pub username: String,
    pub password: String,
}

/// Reaches targets through a fixed SOCKS5 relay
///
/// The relay may be named by hostname; it is resolved on every connect.
#[derive(Debug, Clone)]
pub struct Socks5Connector {
    relay: Target,
    auth: Option<RelayAuth>,
}

impl Socks5Connector {
    pub fn new(relay: impl Into<Target>) -> Self {
        Self {
            relay: relay.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<RelayAuth>) -> Self {
        self.auth = auth;
        self
    }

    pub fn relay(&self) -> &Target {
        &self.relay
    }
}

impl Connector for Socks5Connector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> io::Result<TcpStream> {
        debug!("Connecting to {} via SOCKS5 relay {}", target, self.relay);

        let stream = TcpStream::connect(self.relay.host_port()).await?;
        stream.set_nodelay(true)?;

        let mut handler = Socks5Handler::new(stream);
        let credentials = self
            .auth
            .as_ref()
            .map(|auth| (auth.username.as_str(), auth.password.as_str()));
        let reply = handler.connect(target, credentials).await?;

        debug!(
            "SOCKS5 relay {} bound {}:{} for {}",
            self.relay, reply.bind_addr, reply.bind_port, target
        );
        Ok(handler.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal relay: accepts no-auth, answers CONNECT, then echoes
    async fn spawn_fake_relay(reply_code: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            // VER CMD RSV ATYP(domain) LEN
            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            stream
                .write_all(&[0x05, reply_code, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_through_relay() {
        let relay = spawn_fake_relay(0x00).await;
        let connector = Socks5Connector::new(relay);

        let mut stream = connector
            .connect(&Target::parse("origin.test:80").unwrap())
            .await
            .unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_relay_named_by_hostname() {
        let relay = spawn_fake_relay(0x00).await;
        let named = Target::parse(&format!("localhost:{}", relay.port())).unwrap();
        let connector = Socks5Connector::new(named.clone());
        assert_eq!(connector.relay(), &named);

        let mut stream = connector
            .connect(&Target::parse("origin.test:80").unwrap())
            .await
            .unwrap();

        stream.write_all(b"named").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"named");
    }

    #[tokio::test]
    async fn test_relay_refusal_is_an_io_error() {
        let relay = spawn_fake_relay(0x05).await;
        let connector = Socks5Connector::new(relay);

        let err = connector
            .connect(&Target::parse("origin.test:80").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
