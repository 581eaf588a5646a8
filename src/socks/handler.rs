//! SOCKS5 client-side handshake

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::*;
use crate::dialer::{Target, TargetAddr};

/// Reply to a CONNECT request
#[derive(Debug, Clone)]
pub struct Socks5Reply {
    pub reply_code: u8,
    pub bind_addr: TargetAddr,
    pub bind_port: u16,
}

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Map a relay's CONNECT failure onto the closest I/O error kind.
pub fn reply_error(reply_code: u8) -> io::Error {
    let (kind, reason) = match reply_code {
        SOCKS5_REPLY_GENERAL_FAILURE => (io::ErrorKind::Other, "general SOCKS server failure"),
        SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => {
            (io::ErrorKind::PermissionDenied, "connection not allowed by ruleset")
        }
        SOCKS5_REPLY_NETWORK_UNREACHABLE => (io::ErrorKind::NetworkUnreachable, "network unreachable"),
        SOCKS5_REPLY_HOST_UNREACHABLE => (io::ErrorKind::HostUnreachable, "host unreachable"),
        SOCKS5_REPLY_CONNECTION_REFUSED => (io::ErrorKind::ConnectionRefused, "connection refused"),
        SOCKS5_REPLY_TTL_EXPIRED => (io::ErrorKind::TimedOut, "TTL expired"),
        SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => (io::ErrorKind::Unsupported, "command not supported"),
        SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => {
            (io::ErrorKind::Unsupported, "address type not supported")
        }
        _ => (io::ErrorKind::Other, "unknown reply code"),
    };
    io::Error::new(kind, format!("SOCKS5 relay: {} (reply code {})", reason, reply_code))
}

/// Drives the client half of a SOCKS5 negotiation over `stream`
pub struct Socks5Handler<S> {
    stream: S,
}

impl<S> Socks5Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send SOCKS5 greeting
    pub async fn send_greeting(&mut self, methods: &[u8]) -> io::Result<()> {
        let mut greeting = Vec::with_capacity(2 + methods.len());
        greeting.push(SOCKS5_VERSION);
        greeting.push(methods.len() as u8);
        greeting.extend_from_slice(methods);

        self.stream.write_all(&greeting).await
    }

    /// Receive authentication method selection
    pub async fn receive_auth_method(&mut self) -> io::Result<u8> {
        let mut response = [0u8; 2];
        self.stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(protocol_error(format!(
                "Invalid SOCKS version in auth response: {}",
                response[0]
            )));
        }

        Ok(response[1])
    }

    /// Authenticate with username/password (RFC 1929)
    pub async fn authenticate_username_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> io::Result<()> {
        if username.is_empty() || username.len() > 255 || password.is_empty() || password.len() > 255 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "SOCKS5 username and password must be 1-255 bytes",
            ));
        }

        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
        auth_request.push(SOCKS5_USERPASS_VERSION);
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());

        self.stream.write_all(&auth_request).await?;

        let mut response = [0u8; 2];
        self.stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_USERPASS_VERSION {
            return Err(protocol_error(format!(
                "Invalid auth response version: {}",
                response[0]
            )));
        }

        if response[1] != SOCKS5_USERPASS_SUCCESS {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "SOCKS5 relay rejected credentials",
            ));
        }

        Ok(())
    }

    /// Send CONNECT request
    pub async fn send_connect_request(&mut self, target: &Target) -> io::Result<()> {
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, SOCKS5_RESERVED];

        match &target.addr {
            TargetAddr::Ipv4(ip) => {
                request.push(SOCKS5_ADDR_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            TargetAddr::Ipv6(ip) => {
                request.push(SOCKS5_ADDR_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            TargetAddr::Domain(domain) => {
                if domain.is_empty() || domain.len() > 255 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Domain name length out of range: {}", domain.len()),
                    ));
                }
                request.push(SOCKS5_ADDR_DOMAIN);
                request.push(domain.len() as u8);
                request.extend_from_slice(domain.as_bytes());
            }
        }

        // Port (big-endian)
        request.extend_from_slice(&target.port.to_be_bytes());

        self.stream.write_all(&request).await
    }

    /// Receive CONNECT reply
    pub async fn receive_connect_reply(&mut self) -> io::Result<Socks5Reply> {
        // VER REP RSV ATYP
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;

        let [version, reply_code, _reserved, address_type] = header;

        if version != SOCKS5_VERSION {
            return Err(protocol_error(format!(
                "Invalid SOCKS version in reply: {}",
                version
            )));
        }

        let bind_addr = match address_type {
            SOCKS5_ADDR_IPV4 => {
                let mut addr_bytes = [0u8; 4];
                self.stream.read_exact(&mut addr_bytes).await?;
                TargetAddr::Ipv4(Ipv4Addr::from(addr_bytes))
            }
            SOCKS5_ADDR_IPV6 => {
                let mut addr_bytes = [0u8; 16];
                self.stream.read_exact(&mut addr_bytes).await?;
                TargetAddr::Ipv6(Ipv6Addr::from(addr_bytes))
            }
            SOCKS5_ADDR_DOMAIN => {
                let domain_len = self.stream.read_u8().await? as usize;
                if domain_len == 0 {
                    return Err(protocol_error("Bind domain name length cannot be zero"));
                }

                let mut domain_bytes = vec![0u8; domain_len];
                self.stream.read_exact(&mut domain_bytes).await?;
                let domain = String::from_utf8(domain_bytes)
                    .map_err(|e| protocol_error(format!("Invalid UTF-8 in bind domain: {}", e)))?;
                TargetAddr::Domain(domain)
            }
            other => {
                return Err(protocol_error(format!(
                    "Unsupported bind address type: {}",
                    other
                )))
            }
        };

        let bind_port = self.stream.read_u16().await?;

        Ok(Socks5Reply {
            reply_code,
            bind_addr,
            bind_port,
        })
    }

    /// Full negotiation: method selection, optional auth, CONNECT.
    pub async fn connect(
        &mut self,
        target: &Target,
        credentials: Option<(&str, &str)>,
    ) -> io::Result<Socks5Reply> {
        let method = if credentials.is_some() {
            SOCKS5_AUTH_USERPASS
        } else {
            SOCKS5_AUTH_NONE
        };

        self.send_greeting(&[method]).await?;
        let selected = self.receive_auth_method().await?;

        if selected == SOCKS5_AUTH_UNSUPPORTED || selected != method {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "SOCKS5 relay rejected authentication method: expected {}, got {}",
                    method, selected
                ),
            ));
        }

        if let Some((username, password)) = credentials {
            self.authenticate_username_password(username, password).await?;
        }

        self.send_connect_request(target).await?;
        let reply = self.receive_connect_reply().await?;

        if reply.reply_code != SOCKS5_REPLY_SUCCESS {
            return Err(reply_error(reply.reply_code));
        }

        Ok(reply)
    }

    /// Get the underlying stream once negotiation is done
    pub fn into_stream(self) -> S {
        self.stream
    }
}
