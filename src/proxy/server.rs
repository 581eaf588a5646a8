//! HTTP Proxy Server

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::request::{read_head, ProxyRequest, RequestKind};
use super::session::{ProxySession, SessionEnd};
use crate::config::{Config, ServerConfig};
use crate::dialer::{Connector, ResilientDialer};
use crate::error::{DialError, FatalFault};
use crate::keepalive::{KeepaliveConnection, ProbeConfig};
use crate::shutdown::{ActiveSessions, ShutdownCoordinator};
use crate::supervisor::FaultReporter;
use crate::Result;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Forward proxy front-end. Every upstream it opens goes through the
/// resilient dialer and is wrapped in a [`KeepaliveConnection`].
pub struct ProxyServer<C> {
    server: ServerConfig,
    probe: ProbeConfig,
    dialer: ResilientDialer<C>,
    faults: FaultReporter,
    shutdown_tx: broadcast::Sender<()>,
    sessions: Arc<ActiveSessions>,
    limiter: Arc<Semaphore>,
}

impl<C> ProxyServer<C>
where
    C: Connector + 'static,
{
    pub fn new(
        config: &Config,
        dialer: ResilientDialer<C>,
        faults: FaultReporter,
        shutdown: &ShutdownCoordinator,
    ) -> Self {
        Self {
            server: config.server.clone(),
            probe: config.probe.clone(),
            dialer,
            faults,
            shutdown_tx: shutdown.sender(),
            sessions: shutdown.sessions(),
            limiter: Arc::new(Semaphore::new(config.server.max_idle_conns)),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listen_addr = self.server.listen_addr;
        info!("Binding TCP listener to {}", listen_addr);
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        info!("Successfully bound to {}", listen_addr);
        Ok(listener)
    }

    /// Bind and serve until shutdown
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Accept loop. Returns once shutdown is signalled; sessions already
    /// running wind down on their own.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            "Starting connection acceptance loop (max {} concurrent sessions)",
            self.server.max_idle_conns
        );

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.limiter).acquire_owned() => {
                    permit.context("Connection limiter closed")?
                }
                _ = shutdown_rx.recv() => break,
            };

            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };

            debug!("Accepted connection from {}", addr);
            let server = Arc::clone(&self);
            let guard = self.sessions.enter();

            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                if let Err(e) = server.handle_client(stream, addr).await {
                    debug!("Connection from {} ended with error: {:#}", addr, e);
                }
            });
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    #[instrument(skip(self, client))]
    async fn handle_client(&self, mut client: TcpStream, addr: SocketAddr) -> Result<()> {
        if let Err(e) = client.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut buf = BytesMut::with_capacity(4096);
        let head_len = match timeout(self.server.read_timeout, read_head(&mut client, &mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                debug!("Failed to read request head: {}", e);
                if e.kind() == io::ErrorKind::InvalidData {
                    self.respond(&mut client, BAD_REQUEST).await?;
                }
                return Ok(());
            }
            Err(_) => {
                debug!("Timed out waiting for request head after {:?}", self.server.read_timeout);
                return Ok(());
            }
        };

        let head = buf.split_to(head_len);
        let request = match ProxyRequest::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                self.respond(&mut client, BAD_REQUEST).await?;
                return Ok(());
            }
        };

        let session = ProxySession::new(addr, request.target.clone(), &request.method);

        let upstream = match self.dialer.dial_until(&request.target, &mut shutdown_rx).await {
            Ok(upstream) => upstream,
            Err(e @ DialError::Cancelled { .. }) => {
                info!(session_id = %session.session_id, "{}", e);
                self.respond(&mut client, SERVICE_UNAVAILABLE).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(session_id = %session.session_id, "Upstream unavailable: {}", e);
                self.respond(&mut client, BAD_GATEWAY).await?;
                return Ok(());
            }
        };

        let mut upstream = KeepaliveConnection::new(upstream, self.probe.clone(), request.target.to_string())
            .with_fault_reporter(self.faults.clone());

        let result = async {
            match &request.kind {
                RequestKind::Connect => self.respond(&mut client, CONNECTION_ESTABLISHED).await?,
                RequestKind::Forward { head } => {
                    upstream.write_all(head).await?;
                    session.add_bytes_up(head.len() as u64);
                }
            }

            // Anything the client sent right after the head
            if !buf.is_empty() {
                upstream.write_all(&buf).await?;
                session.add_bytes_up(buf.len() as u64);
            }

            relay(
                &mut client,
                &mut upstream,
                &session,
                self.server.tunnel_idle_timeout(),
                &mut shutdown_rx,
            )
            .await
        }
        .await;

        let end = match result {
            Ok(end) => end,
            Err(e) => {
                match FatalFault::from_io_error(&e) {
                    Some(fault) => error!(session_id = %session.session_id, "Session aborted: {}", fault),
                    None => debug!(session_id = %session.session_id, "Session failed: {}", e),
                }
                SessionEnd::Error
            }
        };

        if let Err(e) = upstream.close().await {
            debug!(session_id = %session.session_id, "Error closing upstream: {}", e);
        }

        let stats = session.to_stats(end, Some(upstream.stats()));
        session.log_stats(&stats);
        Ok(())
    }

    async fn respond(&self, client: &mut TcpStream, response: &[u8]) -> io::Result<()> {
        match timeout(self.server.write_timeout, client.write_all(response)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing response to client",
            )),
        }
    }
}

/// Copy bytes both ways until both sides close, the tunnel sits idle for
/// `idle_timeout`, or shutdown fires.
pub(crate) async fn relay<A, B>(
    client: &mut A,
    upstream: &mut B,
    session: &ProxySession,
    idle_timeout: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> io::Result<SessionEnd>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut up_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut down_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut client_open = true;
    let mut upstream_open = true;

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    while client_open || upstream_open {
        tokio::select! {
            read = client.read(&mut up_buf), if client_open => {
                let n = read?;
                if n == 0 {
                    client_open = false;
                    upstream.shutdown().await?;
                } else {
                    upstream.write_all(&up_buf[..n]).await?;
                    session.add_bytes_up(n as u64);
                }
            }
            read = upstream.read(&mut down_buf), if upstream_open => {
                let n = read?;
                if n == 0 {
                    upstream_open = false;
                    client.shutdown().await?;
                } else {
                    client.write_all(&down_buf[..n]).await?;
                    session.add_bytes_down(n as u64);
                }
            }
            _ = &mut idle => {
                debug!(session_id = %session.session_id, "Tunnel idle for {:?}", idle_timeout);
                return Ok(SessionEnd::Idle);
            }
            _ = shutdown.recv() => return Ok(SessionEnd::Shutdown),
        }

        idle.as_mut().reset(Instant::now() + idle_timeout);
    }

    Ok(SessionEnd::Closed)
}
