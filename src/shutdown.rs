//! Graceful Shutdown Handling
//!
//! Broadcasts a single shutdown signal to the accept loop, in-flight dials
//! and relaying sessions, then waits a bounded time for sessions to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Sessions still running
    active: Arc<ActiveSessions>,
    /// How long to wait for sessions to finish
    timeout: Duration,
}

/// Count of live sessions, with a wakeup when it hits zero
#[derive(Debug, Default)]
pub struct ActiveSessions {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the session count when dropped
#[derive(Debug)]
pub struct SessionGuard {
    active: Arc<ActiveSessions>,
}

impl ActiveSessions {
    pub fn enter(self: &Arc<Self>) -> SessionGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        SessionGuard {
            active: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.active.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.active.idle.notify_waiters();
        }
    }
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            active: Arc::new(ActiveSessions::default()),
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Sender half, for components that spawn their own listeners
    pub fn sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Session counter shared with the proxy server
    pub fn sessions(&self) -> Arc<ActiveSessions> {
        Arc::clone(&self.active)
    }

    /// Broadcast the shutdown signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown triggered with no listeners");
        }
    }

    /// Start listening for shutdown signals (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Wait for active sessions to close, up to the configured timeout.
    /// Returns the number of sessions still open when it gave up.
    pub async fn drain(&self) -> usize {
        let start_time = Instant::now();
        let remaining = self.active.count();
        if remaining == 0 {
            return 0;
        }

        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            remaining, self.timeout
        );

        let wait = async {
            loop {
                let idle = self.active.idle.notified();
                if self.active.count() == 0 {
                    break;
                }
                idle.await;
            }
        };

        let _ = tokio::time::timeout(self.timeout, wait).await;

        let left = self.active.count();
        if left == 0 {
            info!("All sessions closed gracefully in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start_time.elapsed(),
                left
            );
        }
        left
    }
}
