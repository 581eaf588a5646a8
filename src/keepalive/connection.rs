//! Keepalive connection wrapper

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, error, warn};

use super::gate::StreamGate;
use super::timer::ProbeTimer;
use super::{ErrorClass, KeepaliveStats, KeepaliveStatsSnapshot, PolicyOutcome, ProbeConfig};
use crate::error::{FatalFault, IoOp};
use crate::supervisor::FaultReporter;

/// Byte stream that keeps an idle upstream warm with null packets and
/// applies an [`ErrorPolicy`](super::ErrorPolicy) to failed reads and writes.
///
/// With probing disabled the wrapper is a pass-through that only tracks
/// activity. Dropping the connection stops the probe timer.
pub struct KeepaliveConnection<S> {
    gate: Arc<StreamGate<S>>,
    timer: ProbeTimer,
    config: ProbeConfig,
    peer: String,
    last_activity: Instant,
    stats: Arc<KeepaliveStats>,
    faults: Option<FaultReporter>,
}

impl<S> KeepaliveConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap `stream` and arm the probe timer.
    ///
    /// Must be called from within a tokio runtime when probing is enabled.
    pub fn new(stream: S, config: ProbeConfig, peer: impl Into<String>) -> Self {
        let stats = Arc::new(KeepaliveStats::new());
        let conn = Self {
            gate: Arc::new(StreamGate::new(stream, Arc::clone(&stats))),
            timer: ProbeTimer::new(),
            config,
            peer: peer.into(),
            last_activity: Instant::now(),
            stats,
            faults: None,
        };
        conn.start_probe_timer();
        conn
    }

    /// Deliver fatal faults to a supervisor as well as to the caller.
    pub fn with_fault_reporter(mut self, reporter: FaultReporter) -> Self {
        self.faults = Some(reporter);
        self
    }

    /// Arm the probe timer, or reschedule it if already running.
    pub fn start_probe_timer(&self) {
        if !self.config.enabled {
            return;
        }

        let interval = self.config.effective_interval();
        let gate = Arc::clone(&self.gate);
        let size = self.config.size;
        let peer = self.peer.clone();

        self.timer.start(interval, move || {
            let gate = Arc::clone(&gate);
            let peer = peer.clone();
            async move {
                // Bounded: a stalled probe, or one whose wakeup a later
                // writer took over, goes out ahead of that writer's data.
                match tokio::time::timeout(interval, gate.send_probe(size)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = %peer, "Null packet failed: {}", e),
                    Err(_) => debug!(peer = %peer, "Null packet stalled for {:?}", interval),
                }
            }
        });
    }

    /// Stop probing for good. Idempotent.
    pub fn stop_probe_timer(&self) {
        self.timer.stop();
    }

    /// Stop the probe timer, then shut the underlying stream down.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Write one null packet now, outside the timer cadence.
    ///
    /// Returns whatever the raw write produced; nothing is returned when
    /// probing is disabled.
    pub async fn send_null_packet(&self) -> io::Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.gate.send_probe(self.config.size).await
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn stats(&self) -> KeepaliveStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_probing(&self) -> bool {
        self.timer.is_scheduled()
    }

    /// Classify, probe once, and turn `err` into what the caller sees.
    ///
    /// `Ok(())` means the error was suppressed.
    fn intercept(&self, op: IoOp, err: io::Error, cx: &mut Context<'_>) -> io::Result<()> {
        let class = ErrorClass::of(&err);
        self.stats.record_error(class);

        if class.is_recoverable() {
            warn!(peer = %self.peer, "{} failed ({}): {}", op, class, err);
        } else {
            debug!(peer = %self.peer, "{} failed: {}", op, err);
        }

        // Best effort: a probe that cannot finish now, or that a parked
        // writer owns, stays queued and goes out ahead of the next write.
        self.gate.queue_probe(self.config.size);
        if let Poll::Ready(Err(e)) = self.gate.poll_flush_probe(cx) {
            debug!(peer = %self.peer, "Null packet after {} error failed: {}", op, e);
        }

        match self.config.error_policy.outcome() {
            PolicyOutcome::Propagate => Err(err),
            PolicyOutcome::Suppress => {
                self.stats.record_suppressed();
                debug!(peer = %self.peer, "Suppressing {} error per ignore policy", op);
                Ok(())
            }
            PolicyOutcome::Terminate => {
                let fault = FatalFault {
                    peer: self.peer.clone(),
                    op,
                    class,
                    kind: err.kind(),
                    message: err.to_string(),
                };
                error!("Fatal error occurred: {}", fault);
                if let Some(reporter) = &self.faults {
                    reporter.report(fault.clone());
                }
                Err(fault.into_io_error())
            }
        }
    }
}

impl<S> AsyncRead for KeepaliveConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.last_activity = Instant::now();

        match ready!(this.gate.poll_read(cx, buf)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(err) if !this.config.enabled => Poll::Ready(Err(err)),
            Err(err) => Poll::Ready(this.intercept(IoOp::Read, err, cx)),
        }
    }
}

impl<S> AsyncWrite for KeepaliveConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.last_activity = Instant::now();

        match ready!(this.gate.poll_write(cx, buf)) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(err) if !this.config.enabled => Poll::Ready(Err(err)),
            Err(err) => Poll::Ready(this.intercept(IoOp::Write, err, cx).map(|()| buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.gate.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Timer goes first so no probe can fire once close has begun
        self.timer.stop();
        self.gate.poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for KeepaliveConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepaliveConnection")
            .field("peer", &self.peer)
            .field("config", &self.config)
            .field("last_activity", &self.last_activity)
            .finish()
    }
}
