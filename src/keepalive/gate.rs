//! Exclusive access to the raw stream
//!
//! Application writes and null-packet probes both go through [`StreamGate`].
//! A probe is queued as a run of zero bytes that must be fully written before
//! the next application buffer, so the two never interleave on the wire.
//!
//! A raw stream only remembers the waker of the last task that polled it for
//! writing. While an application write is parked on a full send buffer, the
//! gate owns nothing else's wakeup: probes stay queued and the parked writer
//! flushes them when it resumes.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use super::KeepaliveStats;

const ZEROS: [u8; 512] = [0u8; 512];

struct GateState<S> {
    stream: S,
    probe_remaining: usize,
    // Set while an application write, flush or shutdown is Pending
    parked_writer: Option<Waker>,
}

impl<S> GateState<S> {
    fn track_writer<T>(&mut self, cx: &Context<'_>, poll: Poll<T>) -> Poll<T> {
        if poll.is_pending() {
            let known = self
                .parked_writer
                .as_ref()
                .is_some_and(|waker| waker.will_wake(cx.waker()));
            if !known {
                self.parked_writer = Some(cx.waker().clone());
            }
        } else {
            self.parked_writer = None;
        }
        poll
    }
}

pub(crate) struct StreamGate<S> {
    state: Mutex<GateState<S>>,
    stats: Arc<KeepaliveStats>,
}

impl<S> StreamGate<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, stats: Arc<KeepaliveStats>) -> Self {
        Self {
            state: Mutex::new(GateState {
                stream,
                probe_remaining: 0,
                parked_writer: None,
            }),
            stats,
        }
    }

    // Held for a single poll only, never across an await
    fn lock(&self) -> MutexGuard<'_, GateState<S>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a probe of `size` zero bytes unless one is already pending.
    ///
    /// Returns `false` when the call was coalesced into the pending probe.
    pub(crate) fn queue_probe(&self, size: usize) -> bool {
        let mut state = self.lock();
        if state.probe_remaining > 0 || size == 0 {
            return false;
        }
        state.probe_remaining = size;
        true
    }

    /// Try to push pending probe bytes out from outside the write path.
    ///
    /// Defers to a parked application writer instead of stealing its
    /// wakeup; the probe then goes out when that writer resumes. A Pending
    /// result here may be superseded by a later writer, so callers must not
    /// wait on it without a bound. Failures drop the probe.
    pub(crate) fn poll_flush_probe(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        if state.parked_writer.is_some() {
            if state.probe_remaining > 0 {
                trace!("Null packet deferred to parked writer");
            }
            return Poll::Ready(Ok(()));
        }
        self.drain_probe(&mut state, cx)
    }

    #[cfg(test)]
    pub(crate) fn has_parked_writer(&self) -> bool {
        self.lock().parked_writer.is_some()
    }

    fn drain_probe(&self, state: &mut GateState<S>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if state.probe_remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        while state.probe_remaining > 0 {
            let chunk = state.probe_remaining.min(ZEROS.len());
            match ready!(Pin::new(&mut state.stream).poll_write(cx, &ZEROS[..chunk])) {
                Ok(0) => {
                    state.probe_remaining = 0;
                    self.stats.record_probe_failed();
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => state.probe_remaining -= n,
                Err(err) => {
                    state.probe_remaining = 0;
                    self.stats.record_probe_failed();
                    return Poll::Ready(Err(err));
                }
            }
        }

        self.stats.record_probe_sent();
        trace!("Null packet written");
        Poll::Ready(Ok(()))
    }

    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        Pin::new(&mut state.stream).poll_read(cx, buf)
    }

    pub(crate) fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.lock();
        let poll = self.write_after_probe(&mut state, cx, |stream, cx| {
            Pin::new(stream).poll_write(cx, buf)
        });
        state.track_writer(cx, poll)
    }

    pub(crate) fn poll_flush(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        let poll = self.write_after_probe(&mut state, cx, |stream, cx| Pin::new(stream).poll_flush(cx));
        state.track_writer(cx, poll)
    }

    pub(crate) fn poll_shutdown(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        state.probe_remaining = 0;
        let poll = Pin::new(&mut state.stream).poll_shutdown(cx);
        state.track_writer(cx, poll)
    }

    fn write_after_probe<T>(
        &self,
        state: &mut GateState<S>,
        cx: &mut Context<'_>,
        op: impl FnOnce(&mut S, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if let Err(err) = ready!(self.drain_probe(state, cx)) {
            debug!("Discarding failed null packet ahead of write: {}", err);
        }
        op(&mut state.stream, cx)
    }

    /// Queue one probe and push it out, then flush.
    ///
    /// Returns as soon as the probe is handed to a parked writer.
    pub(crate) async fn send_probe(&self, size: usize) -> io::Result<()> {
        self.queue_probe(size);
        std::future::poll_fn(|cx| self.poll_flush_probe(cx)).await?;
        std::future::poll_fn(|cx| {
            let mut state = self.lock();
            if state.parked_writer.is_some() {
                return Poll::Ready(Ok(()));
            }
            Pin::new(&mut state.stream).poll_flush(cx)
        })
        .await
    }
}
