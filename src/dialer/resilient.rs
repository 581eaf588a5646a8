//! Resilient Dialer

use std::io;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{Connector, DeadlineStream, DirectConnector, RetryPolicy, Target};
use crate::error::DialError;
use crate::socks::Socks5Connector;

/// Retries a [`Connector`] with linear backoff until it succeeds or the
/// attempt budget runs out
#[derive(Debug, Clone)]
pub struct ResilientDialer<C> {
    connector: C,
    policy: RetryPolicy,
    read_timeout: Option<Duration>,
}

impl ResilientDialer<DirectConnector> {
    /// Dial targets directly. `timeout` bounds each attempt and becomes the
    /// read deadline of the returned stream.
    pub fn direct(timeout: Duration, policy: RetryPolicy) -> Self {
        Self::new(DirectConnector::new(timeout), policy).with_read_timeout(Some(timeout))
    }
}

impl ResilientDialer<Socks5Connector> {
    /// Dial every target through a SOCKS5 relay. No per-attempt timeout is
    /// added on top of what the relay connector does.
    pub fn via_socks5(connector: Socks5Connector, policy: RetryPolicy) -> Self {
        Self::new(connector, policy)
    }
}

impl<C: Connector> ResilientDialer<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            read_timeout: None,
        }
    }

    /// Read deadline applied to every stream this dialer hands out.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Dial `target`, retrying until success or the budget is spent.
    pub async fn dial(&self, target: &Target) -> Result<DeadlineStream<C::Stream>, DialError> {
        self.run(target, None).await
    }

    /// Like [`dial`](Self::dial), but gives up as soon as `shutdown` fires.
    pub async fn dial_until(
        &self,
        target: &Target,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<DeadlineStream<C::Stream>, DialError> {
        self.run(target, Some(shutdown)).await
    }

    /// Parse `host:port` and dial it.
    pub async fn dial_addr(&self, address: &str) -> Result<DeadlineStream<C::Stream>, DialError> {
        let target = Target::parse(address)?;
        self.dial(&target).await
    }

    async fn run(
        &self,
        target: &Target,
        mut shutdown: Option<&mut broadcast::Receiver<()>>,
    ) -> Result<DeadlineStream<C::Stream>, DialError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<io::Error> = None;

        for attempt in 0..max_attempts {
            let result = tokio::select! {
                result = self.connector.connect(target) => result,
                _ = cancelled(&mut shutdown) => {
                    return Err(self.cancelled(target, attempt));
                }
            };

            match result {
                Ok(stream) => {
                    if attempt == 0 {
                        debug!("Connected to {}", target);
                    } else {
                        info!("Connected to {} after {} attempts", target, attempt + 1);
                    }
                    return Ok(DeadlineStream::new(stream, self.read_timeout));
                }
                Err(e) => {
                    let is_last = attempt + 1 == max_attempts;
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        upstream = %target,
                        attempt = attempt + 1,
                        max_attempts,
                        "Dial failed: {}{}",
                        e,
                        if is_last { String::new() } else { format!(", retrying in {:?}", delay) }
                    );
                    last_error = Some(e);

                    if is_last {
                        break;
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(&mut shutdown) => {
                            return Err(self.cancelled(target, attempt + 1));
                        }
                    }
                }
            }
        }

        error!("Giving up on {} after {} attempts", target, max_attempts);
        Err(DialError::Exhausted {
            target: target.to_string(),
            attempts: max_attempts,
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no dial attempt made")),
        })
    }

    fn cancelled(&self, target: &Target, attempts: u32) -> DialError {
        info!("Dial to {} cancelled by shutdown after {} attempts", target, attempts);
        DialError::Cancelled {
            target: target.to_string(),
            attempts,
        }
    }
}

/// Resolves once shutdown is signalled; never resolves without a receiver.
async fn cancelled(shutdown: &mut Option<&mut broadcast::Receiver<()>>) {
    match shutdown {
        // A closed or lagged channel also means the coordinator is gone
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Fails a fixed number of times, then hands out duplex streams
    struct FlakyConnector {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    failures,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    impl Connector for FlakyConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _target: &Target) -> io::Result<DuplexStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            let (near, _far) = tokio::io::duplex(64);
            Ok(near)
        }
    }

    fn target() -> Target {
        Target::parse("upstream.test:443").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_success_does_not_sleep() {
        let (connector, calls) = FlakyConnector::new(0);
        let dialer = ResilientDialer::new(connector, RetryPolicy::default());

        let start = Instant::now();
        dialer.dial(&target()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_linearly_until_success() {
        let (connector, calls) = FlakyConnector::new(2);
        let dialer = ResilientDialer::new(connector, RetryPolicy::linear(Duration::from_secs(1)));

        let start = Instant::now();
        dialer.dial(&target()).await.unwrap();

        // 1s after the first failure, 2s after the second
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_returns_last_error() {
        let (connector, calls) = FlakyConnector::new(u32::MAX);
        let policy = RetryPolicy::linear(Duration::from_secs(1)).with_max_attempts(4);
        let dialer = ResilientDialer::new(connector, policy);

        let start = Instant::now();
        let err = dialer.dial(&target()).await.unwrap_err();

        match err {
            DialError::Exhausted { attempts, source, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // No sleep after the final attempt: 1 + 2 + 3
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_backoff() {
        let (connector, calls) = FlakyConnector::new(u32::MAX);
        let dialer = ResilientDialer::new(connector, RetryPolicy::default());
        let (tx, mut rx) = broadcast::channel(1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            let _ = tx.send(());
        });

        let err = dialer.dial_until(&target(), &mut rx).await.unwrap_err();
        assert!(matches!(err, DialError::Cancelled { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_applied_to_dialed_stream() {
        let (connector, _) = FlakyConnector::new(0);
        let dialer = ResilientDialer::new(connector, RetryPolicy::default())
            .with_read_timeout(Some(Duration::from_secs(5)));

        let stream = dialer.dial(&target()).await.unwrap();
        assert_eq!(stream.read_timeout(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_dial_addr_rejects_bad_target() {
        let (connector, calls) = FlakyConnector::new(0);
        let dialer = ResilientDialer::new(connector, RetryPolicy::default());

        let err = dialer.dial_addr("no-port-here").await.unwrap_err();
        assert!(matches!(err, DialError::InvalidTarget(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
