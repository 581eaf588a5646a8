//! Integration tests for null-packet probing and the error policies

use std::io;
use std::time::Duration;

use keepalive_proxy::error::IoOp;
use keepalive_proxy::keepalive::{ErrorClass, NetworkCondition};
use keepalive_proxy::{
    ErrorPolicy, FatalFault, FaultSupervisor, KeepaliveConnection, ProbeConfig, ResilientDialer,
    RetryPolicy, Target,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

fn probe_config(size: usize, policy: ErrorPolicy) -> ProbeConfig {
    ProbeConfig {
        enabled: true,
        interval: Duration::from_secs(30),
        min_interval: Duration::from_secs(5),
        size,
        error_policy: policy,
    }
}

#[tokio::test(start_paused = true)]
async fn test_null_packet_has_configured_size() {
    let (near, mut far) = tokio::io::duplex(1024);
    let _conn = KeepaliveConnection::new(near, probe_config(4, ErrorPolicy::Retry), "origin:80");

    let start = Instant::now();
    let mut buf = [0xffu8; 4];
    far.read_exact(&mut buf).await.unwrap();

    assert_eq!(buf, [0u8; 4]);
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_probe_cadence_uses_smaller_interval() {
    let (near, mut far) = tokio::io::duplex(1024);
    let conn = KeepaliveConnection::new(near, probe_config(1, ErrorPolicy::Retry), "origin:80");

    let start = Instant::now();
    let mut buf = [0u8; 1];
    for n in 1..=3u64 {
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5 * n));
    }

    assert_eq!(conn.stats().probes_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_restarting_timer_pushes_next_probe_out() {
    let (near, mut far) = tokio::io::duplex(1024);
    let conn = KeepaliveConnection::new(near, probe_config(1, ErrorPolicy::Retry), "origin:80");

    sleep(Duration::from_secs(3)).await;
    conn.start_probe_timer();

    let start = Instant::now();
    let mut buf = [0u8; 1];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_probe_never_splits_application_write() {
    let (near, mut far) = tokio::io::duplex(1024);
    let mut conn = KeepaliveConnection::new(near, probe_config(2, ErrorPolicy::Retry), "origin:80");

    conn.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 7];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\0\0");
}

#[tokio::test]
async fn test_ignore_policy_suppresses_broken_pipe() {
    let mock = tokio_test::io::Builder::new()
        .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
        .write(&[0u8; 4])
        .build();
    let mut conn = KeepaliveConnection::new(mock, probe_config(4, ErrorPolicy::Ignore), "origin:80");

    let n = conn.write(b"hello").await.unwrap();
    assert_eq!(n, 5);

    let stats = conn.stats();
    assert_eq!(stats.probes_sent, 1);
    assert_eq!(stats.recoverable_errors, 1);
    assert_eq!(stats.suppressed_errors, 1);
}

#[tokio::test]
async fn test_ignore_policy_turns_failed_read_into_eof() {
    let mock = tokio_test::io::Builder::new()
        .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
        .write(&[0u8; 1])
        .build();
    let mut conn = KeepaliveConnection::new(mock, probe_config(1, ErrorPolicy::Ignore), "origin:80");

    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retry_policy_returns_original_error() {
    let mock = tokio_test::io::Builder::new()
        .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
        .write(&[0u8; 4])
        .build();
    let mut conn = KeepaliveConnection::new(mock, probe_config(4, ErrorPolicy::Retry), "origin:80");

    let err = conn.write(b"hello").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    assert!(FatalFault::from_io_error(&err).is_none());
    assert_eq!(conn.stats().probes_sent, 1);
}

#[tokio::test]
async fn test_generic_error_still_probes() {
    let mock = tokio_test::io::Builder::new()
        .write_error(io::Error::new(io::ErrorKind::Other, "boom"))
        .write(&[0u8; 1])
        .build();
    let mut conn = KeepaliveConnection::new(mock, probe_config(1, ErrorPolicy::Retry), "origin:80");

    let err = conn.write(b"x").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Other);

    let stats = conn.stats();
    assert_eq!(stats.generic_errors, 1);
    assert_eq!(stats.recoverable_errors, 0);
    assert_eq!(stats.probes_attempted(), 1);
}

#[tokio::test]
async fn test_fatal_policy_reports_to_supervisor() {
    let mut supervisor = FaultSupervisor::new();
    let mock = tokio_test::io::Builder::new()
        .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
        .write(&[0u8; 1])
        .build();
    let mut conn = KeepaliveConnection::new(mock, probe_config(1, ErrorPolicy::Fatal), "origin:80")
        .with_fault_reporter(supervisor.reporter());

    let mut buf = [0u8; 8];
    let err = conn.read(&mut buf).await.unwrap_err();

    let carried = FatalFault::from_io_error(&err).expect("fault travels in the io::Error");
    assert_eq!(carried.op, IoOp::Read);
    assert_eq!(carried.kind, io::ErrorKind::ConnectionReset);

    let reported = supervisor.try_next_fault().expect("fault reaches the supervisor");
    assert_eq!(reported.peer, "origin:80");
    assert_eq!(
        reported.class,
        ErrorClass::RecoverableNetwork(NetworkCondition::ConnectionReset)
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_stops_probes() {
    let (near, mut far) = tokio::io::duplex(1024);
    let mut conn = KeepaliveConnection::new(near, probe_config(4, ErrorPolicy::Retry), "origin:80");
    assert!(conn.is_probing());

    conn.close().await.unwrap();
    let _ = conn.close().await;
    assert!(!conn.is_probing());

    sleep(Duration::from_secs(60)).await;

    let mut buf = Vec::new();
    far.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
    assert_eq!(conn.stats().probes_attempted(), 0);
}

#[tokio::test]
async fn test_disabled_probing_is_pass_through() {
    let mock = tokio_test::io::Builder::new()
        .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
        .build();
    let mut conn = KeepaliveConnection::new(mock, ProbeConfig::disabled(), "origin:80");
    assert!(!conn.is_probing());

    let err = conn.write(b"hello").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert_eq!(conn.stats().probes_attempted(), 0);
    conn.send_null_packet().await.unwrap();
}

#[tokio::test]
async fn test_manual_null_packet() {
    let (near, mut far) = tokio::io::duplex(1024);
    let conn = KeepaliveConnection::new(near, probe_config(3, ErrorPolicy::Retry), "origin:80");

    conn.send_null_packet().await.unwrap();

    let mut buf = [0xffu8; 3];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0u8; 3]);
}

fn null_packets_every(interval: Duration) -> ProbeConfig {
    ProbeConfig {
        enabled: true,
        interval,
        min_interval: interval,
        size: 1,
        error_policy: ErrorPolicy::Retry,
    }
}

#[tokio::test]
async fn test_large_write_completes_while_null_packets_fire() {
    const PAYLOAD: usize = 16 * 1024 * 1024;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let mut conn = KeepaliveConnection::new(client, null_packets_every(Duration::from_millis(200)), "origin:80");

    // Fills the socket buffers and parks well before the peer starts reading
    let writer = tokio::spawn(async move {
        let payload = vec![0xabu8; PAYLOAD];
        conn.write_all(&payload).await?;
        conn.shutdown().await?;
        Ok::<_, io::Error>(conn.stats())
    });

    let reader = tokio::spawn(async move {
        sleep(Duration::from_millis(700)).await;
        let mut received = Vec::with_capacity(PAYLOAD);
        peer.read_to_end(&mut received).await.unwrap();
        received
    });

    let stats = timeout(Duration::from_secs(10), writer)
        .await
        .expect("application write must not hang behind the probe timer")
        .unwrap()
        .unwrap();
    let received = timeout(Duration::from_secs(10), reader).await.unwrap().unwrap();

    let payload_bytes = received.iter().filter(|&&b| b == 0xab).count();
    assert_eq!(payload_bytes, PAYLOAD);
    assert_eq!(received.len() - payload_bytes, stats.probes_sent as usize);
}

#[tokio::test]
async fn test_kept_alive_idle_connection_outlives_read_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Alive but silent
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(5)).await;
    });

    let dialer = ResilientDialer::direct(
        Duration::from_millis(300),
        RetryPolicy::linear(Duration::from_millis(10)).with_max_attempts(1),
    );
    let stream = dialer.dial(&Target::from(addr)).await.unwrap();
    let mut conn = KeepaliveConnection::new(stream, null_packets_every(Duration::from_millis(100)), "origin:80");

    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(1), conn.read(&mut buf)).await;
    assert!(read.is_err(), "read ended early: {:?}", read);
    assert!(conn.stats().probes_sent >= 5);
}

#[tokio::test]
async fn test_silent_idle_connection_hits_read_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(5)).await;
    });

    let dialer = ResilientDialer::direct(
        Duration::from_millis(300),
        RetryPolicy::linear(Duration::from_millis(10)).with_max_attempts(1),
    );
    let stream = dialer.dial(&Target::from(addr)).await.unwrap();
    let mut conn = KeepaliveConnection::new(stream, ProbeConfig::disabled(), "origin:80");

    let mut buf = [0u8; 8];
    let err = timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
}
