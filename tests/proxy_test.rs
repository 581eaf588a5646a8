//! End-to-end tests for the HTTP proxy front-end

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keepalive_proxy::socks::Socks5Connector;
use keepalive_proxy::{
    dialer::Connector, Config, FaultSupervisor, ProxyServer, ResilientDialer, RetryPolicy,
    ShutdownCoordinator,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningProxy {
    addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    handle: JoinHandle<keepalive_proxy::Result<()>>,
    _supervisor: FaultSupervisor,
}

async fn start_proxy<C: Connector + 'static>(config: Config, dialer: ResilientDialer<C>) -> RunningProxy {
    let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
    let supervisor = FaultSupervisor::new();
    let server = Arc::new(ProxyServer::new(&config, dialer, supervisor.reporter(), &shutdown));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.run(listener));

    RunningProxy {
        addr,
        shutdown,
        handle,
        _supervisor: supervisor,
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.upstream.pure = true;
    config.retry = RetryPolicy::linear(Duration::from_millis(10)).with_max_attempts(2);
    config
}

fn direct_dialer(config: &Config) -> ResilientDialer<keepalive_proxy::dialer::DirectConnector> {
    ResilientDialer::direct(config.server.read_timeout, config.retry.clone())
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_connect_tunnel() {
    let echo = spawn_echo_server().await;
    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo).as_bytes())
        .await
        .unwrap();

    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "got {:?}", head);

    client.write_all(b"through the tunnel").await.unwrap();
    let mut buf = [0u8; 18];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"through the tunnel");
}

#[tokio::test]
async fn test_connect_forwards_bytes_sent_with_head() {
    let echo = spawn_echo_server().await;
    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nearly", echo).as_bytes())
        .await
        .unwrap();

    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));

    let mut buf = [0u8; 5];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"early");
}

#[tokio::test]
async fn test_plain_http_is_rewritten() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = read_response_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        head
    });

    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{}/status HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
                origin_addr, origin_addr
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response)).await.unwrap().unwrap();
    assert!(response.ends_with(b"\r\n\r\nok"));

    let seen = origin_task.await.unwrap();
    assert_eq!(
        seen,
        format!("GET /status HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", origin_addr)
    );
}

#[tokio::test]
async fn test_origin_form_request_is_rejected() {
    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").await.unwrap();

    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn test_unreachable_upstream_gets_bad_gateway() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", closed).as_bytes())
        .await
        .unwrap();

    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 502"));
}

#[tokio::test]
async fn test_connect_through_socks_relay() {
    // Relay that accepts one CONNECT and then echoes
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; head[4] as usize + 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest[..head[4] as usize], b"origin.test");

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
            .await
            .unwrap();

        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let mut config = test_config();
    config.upstream.pure = false;
    config.upstream.socks_addr = relay_addr.into();
    let dialer = ResilientDialer::via_socks5(Socks5Connector::new(relay_addr), config.retry.clone());
    let proxy = start_proxy(config, dialer).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT origin.test:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"));

    client.write_all(b"relayed").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"relayed");
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let config = test_config();
    let proxy = start_proxy(config.clone(), direct_dialer(&config)).await;

    // One round trip so the accept loop is known to be listening for shutdown
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").await.unwrap();
    let head = timeout(TEST_TIMEOUT, read_response_head(&mut client)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 400"));
    drop(client);

    proxy.shutdown.trigger();
    let result = timeout(TEST_TIMEOUT, proxy.handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(proxy.shutdown.drain().await, 0);
}
