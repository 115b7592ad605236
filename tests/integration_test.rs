//! End-to-end tests for the Wisp proxy and the report transport
//!
//! Covers the full client-server flow:
//! - TCP and UDP echo through the multiplexer
//! - Dial policy enforcement and unreachable peers
//! - Credit-based flow control under a small window
//! - Read deadlines
//! - Report upload, storage layout and decryption

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use wisp_relay::client::{StreamError, WispClient, WispStream};
use wisp_relay::crypto::generate_keypair;
use wisp_relay::dialer::{allow_all, allow_patterns, Network, PolicyDialer};
use wisp_relay::protocol::CloseReason;
use wisp_relay::report::{read_report, ReportConfig, ReportServer, DATA_HEADER, FILE_HEADER, FOOTER};
use wisp_relay::server::{ServerConfig, WispServer};
use wisp_relay::store::MemoryStore;

/// Start a Wisp server on a dynamic port, returning its ws:// URL.
async fn start_wisp_server(dialer: PolicyDialer, config: ServerConfig) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = Arc::new(WispServer::with_config(dialer, config));
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        server.run(listener, server_cancel).await.unwrap();
    });
    (format!("ws://{addr}"), cancel)
}

/// Loopback TCP echo server.
async fn start_tcp_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr.to_string()
}

/// Loopback UDP echo server.
async fn start_udp_echo() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr.to_string()
}

/// Read exactly `buf.len()` bytes from a stream.
async fn read_full(stream: &mut WispStream, buf: &mut [u8]) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        assert!(n > 0, "unexpected EOF after {filled} bytes");
        filled += n;
    }
    Ok(())
}

#[tokio::test]
async fn test_tcp_echo() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();
    let mut stream = client.dial(Network::Tcp, &echo_addr).await.unwrap();

    let msg = b"hello tcp";
    assert_eq!(stream.write(msg).await.unwrap(), msg.len());

    let mut buf = [0u8; 9];
    read_full(&mut stream, &mut buf).await.unwrap();
    assert_eq!(&buf, msg);

    stream.close().await.unwrap();
    client.close();
}

#[tokio::test]
async fn test_udp_echo() {
    let echo_addr = start_udp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();
    let mut stream = client.dial(Network::Udp, &echo_addr).await.unwrap();

    let msg = b"hello udp";
    assert_eq!(stream.write(msg).await.unwrap(), msg.len());

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n >= msg.len());
    assert_eq!(&buf[..msg.len()], msg);
}

#[tokio::test]
async fn test_concurrent_streams() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = Arc::new(WispClient::connect(&url).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..10u32 {
        let client = Arc::clone(&client);
        let echo_addr = echo_addr.clone();
        tasks.push(tokio::spawn(async move {
            let mut stream = client.dial(Network::Tcp, &echo_addr).await.unwrap();
            let msg = format!("msg {i}");
            stream.write(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            read_full(&mut stream, &mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_blocked_host() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_patterns(["*.example.com"])),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();

    // The dial itself succeeds; the rejection arrives on the first read.
    let mut stream = client.dial(Network::Tcp, &echo_addr).await.unwrap();
    let _ = stream.write(b"test").await;

    let mut buf = [0u8; 16];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(matches!(
        err,
        StreamError::RemoteClosed(CloseReason::Blocked)
    ));
}

#[tokio::test]
async fn test_dial_unreachable() {
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();

    // Port 1 is essentially always closed on loopback.
    let mut stream = client.dial(Network::Tcp, "127.0.0.1:1").await.unwrap();
    let _ = stream.write(b"test").await;

    let mut buf = [0u8; 16];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(matches!(
        err,
        StreamError::RemoteClosed(CloseReason::Unreachable)
    ));
}

#[tokio::test]
async fn test_flow_control_small_window() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig { write_queue_len: 5 },
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();
    let mut stream = client.dial(Network::Tcp, &echo_addr).await.unwrap();

    // 20 packets against a credit window of 5: every write must eventually
    // complete as the server refills credit.
    for _ in 0..20 {
        assert_eq!(stream.write(b"data").await.unwrap(), 4);
    }

    let mut buf = [0u8; 80];
    read_full(&mut stream, &mut buf).await.unwrap();
    for chunk in buf.chunks(4) {
        assert_eq!(chunk, b"data");
    }
}

#[tokio::test]
async fn test_read_deadline() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();
    let mut stream = client.dial(Network::Tcp, &echo_addr).await.unwrap();

    stream.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_secs(1)));

    let started = std::time::Instant::now();
    let mut buf = [0u8; 16];
    let err = stream.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, StreamError::DeadlineExceeded));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned after {elapsed:?}");

    // The deadline does not destroy the stream.
    stream.set_read_deadline(None);
    stream.write(b"still alive").await.unwrap();
    let mut buf = [0u8; 11];
    read_full(&mut stream, &mut buf).await.unwrap();
    assert_eq!(&buf, b"still alive");
}

async fn start_report_server(
    store: Arc<MemoryStore>,
    recipient: wisp_relay::crypto::PublicKey,
) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = Arc::new(ReportServer::new(
        store,
        recipient,
        ReportConfig {
            bucket: "reports".to_string(),
            prefix: "report".to_string(),
        },
    ));
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        server.run(listener, server_cancel).await.unwrap();
    });
    (format!("ws://{addr}"), cancel)
}

#[tokio::test]
async fn test_report_happy_path() {
    let (secret, public) = generate_keypair();
    let store = Arc::new(MemoryStore::new());
    let (url, _cancel) = start_report_server(Arc::clone(&store), public).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text(r#"{"contentLength": 11}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Binary(b"hello world".as_slice().into()))
        .await
        .unwrap();

    // Wait for the server verdict.
    let response = loop {
        match ws.next().await.expect("connection ended").unwrap() {
            Message::Text(text) => break text.to_string(),
            Message::Close(_) => panic!("closed without a response"),
            _ => continue,
        }
    };
    assert_eq!(response, r#"{"success":true}"#);

    // A normal close follows.
    loop {
        match ws.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }

    // Exactly one object, with the §3 layout.
    let keys = store.keys().await;
    assert_eq!(keys.len(), 1);
    let (bucket, key) = keys[0].split_once('/').unwrap();
    assert!(key.starts_with("report-"));
    assert!(key.ends_with(".bin"));
    let object = store.get(bucket, key).await.unwrap();

    assert_eq!(&object[..FILE_HEADER.len()], FILE_HEADER);
    assert_eq!(&object[object.len() - FOOTER.len()..], FOOTER);

    let report = read_report(std::io::Cursor::new(object.clone()), &secret, false)
        .await
        .unwrap();
    assert_eq!(report.metadata.subnet, "127.0.0.0/24");
    assert_eq!(report.metadata.content_length, 11);
    assert_eq!(report.payload, b"hello world");

    // The data marker sits right after the encrypted metadata stream.
    let data_header_at = object
        .windows(DATA_HEADER.len())
        .position(|w| w == DATA_HEADER)
        .unwrap();
    assert!(data_header_at > FILE_HEADER.len());
}

#[tokio::test]
async fn test_report_oversize_rejected() {
    let (_, public) = generate_keypair();
    let store = Arc::new(MemoryStore::new());
    let (url, _cancel) = start_report_server(Arc::clone(&store), public).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text(
        format!(r#"{{"contentLength": {}}}"#, 1i64 << 29).into(),
    ))
    .await
    .unwrap();

    let response = loop {
        match ws.next().await.expect("connection ended").unwrap() {
            Message::Text(text) => break text.to_string(),
            Message::Close(_) => panic!("closed without a response"),
            _ => continue,
        }
    };
    assert_eq!(response, r#"{"error":"Payload too large."}"#);

    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_report_invalid_control_rejected() {
    let (_, public) = generate_keypair();
    let store = Arc::new(MemoryStore::new());
    let (url, _cancel) = start_report_server(Arc::clone(&store), public).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();

    let response = loop {
        match ws.next().await.expect("connection ended").unwrap() {
            Message::Text(text) => break text.to_string(),
            Message::Close(_) => panic!("closed without a response"),
            _ => continue,
        }
    };
    assert_eq!(response, r#"{"error":"Invalid metadata."}"#);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_stream_isolation() {
    let echo_addr = start_tcp_echo().await;
    let (url, _cancel) = start_wisp_server(
        PolicyDialer::new(allow_all()),
        ServerConfig::default(),
    )
    .await;

    let client = WispClient::connect(&url).await.unwrap();
    let mut a = client.dial(Network::Tcp, &echo_addr).await.unwrap();
    let mut b = client.dial(Network::Tcp, &echo_addr).await.unwrap();

    a.write(b"stream a").await.unwrap();
    b.write(b"stream b").await.unwrap();

    let mut buf_b = [0u8; 8];
    read_full(&mut b, &mut buf_b).await.unwrap();
    assert_eq!(&buf_b, b"stream b");

    // Closing B leaves A untouched.
    b.close().await.unwrap();

    let mut buf_a = [0u8; 8];
    read_full(&mut a, &mut buf_a).await.unwrap();
    assert_eq!(&buf_a, b"stream a");
}
