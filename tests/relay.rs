//! End-to-end relay scenarios
//!
//! Each test drives a real in-process relay over real sockets with a
//! tokio-tungstenite client.


use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use integration_harness::{
    TEST_USER_ID, spawn_counting_upstream, spawn_echo_upstream, spawn_relay, upgrade_request,
};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use veil_protocol::{Address, Command, encode_request};

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Collect binary frames until `want` bytes have arrived.
async fn read_binary(ws: &mut Client, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < want {
        match ws.next().await.expect("stream ended early").expect("ws error") {
            Message::Binary(data) => out.extend_from_slice(&data),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    out
}

async fn expect_close(ws: &mut Client) {
    match ws.next().await {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_relay_round_trip() {
    let upstream = spawn_echo_upstream().await;
    let relay = spawn_relay().await;

    let (mut ws, response) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");
    assert_eq!(response.status(), 101);

    let request = encode_request(
        &TEST_USER_ID,
        Command::Tcp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        upstream.port(),
        b"GET / HTTP/1.0\r\n\r\n",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    // The 2-byte response header is the very first frame back.
    let first = ws.next().await.expect("no response").expect("ws error");
    assert_eq!(first, Message::Binary(vec![0x00, 0x00].into()));

    let echoed = read_binary(&mut ws, 18).await;
    assert_eq!(&echoed, b"GET / HTTP/1.0\r\n\r\n");

    // The relay keeps forwarding after the handshake exchange.
    ws.send(Message::Binary(b"ping".to_vec().into()))
        .await
        .expect("send");
    let echoed = read_binary(&mut ws, 4).await;
    assert_eq!(&echoed, b"ping");

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn test_domain_address_relay() {
    let upstream = spawn_echo_upstream().await;
    let relay = spawn_relay().await;

    let (mut ws, _) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");

    let request = encode_request(
        &TEST_USER_ID,
        Command::Tcp,
        &Address::Domain("127.0.0.1".to_string()),
        upstream.port(),
        b"hello",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    let first = ws.next().await.expect("no response").expect("ws error");
    assert_eq!(first, Message::Binary(vec![0x00, 0x00].into()));

    let echoed = read_binary(&mut ws, 5).await;
    assert_eq!(&echoed, b"hello");

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn test_early_data_reaches_upstream_first() {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let upstream = spawn_echo_upstream().await;
    let relay = spawn_relay().await;

    let early = URL_SAFE_NO_PAD.encode(b"early-");
    let (mut ws, response) = connect_async(upgrade_request(relay, Some(&early)))
        .await
        .expect("upgrade");

    // The subprotocol is echoed back on the 101.
    assert_eq!(
        response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok()),
        Some(early.as_str())
    );

    let request = encode_request(
        &TEST_USER_ID,
        Command::Tcp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        upstream.port(),
        b"tail",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    let first = ws.next().await.expect("no response").expect("ws error");
    assert_eq!(first, Message::Binary(vec![0x00, 0x00].into()));

    // Early data goes out before the header's trailing payload.
    let echoed = read_binary(&mut ws, 10).await;
    assert_eq!(&echoed, b"early-tail");

    ws.close(None).await.expect("close");
}

#[tokio::test]
async fn test_udp_command_closes_without_dialing() {
    let (upstream, accepts) = spawn_counting_upstream().await;
    let relay = spawn_relay().await;

    let (mut ws, _) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");

    let request = encode_request(
        &TEST_USER_ID,
        Command::Udp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        upstream.port(),
        b"",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    expect_close(&mut ws).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identifier_mismatch_closes_without_dialing() {
    let (upstream, accepts) = spawn_counting_upstream().await;
    let relay = spawn_relay().await;

    let (mut ws, _) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");

    let wrong_id = Uuid::parse_str("b2c9d2aa-7d14-4f6e-9c64-2f3a8f5d9e01").unwrap();
    let request = encode_request(
        &wrong_id,
        Command::Tcp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        upstream.port(),
        b"",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    expect_close(&mut ws).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dial_failure_closes_session() {
    let relay = spawn_relay().await;

    let (mut ws, _) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");

    // Nothing listens on port 1.
    let request = encode_request(
        &TEST_USER_ID,
        Command::Tcp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        1,
        b"",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    expect_close(&mut ws).await;
}

#[tokio::test]
async fn test_upstream_eof_closes_websocket() {
    let relay = spawn_relay().await;

    // An upstream that answers once and hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let (mut ws, _) = connect_async(upgrade_request(relay, None))
        .await
        .expect("upgrade");

    let request = encode_request(
        &TEST_USER_ID,
        Command::Tcp,
        &Address::Ipv4(Ipv4Addr::LOCALHOST),
        upstream.port(),
        b"",
    );
    ws.send(Message::Binary(request.into()))
        .await
        .expect("send header");

    let first = ws.next().await.expect("no response").expect("ws error");
    assert_eq!(first, Message::Binary(vec![0x00, 0x00].into()));

    let data = read_binary(&mut ws, 3).await;
    assert_eq!(&data, b"bye");

    expect_close(&mut ws).await;
}
