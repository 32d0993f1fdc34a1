//! Integration tests for the WebSocket relay.
//!
//! These tests start a real server on ephemeral ports and connect real
//! clients, verifying admission, fan-out and cleanup end to end.

use bytes::Bytes;
use chaospad_collab::protocol::{Frame, FrameTag};
use chaospad_collab::{RelayConfig, RelayServer};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on free ports, return the server and its WebSocket address.
async fn start_test_server(documents: &[&str]) -> (Arc<RelayServer>, SocketAddr) {
    let config = RelayConfig::for_testing(documents.iter().copied());
    let server = Arc::new(RelayServer::new(config).unwrap());
    let listeners = server.bind().await.unwrap();
    let ws_addr = listeners.ws_addr().unwrap();
    tokio::spawn(server.clone().serve(listeners));
    (server, ws_addr)
}

async fn connect(addr: SocketAddr, document_id: &str) -> Client {
    let url = format!("ws://{addr}/ws/{document_id}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Wait until the room reaches `size` members.
async fn wait_for_room_size(server: &RelayServer, document_id: &str, size: usize) {
    timeout(Duration::from_secs(5), async {
        while server.engine().rooms().room_size(document_id).await != size {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {document_id} never reached {size} members"));
}

/// Next binary message, skipping control frames.
async fn recv_binary(ws: &mut Client) -> Bytes {
    timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for a frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// True if no binary message arrives within `window`.
async fn nothing_within(ws: &mut Client, window: Duration) -> bool {
    timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(_))) => return,
                Some(Ok(_)) => continue,
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err()
}

async fn expect_close(ws: &mut Client) -> (u16, String) {
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => (u16::from(frame.code), frame.reason.to_string()),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_relayed_to_others_not_sender() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let mut bob = connect(addr, "pad").await;
    let mut carol = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 3).await;

    let update = Frame::update(b"insert 'hi' at 0");
    alice
        .send(Message::Binary(update.as_bytes().clone()))
        .await
        .unwrap();

    assert_eq!(recv_binary(&mut bob).await, *update.as_bytes());
    assert_eq!(recv_binary(&mut carol).await, *update.as_bytes());
    assert!(nothing_within(&mut alice, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_ping_never_relayed() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let mut bob = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 2).await;

    alice
        .send(Message::Binary(Frame::ping().into_bytes()))
        .await
        .unwrap();
    let update = Frame::update(b"after ping");
    alice
        .send(Message::Binary(update.as_bytes().clone()))
        .await
        .unwrap();

    // The first thing bob sees is the update
    let received = recv_binary(&mut bob).await;
    assert_eq!(received[0], FrameTag::Update.as_byte());
    assert_eq!(&received[1..], b"after ping");
}

#[tokio::test]
async fn test_unknown_tag_passed_through() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let mut bob = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 2).await;

    let raw = Bytes::from_static(&[0x7f, 0xde, 0xad]);
    alice.send(Message::Binary(raw.clone())).await.unwrap();
    assert_eq!(recv_binary(&mut bob).await, raw);
}

#[tokio::test]
async fn test_sender_order_preserved() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let mut bob = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 2).await;

    for i in 0..20u8 {
        alice
            .send(Message::Binary(Frame::update(&[i]).into_bytes()))
            .await
            .unwrap();
    }
    for i in 0..20u8 {
        let frame = recv_binary(&mut bob).await;
        assert_eq!(&frame[1..], &[i]);
    }
}

#[tokio::test]
async fn test_eleventh_peer_rejected() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut peers = Vec::new();
    for _ in 0..10 {
        peers.push(connect(addr, "pad").await);
    }
    wait_for_room_size(&server, "pad", 10).await;

    let mut late = connect(addr, "pad").await;
    let (code, reason) = expect_close(&mut late).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "room full");

    assert_eq!(server.engine().rooms().room_size("pad").await, 10);
    assert_eq!(server.stats().await.rejected_full, 1);
}

#[tokio::test]
async fn test_unknown_document_closed() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut ws = connect(addr, "ghost").await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "document not found");

    assert!(!server.engine().rooms().has_room("ghost").await);
    assert_eq!(server.stats().await.rejected_not_found, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, addr) = start_test_server(&["a", "b"]).await;
    let mut a1 = connect(addr, "a").await;
    let mut a2 = connect(addr, "a").await;
    let mut b1 = connect(addr, "b").await;
    wait_for_room_size(&server, "a", 2).await;
    wait_for_room_size(&server, "b", 1).await;

    a1.send(Message::Binary(Frame::update(b"only a").into_bytes()))
        .await
        .unwrap();
    assert_eq!(&recv_binary(&mut a2).await[1..], b"only a");
    assert!(nothing_within(&mut b1, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_disconnect_cleans_up_room() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let bob = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 2).await;

    // Abrupt drop, no close handshake
    drop(bob);
    wait_for_room_size(&server, "pad", 1).await;

    // Broadcasting into the shrunken room never reaches the sender
    alice
        .send(Message::Binary(Frame::update(b"still here").into_bytes()))
        .await
        .unwrap();
    assert!(nothing_within(&mut alice, Duration::from_millis(100)).await);

    alice.close(None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while server.engine().rooms().has_room("pad").await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("empty room was never removed");

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.active_rooms, 0);
}

#[tokio::test]
async fn test_text_and_empty_frames_ignored() {
    let (server, addr) = start_test_server(&["pad"]).await;
    let mut alice = connect(addr, "pad").await;
    let mut bob = connect(addr, "pad").await;
    wait_for_room_size(&server, "pad", 2).await;

    alice.send(Message::Text("hello".into())).await.unwrap();
    alice.send(Message::Binary(Bytes::new())).await.unwrap();
    alice
        .send(Message::Binary(Frame::update(b"real").into_bytes()))
        .await
        .unwrap();

    assert_eq!(&recv_binary(&mut bob).await[1..], b"real");
    assert_eq!(server.engine().rooms().room_size("pad").await, 2);
}
