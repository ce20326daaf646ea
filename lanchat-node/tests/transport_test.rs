//! Transport over real loopback TCP: framing, short reads, concurrent sends, failures.

use std::collections::HashSet;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lanchat_core::{encode_frame, Envelope, MessageType};
use lanchat_node::{events, Config, EventReceiver, NodeError, NodeEvent, Outbound, TransportService};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_config() -> Config {
    Config {
        username: "alice".into(),
        discovery_port: 0,
        transport_port: 0,
        ..Config::default()
    }
}

async fn start_receiver() -> (TransportService, EventReceiver, u16) {
    let (tx, rx) = events::channel(64);
    let mut service = TransportService::new(test_config(), tx);
    service.start().await.unwrap();
    let port = service.local_addr().unwrap().port();
    (service, rx, port)
}

async fn next_message(rx: &mut EventReceiver) -> Envelope {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(NodeEvent::Message(m))) => m,
        other => panic!("expected message event, got {:?}", other),
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn send_text_delivers_with_socket_sender_ip() {
    let (_service, mut rx, port) = start_receiver().await;
    let bob = Outbound::new("bob", port);
    bob.send_text(LOCALHOST, "hello alice").await.unwrap();

    let msg = next_message(&mut rx).await;
    assert_eq!(msg.kind(), MessageType::Text);
    assert_eq!(msg.sender_name(), "bob");
    assert_eq!(msg.sender_ip(), "127.0.0.1");
    assert_eq!(msg.text_body(), Some("hello alice"));
}

#[tokio::test]
async fn sender_supplied_ip_is_overwritten() {
    let (_service, mut rx, port) = start_receiver().await;
    let forged = Envelope::text("mallory", "trust me").with_sender_ip("10.66.66.66");
    Outbound::new("mallory", port)
        .send_envelope(SocketAddr::new(LOCALHOST, port), &forged)
        .await
        .unwrap();
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.sender_ip(), "127.0.0.1");
}

#[tokio::test]
async fn back_to_back_frames_in_tiny_chunks() {
    let (_service, mut rx, port) = start_receiver().await;
    let mut bytes = encode_frame(&Envelope::text("bob", "hi")).unwrap();
    bytes.extend(encode_frame(&Envelope::text("bob", "bye")).unwrap());

    let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for b in &bytes {
        stream.write_all(std::slice::from_ref(b)).await.unwrap();
        stream.flush().await.unwrap();
    }
    stream.shutdown().await.unwrap();

    assert_eq!(next_message(&mut rx).await.text_body(), Some("hi"));
    assert_eq!(next_message(&mut rx).await.text_body(), Some("bye"));
}

#[tokio::test]
async fn short_read_is_clean_end_of_connection() {
    let (service, mut rx, port) = start_receiver().await;
    {
        let mut stream = std::net::TcpStream::connect((LOCALHOST, port)).unwrap();
        stream.write_all(&100u32.to_be_bytes()).unwrap();
        stream.write_all(&[b'{'; 40]).unwrap();
    }

    Outbound::new("bob", port)
        .send_text(LOCALHOST, "still here")
        .await
        .unwrap();
    assert_eq!(next_message(&mut rx).await.text_body(), Some("still here"));
    assert!(service.is_running());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_frame_only_kills_its_connection() {
    let (service, mut rx, port) = start_receiver().await;
    let mut bad = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    let body = b"\xff\xfe not an envelope";
    bad.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
    bad.write_all(body).await.unwrap();

    Outbound::new("bob", port)
        .send_text(LOCALHOST, "unaffected")
        .await
        .unwrap();
    assert_eq!(next_message(&mut rx).await.text_body(), Some("unaffected"));
    assert!(service.is_running());
}

#[tokio::test]
async fn concurrent_sends_each_arrive() {
    let (_service, mut rx, port) = start_receiver().await;
    let bob = Outbound::new("bob", port);
    let mut sends = tokio::task::JoinSet::new();
    for i in 0..16 {
        let bob = bob.clone();
        sends.spawn(async move { bob.send_text(LOCALHOST, &format!("msg {}", i)).await });
    }
    while let Some(res) = sends.join_next().await {
        res.unwrap().unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..16 {
        let msg = next_message(&mut rx).await;
        seen.insert(msg.text_body().unwrap().to_string());
    }
    let expected: HashSet<String> = (0..16).map(|i| format!("msg {}", i)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn file_data_is_not_dispatched() {
    let (_service, mut rx, port) = start_receiver().await;
    let bob = Outbound::new("bob", port);
    let addr = SocketAddr::new(LOCALHOST, port);
    let data = Envelope::new(MessageType::FileData, "bob", "", Default::default());
    bob.send_envelope(addr, &data).await.unwrap();
    bob.send_text(LOCALHOST, "after data").await.unwrap();
    assert_eq!(next_message(&mut rx).await.text_body(), Some("after data"));
}

#[tokio::test]
async fn file_offer_carries_name_and_size() {
    let (_service, mut rx, port) = start_receiver().await;
    let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
    file.write_all(b"hello world").unwrap();
    file.flush().unwrap();

    Outbound::new("bob", port)
        .send_file_offer(LOCALHOST, file.path())
        .await
        .unwrap();
    let msg = next_message(&mut rx).await;
    let offer = msg.file_offer_body().unwrap();
    assert_eq!(offer.filesize, 11);
    assert_eq!(
        offer.filename,
        file.path().file_name().unwrap().to_string_lossy()
    );
}

#[tokio::test]
async fn file_offer_rejects_directory_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let bob = Outbound::new("bob", free_port().await);
    assert!(matches!(
        bob.send_file_offer(LOCALHOST, dir.path()).await,
        Err(NodeError::NotAFile(_))
    ));
    assert!(matches!(
        bob.send_file_offer(LOCALHOST, &dir.path().join("absent")).await,
        Err(NodeError::Io { .. })
    ));
}

#[tokio::test]
async fn send_to_unreachable_peer_is_error() {
    let port = free_port().await;
    let res = Outbound::new("bob", port).send_text(LOCALHOST, "anyone?").await;
    match res {
        Err(NodeError::Connection { addr, .. }) => assert_eq!(addr.port(), port),
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn stop_closes_listener() {
    let (mut service, _rx, port) = start_receiver().await;
    service.stop().await;
    assert!(!service.is_running());
    assert!(service.local_addr().is_none());
    let res = Outbound::new("bob", port).send_text(LOCALHOST, "gone").await;
    assert!(matches!(res, Err(NodeError::Connection { .. })));
}

#[tokio::test]
async fn second_listener_on_same_port_fails_to_bind() {
    let (first, _rx, port) = start_receiver().await;
    let (tx, _rx2) = events::channel(4);
    let mut second = TransportService::new(
        Config {
            transport_port: port,
            ..test_config()
        },
        tx,
    );
    assert!(matches!(
        second.start().await,
        Err(NodeError::Bind { kind: "transport", .. })
    ));
    assert!(!second.is_running());
    assert!(first.is_running());
}

#[tokio::test]
async fn outbound_from_ephemeral_listener_dials_bound_port() {
    let (service, mut rx, port) = start_receiver().await;
    let outbound = service.outbound();
    outbound.send_text(LOCALHOST, "to myself").await.unwrap();
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.sender_name(), "alice");
    assert_eq!(msg.text_body(), Some("to myself"));
    assert_ne!(port, 0);
}
