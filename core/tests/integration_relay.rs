//! Flood-relay behavior exercised through a real listener with raw TCP
//! peers standing in for neighbors.

use quakemesh_core::{Node, NodeConfig, NodeEvent};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn mesh_config(dedup_ttl: Duration) -> NodeConfig {
    NodeConfig {
        bootstrap_servers: Vec::new(),
        listen_port: 0,
        dedup_ttl,
        io_timeout: Duration::from_secs(1),
        ..NodeConfig::default()
    }
}

/// A raw neighbor: connects, consumes the 614/612 greeting, and announces
/// the given peer id with a 632 ack.
async fn join_as_peer(port: u16, peer_id: u32) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut greeting = Vec::new();
    // 614 and 612 may arrive in one segment or two.
    while !String::from_utf8_lossy(&greeting).contains("612 1\r\n") {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "listener closed during greeting");
        greeting.extend_from_slice(&buf[..n]);
    }
    let announce = format!("632 1 {peer_id}\r\n");
    stream.write_all(announce.as_bytes()).await.unwrap();
    stream
}

async fn read_line_from(stream: &mut TcpStream) -> String {
    let mut collected = Vec::new();
    loop {
        let mut buf = [0u8; 256];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for a relay line")
            .unwrap();
        assert!(n > 0, "peer connection closed");
        collected.extend_from_slice(&buf[..n]);
        if collected.ends_with(b"\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&collected).trim_end().to_string()
}

async fn expect_silence(stream: &mut TcpStream, window: Duration) {
    let mut buf = [0u8; 256];
    match timeout(window, stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!(
            "expected silence, got {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        Ok(Err(e)) => panic!("read failed while expecting silence: {e}"),
    }
}

#[tokio::test]
async fn test_relay_floods_once_and_acks_sender() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    let mut peer_c = join_as_peer(port, 22).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    peer_b.write_all(b"615 1 E1:quake\r\n").await.unwrap();

    // C sees the forwarded copy with the hop counter bumped.
    let forwarded = read_line_from(&mut peer_c).await;
    assert_eq!(forwarded, "615 2 E1:quake");

    // B gets the direct acknowledgment listing our known peer ids.
    let ack = read_line_from(&mut peer_b).await;
    assert_eq!(ack, "635 0 E1:21,22");

    // The same identity from another peer is suppressed.
    peer_c.write_all(b"615 1 E1:quake\r\n").await.unwrap();
    expect_silence(&mut peer_b, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_relay_forwards_again_after_ttl() {
    let (node, _events) = Node::new(mesh_config(Duration::from_millis(300))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    let mut peer_c = join_as_peer(port, 22).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    peer_b.write_all(b"615 1 E2:first\r\n").await.unwrap();
    assert_eq!(read_line_from(&mut peer_c).await, "615 2 E2:first");
    let _ack = read_line_from(&mut peer_b).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    // TTL elapsed, the identity counts as new again.
    peer_c.write_all(b"615 1 E2:first\r\n").await.unwrap();
    assert_eq!(read_line_from(&mut peer_b).await, "615 2 E2:first");
}

#[tokio::test]
async fn test_local_broadcast_reaches_all_peers() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    let mut peer_c = join_as_peer(port, 22).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    node.broadcast(vec!["E3".into(), "local".into()], None).await;
    assert_eq!(read_line_from(&mut peer_b).await, "615 1 E3:local");
    assert_eq!(read_line_from(&mut peer_c).await, "615 1 E3:local");

    // An echo of our own broadcast is not re-relayed.
    peer_b.write_all(b"615 1 E3:local\r\n").await.unwrap();
    expect_silence(&mut peer_c, Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_relay_ack_routes_back_to_requester() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    let mut peer_c = join_as_peer(port, 22).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    peer_b.write_all(b"615 1 E9:data\r\n").await.unwrap();
    assert_eq!(read_line_from(&mut peer_c).await, "615 2 E9:data");
    assert_eq!(read_line_from(&mut peer_b).await, "635 0 E9:21,22");

    // C's acknowledgment travels back to B alone, hop counter bumped.
    peer_c.write_all(b"635 0 E9:31,32\r\n").await.unwrap();
    assert_eq!(read_line_from(&mut peer_b).await, "635 1 E9:31,32");
    expect_silence(&mut peer_c, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_relay_ack_without_matching_request_is_dropped() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    let mut peer_c = join_as_peer(port, 22).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nobody relayed EZ through us, so the ack has nowhere to go.
    peer_c.write_all(b"635 0 EZ:31\r\n").await.unwrap();
    expect_silence(&mut peer_b, Duration::from_millis(500)).await;
    expect_silence(&mut peer_c, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_ack_to_own_broadcast_surfaces_peer_candidates() {
    let (node, mut events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer_b = join_as_peer(port, 21).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    node.broadcast(vec!["E5".into(), "x".into()], None).await;
    assert_eq!(read_line_from(&mut peer_b).await, "615 1 E5:x");

    // B acknowledges with ids we have never seen; its own id is filtered.
    peer_b.write_all(b"635 0 E5:77,21,88\r\n").await.unwrap();

    let candidates = loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for peer candidates")
            .expect("event channel closed");
        if let NodeEvent::PeerCandidates { peer_ids } = event {
            break peer_ids;
        }
    };
    assert_eq!(candidates, vec![77, 88]);
}

#[tokio::test]
async fn test_probe_is_acknowledged() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer = join_as_peer(port, 21).await;
    peer.write_all(b"611 1\r\n").await.unwrap();
    assert_eq!(read_line_from(&mut peer).await, "631 1");
}

#[tokio::test]
async fn test_keepalive_probes_inbound_peers() {
    let mut config = mesh_config(Duration::from_secs(60));
    config.keepalive_delay = Duration::from_millis(100);
    config.keepalive_interval = Duration::from_millis(150);
    let (node, _events) = Node::new(config).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer = join_as_peer(port, 21).await;
    // After the grace period the probes arrive on the configured cadence.
    assert_eq!(read_line_from(&mut peer).await, "611 1");
    assert_eq!(read_line_from(&mut peer).await, "611 1");
}

#[tokio::test]
async fn test_aborted_greeting_does_not_pin_an_inbound_slot() {
    let mut config = mesh_config(Duration::from_secs(60));
    config.max_inbound = 1;
    let (node, _events) = Node::new(config).unwrap();
    let port = node.open_listener().await.unwrap();

    // A client that resets the link the moment it connects; the greeting
    // write races the reset.
    let doomed = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    doomed.set_linger(Some(Duration::ZERO)).unwrap();
    drop(doomed);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.status().inbound_peers, 0);

    // The sole inbound slot is still usable.
    let _peer = join_as_peer(port, 21).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.status().inbound_peers, 1);
}

#[tokio::test]
async fn test_unsupported_peer_version_is_rejected() {
    let (node, _events) = Node::new(mesh_config(Duration::from_secs(60))).unwrap();
    let port = node.open_listener().await.unwrap();

    let mut peer = join_as_peer(port, 21).await;
    peer.write_all(b"614 1 0.01\r\n").await.unwrap();

    let reply = read_line_from(&mut peer).await;
    assert_eq!(reply, "694 1");
    // The link is torn down after the reject.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), peer.read(&mut buf))
        .await
        .expect("expected the listener to close the link")
        .unwrap();
    assert_eq!(n, 0);
}
