//! Rendezvous server and client over loopback WebSockets.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use shoal_discovery::{
    ChannelState, ClientMessage, EventReceiver, PeerId, RegionId, RendezvousClient,
    RendezvousClientConfig, RendezvousError, RendezvousEvent, RendezvousServer,
    RendezvousServerConfig, RendezvousServerHandle, ServerMessage,
};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> RendezvousServerHandle {
    let config = RendezvousServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..RendezvousServerConfig::default()
    };
    RendezvousServer::bind(config).await.unwrap().spawn()
}

async fn join(server: &RendezvousServerHandle) -> (RendezvousClient, EventReceiver) {
    RendezvousClient::connect(RendezvousClientConfig::new(server.url()))
        .await
        .unwrap()
}

/// Wait for the first event matching `pred`, skipping others
async fn wait_for<F>(events: &mut EventReceiver, mut pred: F) -> RendezvousEvent
where
    F: FnMut(&RendezvousEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until a pushed peer list contains exactly `expected`
async fn wait_for_peers(events: &mut EventReceiver, expected: &[&PeerId]) {
    wait_for(events, |event| match event {
        RendezvousEvent::PeerList(peers) => {
            peers.len() == expected.len()
                && expected
                    .iter()
                    .all(|id| peers.iter().any(|p| &p.peer_id == *id))
        }
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_directed_message_delivered_to_named_peer() {
    let server = start_server().await;
    let (alice, _alice_events) = join(&server).await;
    let (bob, mut bob_events) = join(&server).await;
    assert_ne!(alice.peer_id(), bob.peer_id());
    assert_eq!(alice.state(), ChannelState::Connected);

    alice
        .send_to(bob.peer_id(), "offer", json!({"sdp": "v=0"}))
        .await
        .unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, RendezvousEvent::Directed { .. })
    })
    .await;
    assert_eq!(
        event,
        RendezvousEvent::Directed {
            from: alice.peer_id().clone(),
            kind: "offer".to_string(),
            data: json!({"sdp": "v=0"}),
        }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server).await;
    let (bob, mut bob_events) = join(&server).await;
    wait_for_peers(&mut alice_events, &[alice.peer_id(), bob.peer_id()]).await;

    alice.broadcast("announce", json!({"file": "abc"})).await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, RendezvousEvent::Broadcast { .. })
    })
    .await;
    assert_eq!(
        event,
        RendezvousEvent::Broadcast {
            from: alice.peer_id().clone(),
            kind: "announce".to_string(),
            payload: json!({"file": "abc"}),
        }
    );

    // Bob's reply arriving first proves Alice's own broadcast was not echoed
    bob.send_to(alice.peer_id(), "ack", json!(null)).await.unwrap();
    let next = wait_for(&mut alice_events, |e| {
        !matches!(e, RendezvousEvent::PeerList(_))
    })
    .await;
    assert!(matches!(next, RendezvousEvent::Directed { ref kind, .. } if kind == "ack"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_send_to_disconnected_peer_reports_delivery_failure() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server).await;
    let (bob, _bob_events) = join(&server).await;
    wait_for_peers(&mut alice_events, &[alice.peer_id(), bob.peer_id()]).await;

    let bob_id = bob.peer_id().clone();
    bob.disconnect();
    wait_for_peers(&mut alice_events, &[alice.peer_id()]).await;

    // The send itself succeeds; the server is not obliged to deliver
    alice.send_to(&bob_id, "offer", json!(1)).await.unwrap();

    let event = wait_for(&mut alice_events, |e| {
        matches!(e, RendezvousEvent::DeliveryFailed { .. })
    })
    .await;
    assert_eq!(event, RendezvousEvent::DeliveryFailed { to: bob_id });

    server.shutdown().await;
}

#[tokio::test]
async fn test_send_after_disconnect_fails() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server).await;

    alice.disconnect();
    wait_for(&mut alice_events, |e| *e == RendezvousEvent::Disconnected).await;
    assert_eq!(alice.state(), ChannelState::Disconnected);

    let result = alice.broadcast("late", json!(null)).await;
    assert!(matches!(result, Err(RendezvousError::NotConnected)));

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let server = start_server().await;
    let (alice, mut alice_events) = join(&server).await;

    server.shutdown().await;

    wait_for(&mut alice_events, |e| *e == RendezvousEvent::Disconnected).await;
    let result = alice.send_to(&PeerId::new("anyone"), "x", json!(null)).await;
    assert!(matches!(result, Err(RendezvousError::NotConnected)));
}

#[tokio::test]
async fn test_peer_list_carries_region() {
    let server = start_server().await;
    let config = RendezvousClientConfig {
        region: Some(RegionId::EuropeWest),
        ..RendezvousClientConfig::new(server.url())
    };
    let (alice, _alice_events) = RendezvousClient::connect(config).await.unwrap();
    let (bob, mut bob_events) = join(&server).await;

    let event = wait_for(&mut bob_events, |e| match e {
        RendezvousEvent::PeerList(peers) => peers.len() == 2,
        _ => false,
    })
    .await;
    let RendezvousEvent::PeerList(peers) = event else {
        unreachable!()
    };
    let alice_record = peers.iter().find(|p| &p.peer_id == alice.peer_id()).unwrap();
    assert_eq!(alice_record.region, Some(RegionId::EuropeWest));
    let bob_record = peers.iter().find(|p| &p.peer_id == bob.peer_id()).unwrap();
    assert_eq!(bob_record.region, None);
    assert!(bob_record.last_seen > 0);

    assert_eq!(server.peer_count(), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_issues_new_peer_id() {
    let server = start_server().await;
    let (first, mut first_events) = join(&server).await;
    let first_id = first.peer_id().clone();
    first.disconnect();
    wait_for(&mut first_events, |e| *e == RendezvousEvent::Disconnected).await;

    let (second, _events) = join(&server).await;
    assert_ne!(second.peer_id(), &first_id);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_dropped_without_closing_session() {
    let server = start_server().await;
    let (bob, mut bob_events) = join(&server).await;

    // A hand-driven session, so it can send frames the client never would
    let (mut socket, _) = connect_async(server.url()).await.unwrap();
    let register = ClientMessage::Register { region: None }.to_text().unwrap();
    socket.send(Message::Text(register)).await.unwrap();
    let raw_id = timeout(WAIT, async {
        loop {
            let frame = socket.next().await.expect("socket closed").unwrap();
            if let Message::Text(text) = frame
                && let Ok(ServerMessage::Registered { peer_id }) = ServerMessage::from_text(&text)
            {
                return peer_id;
            }
        }
    })
    .await
    .expect("no registration acknowledgement");

    timeout(WAIT, async {
        while server.peer_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("raw session never listed");

    socket.send(Message::Text("not json".to_string())).await.unwrap();
    socket
        .send(Message::Text(r#"{"type":"dance"}"#.to_string()))
        .await
        .unwrap();
    let directed = ClientMessage::Directed {
        to: bob.peer_id().clone(),
        kind: "offer".to_string(),
        data: json!({"n": 1}),
    };
    socket
        .send(Message::Text(directed.to_text().unwrap()))
        .await
        .unwrap();

    // Frames are handled in order, so delivery proves the bad ones were skipped
    let event = wait_for(&mut bob_events, |e| {
        matches!(e, RendezvousEvent::Directed { .. })
    })
    .await;
    assert_eq!(
        event,
        RendezvousEvent::Directed {
            from: raw_id,
            kind: "offer".to_string(),
            data: json!({"n": 1}),
        }
    );
    assert_eq!(server.peer_count(), 2);

    server.shutdown().await;
}
