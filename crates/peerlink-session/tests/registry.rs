//! End-to-end tests for channel sessions and the registry over loopback channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use peerlink_session::{
    ChannelKind, ChannelSessionRegistry, ChannelState, DataChannel, LoopbackChannel,
    RegistryError, RegistryEvent, SendOutcome, SessionConfig,
};

fn registry(self_id: &str) -> ChannelSessionRegistry {
    ChannelSessionRegistry::new(self_id, SessionConfig::default())
}

fn states(events: &mut broadcast::Receiver<RegistryEvent>) -> Vec<(String, ChannelState)> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::DataChannelState {
            state, channel_id, ..
        } = event
        {
            seen.push((channel_id, state));
        }
    }
    seen
}

#[test]
fn test_scenario_a_connect_open_send() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, _remote) = LoopbackChannel::pair("main");

    let session = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    assert_eq!(states(&mut events), vec![("main".into(), ChannelState::Connecting)]);

    local.establish();
    assert_eq!(states(&mut events), vec![("main".into(), ChannelState::Open)]);
    assert_eq!(session.state(), ChannelState::Open);

    let outcome = registry.send_peer_message("peer1", "hello", false).unwrap();
    assert_eq!(outcome, SendOutcome::Sent);

    let sent = local.sent();
    assert_eq!(sent.len(), 1);
    let wire: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(
        wire,
        json!({
            "type": "message",
            "sender": "self",
            "target": "peer1",
            "data": "hello",
            "isPrivate": false
        })
    );
    assert!(sent[0].starts_with(r#"{"type":"message","#));
}

#[test]
fn test_scenario_b_data_channel_tracked_separately() {
    let registry = registry("self");
    let (main, _main_remote) = LoopbackChannel::pair("main");
    let (file, _file_remote) = LoopbackChannel::pair("file-1");

    let messaging = registry
        .ensure_messaging_session("peer1", |_| Ok(main.clone()))
        .unwrap();
    let data = registry.attach_channel("peer1", file.clone());

    assert_eq!(data.kind(), ChannelKind::Data);
    assert_eq!(messaging.kind(), ChannelKind::Messaging);
    assert_eq!(registry.sessions_for("peer1").len(), 2);
    assert!(Arc::ptr_eq(
        &registry.session("peer1", "file-1").unwrap(),
        &data
    ));
    assert!(Arc::ptr_eq(
        &registry.messaging_session("peer1").unwrap(),
        &messaging
    ));

    let messaging_count = registry
        .sessions_for("peer1")
        .iter()
        .filter(|s| s.kind() == ChannelKind::Messaging)
        .count();
    assert_eq!(messaging_count, 1);
}

#[test]
fn test_scenario_c_send_while_connecting_is_dropped() {
    let registry = registry("self");
    let (local, _remote) = LoopbackChannel::pair("main");
    registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();

    let outcome = registry.send_peer_message("peer1", "hello", false).unwrap();
    assert_eq!(outcome, SendOutcome::Dropped);
    assert!(local.sent().is_empty());
}

#[test]
fn test_scenario_d_disconnect_sequence() {
    let config = SessionConfig {
        drop_closed_sessions: false,
        ..SessionConfig::default()
    };
    let registry = ChannelSessionRegistry::new("self", config);
    let mut events = registry.subscribe();
    let (local, _remote) = LoopbackChannel::pair("main");
    let session = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    local.establish();
    states(&mut events);

    session.disconnect();
    assert_eq!(
        states(&mut events),
        vec![
            ("main".into(), ChannelState::Closing),
            ("main".into(), ChannelState::Closed)
        ]
    );

    session.disconnect();
    assert_eq!(local.close_calls(), 1);
    assert!(states(&mut events).is_empty());
}

#[test]
fn test_scenario_e_inbound_message() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, remote) = LoopbackChannel::pair("main");
    registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    local.establish();

    remote
        .send(r#"{"type":"message","sender":"peer1","target":"self","data":"hi","isPrivate":false}"#)
        .unwrap();

    let message = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            RegistryEvent::IncomingMessage { message, .. } => Some(message),
            _ => None,
        })
        .expect("incoming message event");

    assert_eq!(message.content, json!("hi"));
    assert!(!message.is_private);
    assert!(message.is_data_channel);
    assert_eq!(message.sender_peer_id, "peer1");
}

#[test]
fn test_unknown_and_malformed_payloads_are_silent() {
    let registry = registry("self");
    let (local, remote) = LoopbackChannel::pair("main");
    let session = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    local.establish();
    let mut events = registry.subscribe();

    remote.send(r#"{"type":"wrq","sender":"peer1","data":{}}"#).unwrap();
    remote.send(r#"{"sender":"peer1"}"#).unwrap();
    remote.send("}{").unwrap();

    assert!(events.try_recv().is_err());
    assert_eq!(session.state(), ChannelState::Open);
}

#[test]
fn test_concurrent_ensure_creates_one_session() {
    let registry = registry("self");
    let factory_calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let calls = factory_calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry
                    .ensure_messaging_session("peer1", |label| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let (local, _remote) = LoopbackChannel::pair(label);
                        Ok(local)
                    })
                    .unwrap()
            })
        })
        .collect();

    let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    assert_eq!(registry.sessions_for("peer1").len(), 1);
}

#[test]
fn test_closed_session_is_removed() {
    let registry = registry("self");
    let (local, remote) = LoopbackChannel::pair("file-1");
    registry.attach_channel("peer1", local.clone());
    local.establish();

    remote.close().unwrap();

    assert!(registry.session("peer1", "file-1").is_none());
    assert_eq!(registry.session_count(), 0);
}

#[test]
fn test_error_then_close_two_notifications() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, remote) = LoopbackChannel::pair("main");
    registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    local.establish();
    states(&mut events);

    local.fail("ice failed");
    remote.close().unwrap();

    let mut seen = Vec::new();
    while let Ok(RegistryEvent::DataChannelState { state, error, .. }) = events.try_recv() {
        seen.push((state, error));
    }
    assert_eq!(
        seen,
        vec![
            (ChannelState::Error, Some("ice failed".to_string())),
            (ChannelState::Closed, None)
        ]
    );
}

#[test]
fn test_close_peer_disconnects_everything() {
    let registry = registry("self");
    let (main, main_remote) = LoopbackChannel::pair("main");
    let (file, _file_remote) = LoopbackChannel::pair("file-1");
    registry
        .ensure_messaging_session("peer1", |_| Ok(main.clone()))
        .unwrap();
    registry.attach_channel("peer1", file.clone());
    main.establish();
    file.establish();

    registry.close_peer("peer1");

    assert_eq!(main.close_calls(), 1);
    assert_eq!(file.close_calls(), 1);
    assert!(registry.peer_ids().is_empty());
    assert!(matches!(
        registry.send_peer_message("peer1", "bye", false),
        Err(RegistryError::NoChannel(_))
    ));
    assert_eq!(main_remote.ready_state(), peerlink_session::ReadyState::Closed);
}

#[test]
fn test_two_registries_exchange_messages() {
    let alice = registry("alice");
    let bob = registry("bob");
    let mut bob_events = bob.subscribe();

    let (alice_end, bob_end) = LoopbackChannel::pair("main");
    alice
        .ensure_messaging_session("bob", |_| Ok(alice_end.clone()))
        .unwrap();
    bob.attach_channel("alice", bob_end);
    alice_end.establish();

    alice
        .send_peer_message("bob", json!({"text": "hi bob"}), true)
        .unwrap();

    let received = std::iter::from_fn(|| bob_events.try_recv().ok())
        .find_map(|event| match event {
            RegistryEvent::IncomingMessage {
                message, is_self, ..
            } => Some((message, is_self)),
            _ => None,
        })
        .expect("bob receives the message");

    assert_eq!(received.0.content, json!({"text": "hi bob"}));
    assert!(received.0.is_private);
    assert_eq!(received.0.sender_peer_id, "alice");
    assert_eq!(received.0.target_peer_id, "bob");
    assert!(!received.1);

    // Replying uses bob's adopted MESSAGING session
    let outcome = bob.send_peer_message("alice", "hi alice", false).unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
}

#[tokio::test(start_paused = true)]
async fn test_already_open_channel_settles() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, _remote) = LoopbackChannel::pair("main");
    local.establish();

    let session = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    assert!(states(&mut events).is_empty());
    assert_eq!(
        registry.send_peer_message("peer1", "early", false).unwrap(),
        SendOutcome::Dropped
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(states(&mut events), vec![("main".into(), ChannelState::Open)]);
    assert_eq!(session.state(), ChannelState::Open);
    assert_eq!(
        registry.send_peer_message("peer1", "settled", false).unwrap(),
        SendOutcome::Sent
    );
}

#[test]
fn test_error_while_open_does_not_silence_peer() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, _remote) = LoopbackChannel::pair("main");
    let session = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    local.establish();
    states(&mut events);

    local.fail("transient");
    assert_eq!(
        states(&mut events),
        vec![("main".into(), ChannelState::Error)]
    );
    assert_eq!(local.ready_state(), peerlink_session::ReadyState::Open);

    let outcome = registry.send_peer_message("peer1", "after error", false).unwrap();
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(local.sent().len(), 1);

    let again = registry
        .ensure_messaging_session("peer1", |_| Ok(local.clone()))
        .unwrap();
    assert!(Arc::ptr_eq(&session, &again));
}

#[test]
fn test_attach_closed_channel_is_not_kept() {
    let registry = registry("self");
    let mut events = registry.subscribe();
    let (local, _remote) = LoopbackChannel::pair("file-1");
    local.close().unwrap();

    let session = registry.attach_channel("peer1", local.clone());

    assert_eq!(session.state(), ChannelState::Closed);
    assert_eq!(
        states(&mut events),
        vec![("file-1".into(), ChannelState::Closed)]
    );
    assert!(registry.session("peer1", "file-1").is_none());
    assert!(registry.peer_ids().is_empty());
}
