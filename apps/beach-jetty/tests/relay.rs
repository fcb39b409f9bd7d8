mod common;

use std::sync::Arc;
use std::time::Duration;

use beach_jetty::codec::MAX_LINE_LENGTH;
use beach_jetty::control_plane::{paths, MemoryControlPlane, SharedControlPlane};
use beach_jetty::lifecycle::DisconnectReason;
use beach_jetty::reaper::Reaper;
use beach_jetty::transport::TransportHandle;
use beach_jetty::{RelayEngine, RelayError};
use common::{eventually, frame_data, FixedClock, Relay};
use serde_json::json;

#[test_timeout::tokio_timeout_test]
async fn test_registrations_match_connections_in_arrival_order() {
    let relay = Relay::start().await;
    let first = relay.connect().await;
    let second = relay.connect().await;
    let third = relay.connect().await;
    assert_eq!(relay.engine.pending_count(), 3);

    let mut identities = Vec::new();
    for (label, peer) in [("PC1", &first), ("PC2", &second), ("PC3", &third)] {
        let identity = relay.engine.register(label).await.unwrap();
        assert_eq!(identity.len(), 16);
        let session = relay.engine.session(&identity).unwrap();
        assert_eq!(session.label, label);
        assert_eq!(session.address, peer.local.to_string());
        identities.push(identity);
    }
    identities.sort();
    identities.dedup();
    assert_eq!(identities.len(), 3);
    assert_eq!(relay.engine.pending_count(), 0);

    let err = relay.engine.register("PC4").await.unwrap_err();
    assert!(matches!(err, RelayError::NoPendingConnection));
    assert_eq!(relay.engine.session_count(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn test_concurrent_registrations_claim_one_connection_once() {
    let relay = Relay::start().await;
    let _peer = relay.connect().await;

    let (a, b) = tokio::join!(relay.engine.register("A"), relay.engine.register("B"));
    let wins = [&a, &b].iter().filter(|result| result.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(RelayError::NoPendingConnection)));
    assert_eq!(relay.engine.session_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn test_registration_publishes_record() {
    let relay = Relay::start().await;
    let peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    let record = relay.control.get(&paths::record(&identity)).await.unwrap();
    assert_eq!(record["status"], json!("connected"));
    assert_eq!(record["pc_name"], json!("PC1"));
    assert_eq!(record["address"], json!(peer.local.to_string()));
    assert!(record["last_seen"].is_string());
    assert_eq!(
        relay.control.get(&paths::label(&identity)).await.unwrap(),
        json!("PC1")
    );
    assert_eq!(
        relay.control.get(&paths::address(&identity)).await.unwrap(),
        json!(peer.local.to_string())
    );
}

#[test_timeout::tokio_timeout_test]
async fn test_commands_are_delivered_once_in_order() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    relay
        .control
        .set(&paths::command(&identity), json!("whoami"))
        .await
        .unwrap();
    relay
        .control
        .set(&paths::command(&identity), json!("pwd"))
        .await
        .unwrap();

    let first = peer.next_line().await.unwrap();
    assert!(first.starts_with('['));
    assert!(first.ends_with("] Firebase Change - Path: /exe/command, Data: whoami"));
    let second = peer.next_line().await.unwrap();
    assert_eq!(frame_data(&second), "pwd");
}

#[test_timeout::tokio_timeout_test]
async fn test_stream_output_is_published_verbatim() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    peer.send("  alice\tadmin ").await;
    let control = Arc::clone(&relay.control);
    let output_path = paths::output(&identity);
    eventually(|| {
        let control = Arc::clone(&control);
        let output_path = output_path.clone();
        async move { control.get(&output_path).await.unwrap() == json!("  alice\tadmin ") }
    })
    .await;
}

#[test_timeout::tokio_timeout_test]
async fn test_undecodable_output_keeps_the_session() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    peer.send_raw(b"caf\xe9\n").await;
    let control = Arc::clone(&relay.control);
    let output_path = paths::output(&identity);
    eventually(|| {
        let control = Arc::clone(&control);
        let output_path = output_path.clone();
        async move { control.get(&output_path).await.unwrap() == json!("caf\u{fffd}") }
    })
    .await;

    assert!(relay.engine.has_session(&identity));
    assert_eq!(
        relay.control.get(&paths::status(&identity)).await.unwrap(),
        json!("connected")
    );
    relay
        .control
        .set(&paths::command(&identity), json!("whoami"))
        .await
        .unwrap();
    assert_eq!(frame_data(&peer.next_line().await.unwrap()), "whoami");
}

#[test_timeout::tokio_timeout_test]
async fn test_overlong_line_is_dropped_without_disconnect() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    peer.send_raw(&vec![b'x'; MAX_LINE_LENGTH + 1]).await;
    peer.send("").await;
    peer.send("after").await;

    let control = Arc::clone(&relay.control);
    let output_path = paths::output(&identity);
    eventually(|| {
        let control = Arc::clone(&control);
        let output_path = output_path.clone();
        async move { control.get(&output_path).await.unwrap() == json!("after") }
    })
    .await;
    assert!(relay.engine.has_session(&identity));
}

#[test_timeout::tokio_timeout_test]
async fn test_output_by_label_uses_the_earliest_session() {
    let relay = Relay::start().await;
    let _a = relay.connect().await;
    let _b = relay.connect().await;
    let first = relay.engine.register("shared").await.unwrap();
    let _second = relay.engine.register("shared").await.unwrap();

    let attributed = relay.engine.report_output(None, "shared", "hello").await;
    assert_eq!(attributed.as_deref(), Some(first.as_str()));
    assert_eq!(
        relay.control.get(&paths::output(&first)).await.unwrap(),
        json!("hello")
    );

    assert!(relay
        .engine
        .report_output(None, "nobody", "lost")
        .await
        .is_none());
}

#[test_timeout::tokio_timeout_test]
async fn test_transport_close_marks_session_disconnected() {
    let relay = Relay::start().await;
    let peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();
    assert_eq!(relay.memory.watcher_count_at(&paths::command(&identity)), 1);

    drop(peer);

    let control = Arc::clone(&relay.control);
    let status_path = paths::status(&identity);
    eventually(|| {
        let control = Arc::clone(&control);
        let status_path = status_path.clone();
        async move { control.get(&status_path).await.unwrap() == json!("disconnected") }
    })
    .await;
    assert!(!relay.engine.has_session(&identity));
    assert_eq!(relay.memory.watcher_count_at(&paths::command(&identity)), 0);
    assert_eq!(relay.memory.watcher_count_at(&paths::status(&identity)), 0);
}

#[test_timeout::tokio_timeout_test]
async fn test_no_commands_are_delivered_after_disconnect() {
    let memory = MemoryControlPlane::new();
    let control: SharedControlPlane = memory.clone();
    let engine = RelayEngine::new(Arc::clone(&control));
    let (transport, mut rx) = TransportHandle::new("10.0.0.8:40000".parse().unwrap());
    let _ticket = engine.enqueue(transport.clone());
    let identity = engine.register("PC1").await.unwrap();

    control
        .set(&paths::command(&identity), json!("whoami"))
        .await
        .unwrap();
    assert_eq!(frame_data(&rx.recv().await.unwrap()), "whoami");

    engine
        .disconnect(transport.id(), Some(&identity), DisconnectReason::TransportClosed)
        .await;
    control
        .set(&paths::command(&identity), json!("pwd"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(memory.watcher_count_at(&paths::command(&identity)), 0);
    assert!(!engine.has_session(&identity));
}

#[test_timeout::tokio_timeout_test]
async fn test_unregistered_close_leaves_no_pending_entry() {
    let relay = Relay::start().await;
    let peer = relay.connect().await;
    assert_eq!(relay.engine.pending_count(), 1);
    drop(peer);

    let engine = Arc::clone(&relay.engine);
    eventually(|| {
        let engine = Arc::clone(&engine);
        async move { engine.pending_count() == 0 }
    })
    .await;
    assert!(matches!(
        relay.engine.register("late").await,
        Err(RelayError::NoPendingConnection)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn test_deleted_record_closes_the_stream() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();

    relay.control.delete(&paths::record(&identity)).await.unwrap();

    assert_eq!(peer.next_line().await, None);
    let engine = Arc::clone(&relay.engine);
    let watched = identity.clone();
    eventually(|| {
        let engine = Arc::clone(&engine);
        let watched = watched.clone();
        async move { !engine.has_session(&watched) }
    })
    .await;
    assert!(relay
        .control
        .get(&paths::record(&identity))
        .await
        .unwrap()
        .is_null());
}

#[test_timeout::tokio_timeout_test]
async fn test_colliding_identity_rebinds_without_second_subscription() {
    let memory = MemoryControlPlane::new();
    let control: SharedControlPlane = memory.clone();
    let engine = RelayEngine::with_clock(Arc::clone(&control), FixedClock::new());
    let peer = "10.0.0.7:40000".parse().unwrap();

    let (old_transport, mut old_rx) = TransportHandle::new(peer);
    let mut old_ticket = engine.enqueue(old_transport.clone());
    let identity = engine.register("PC1").await.unwrap();
    let old_promotion = old_ticket.promoted().await.unwrap();
    assert_eq!(old_promotion.identity, identity);

    let (new_transport, mut new_rx) = TransportHandle::new(peer);
    let _new_ticket = engine.enqueue(new_transport.clone());
    assert_eq!(engine.register("PC1").await.unwrap(), identity);

    assert_eq!(
        old_promotion.evicted.await.unwrap(),
        DisconnectReason::Superseded
    );
    assert_eq!(memory.watcher_count_at(&paths::command(&identity)), 1);
    assert_eq!(engine.session_count(), 1);

    control
        .set(&paths::command(&identity), json!("whoami"))
        .await
        .unwrap();
    let frame = new_rx.recv().await.unwrap();
    assert_eq!(frame_data(&frame), "whoami");
    assert!(old_rx.try_recv().is_err());

    // The superseded worker's cleanup must not end its successor's session.
    engine
        .disconnect(old_transport.id(), Some(&identity), DisconnectReason::Superseded)
        .await;
    assert!(engine.has_session(&identity));
    assert_eq!(
        control.get(&paths::status(&identity)).await.unwrap(),
        json!("connected")
    );
}

#[test_timeout::tokio_timeout_test]
async fn test_reaper_keeps_responsive_peers_and_removes_silent_ones() {
    let relay = Relay::start().await;
    let mut alive = relay.connect().await;
    let silent = relay.connect().await;
    let alive_id = relay.engine.register("alive").await.unwrap();
    let silent_id = relay.engine.register("silent").await.unwrap();

    tokio::spawn(async move {
        while let Some(frame) = alive.next_line().await {
            let reply = format!("ran {}", frame_data(&frame));
            alive.send(&reply).await;
        }
    });

    let reaper = Reaper::new(
        Arc::clone(&relay.control),
        Duration::from_millis(200),
        relay.engine.reap_guard(),
    );
    let report = reaper.run_pass().await;

    assert_eq!(report.probed.len(), 2);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, silent_id);
    assert_eq!(
        relay.control.get(&paths::output(&alive_id)).await.unwrap(),
        json!("ran pwd")
    );
    assert!(relay
        .control
        .get(&paths::record(&silent_id))
        .await
        .unwrap()
        .is_null());

    let engine = Arc::clone(&relay.engine);
    let reaped = silent_id.clone();
    eventually(|| {
        let engine = Arc::clone(&engine);
        let reaped = reaped.clone();
        async move { !engine.has_session(&reaped) }
    })
    .await;
    assert!(relay.engine.has_session(&alive_id));
    drop(silent);
}

#[test_timeout::tokio_timeout_test]
async fn test_reaper_removes_peer_answering_both_probes_identically() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("static").await.unwrap();

    tokio::spawn(async move {
        while peer.next_line().await.is_some() {
            peer.send("ok").await;
        }
    });

    let reaper = Reaper::new(
        Arc::clone(&relay.control),
        Duration::from_millis(200),
        relay.engine.reap_guard(),
    );
    let report = reaper.run_pass().await;

    assert_eq!(report.probed.len(), 1);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.removed[0].id, identity);
    assert!(relay
        .control
        .get(&paths::record(&identity))
        .await
        .unwrap()
        .is_null());
}

#[test_timeout::tokio_timeout_test]
async fn test_shutdown_disconnects_every_session() {
    let relay = Relay::start().await;
    let mut peer = relay.connect().await;
    let identity = relay.engine.register("PC1").await.unwrap();
    let _waiting = relay.connect().await;

    relay.shutdown.cancel();
    relay.engine.shutdown().await;

    assert_eq!(relay.engine.session_count(), 0);
    assert_eq!(relay.engine.pending_count(), 0);
    assert_eq!(
        relay.control.get(&paths::status(&identity)).await.unwrap(),
        json!("disconnected")
    );
    assert_eq!(peer.next_line().await, None);
}
