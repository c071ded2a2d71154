mod common;

use common::*;
use room_mesh::testing::RelayMode;
use room_mesh::signaling::Signal;
use room_mesh::{EmittedEvents, MediaKind, MeshConfig, MeshError, SessionState};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn camera_request_gets_exactly_one_reply() {
    let (relay, network) = room(RelayMode::Broadcast);
    let a = joined(&relay, &network, "a", MeshConfig::default(), audio_only()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let before = a.handle.snapshot().await.unwrap();
    assert!(!before.camera_enabled);
    relay.clear_sent();

    relay
        .inject(
            &"a".to_string(),
            json!({"type": "request-camera-states", "from": "c"}),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let replies = relay.sent_by("a", "camera-disabled");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].to(), Some("c"));
    assert!(relay.sent_by("a", "camera-enabled").is_empty());

    let after = a.handle.snapshot().await.unwrap();
    assert!(after.sessions.is_empty());
    assert!(after.reservations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn camera_toggles_reach_the_room_without_touching_sessions() {
    let (relay, network) = room(RelayMode::Broadcast);
    let (a, mut b) = connect_pair(&relay, &network, MeshConfig::default()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let view = b.handle.snapshot().await.unwrap();
    let record = &view.presence["a"];
    assert!(record.camera_on());
    assert_eq!(record.name.as_deref(), Some("a-name"));
    b.drain_events();

    a.handle.set_camera(false).unwrap();
    let changed = b
        .wait_for(SETTLE, |event| {
            matches!(event, EmittedEvents::PresenceChanged { peer, record } if peer == "a" && !record.camera_on())
        })
        .await;
    assert!(changed.is_some());
    assert!(!a.media.is_enabled(MediaKind::Video));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = b.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, EmittedEvents::SessionState { .. })));
    let view = b.handle.snapshot().await.unwrap();
    assert_eq!(view.session("a").unwrap().state, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn latecomer_learns_existing_presence() {
    let (relay, network) = room(RelayMode::Broadcast);
    let a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    a.handle.set_audio(true).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let b = joined(&relay, &network, "b", MeshConfig::default(), audio_only()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let record = b.handle.snapshot().await.unwrap().presence["a"].clone();
    assert_eq!(record.camera_enabled, Some(true));
    assert_eq!(record.audio_enabled, Some(true));
    let record = a.handle.snapshot().await.unwrap().presence["b"].clone();
    assert_eq!(record.camera_enabled, Some(false));
    assert_eq!(record.audio_enabled, Some(false));
}

#[tokio::test(start_paused = true)]
async fn sustained_speech_is_announced_once() {
    let (relay, network) = room(RelayMode::Broadcast);
    let a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let mut b = joined(&relay, &network, "b", MeshConfig::default(), av()).await;
    a.handle.set_audio(true).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // a cough
    for _ in 0..3 {
        a.handle.audio_level(255).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for _ in 0..20 {
        a.handle.audio_level(0).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(relay.sent_by("a", "mic-active").is_empty());

    for _ in 0..25 {
        a.handle.audio_level(200).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.sent_by("a", "mic-active").len(), 1);
    let speaking = b
        .wait_for(SETTLE, |event| {
            matches!(event, EmittedEvents::PresenceChanged { peer, record } if peer == "a" && record.mic_active)
        })
        .await;
    assert!(speaking.is_some());

    for _ in 0..50 {
        a.handle.audio_level(0).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.sent_by("a", "mic-inactive").len(), 1);
    assert!(!a.handle.snapshot().await.unwrap().mic_active);
}

#[tokio::test(start_paused = true)]
async fn remote_mic_decays_without_an_inactive() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    relay
        .inject(&"a".to_string(), json!({"type": "mic-active", "from": "z"}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.handle.snapshot().await.unwrap().presence["z"].mic_active);

    let quiet = a
        .wait_for(Duration::from_secs(15), |event| {
            matches!(event, EmittedEvents::PresenceChanged { peer, record } if peer == "z" && !record.mic_active)
        })
        .await;
    assert!(quiet.is_some());
}

#[tokio::test(start_paused = true)]
async fn leave_closes_everything_once() {
    let (relay, network) = room(RelayMode::Broadcast);
    let (mut a, mut b) = connect_pair(&relay, &network, MeshConfig::default()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    a.drain_events();

    b.handle.leave().await.unwrap();
    let closed = b
        .wait_for(SETTLE, state_of("a", SessionState::Closed))
        .await;
    assert!(closed.is_some());
    assert!(b.media.is_stopped());
    assert!(relay.roster().iter().all(|m| m.uid != "b"));

    let left = a
        .wait_for(SETTLE, |event| {
            matches!(event, EmittedEvents::ParticipantLeft { peer } if peer == "b")
        })
        .await;
    assert!(left.is_some());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(relay.sent_by("b", "leave").len(), 1);

    // a second leave has nothing left to act on
    assert_eq!(b.handle.leave().await, Err(MeshError::Stopped));
    let late = a.drain_events();
    assert!(!late
        .iter()
        .any(|e| matches!(e, EmittedEvents::ParticipantLeft { .. })));
    assert_eq!(network.live_transports("a", "b"), 0);
    assert_eq!(network.live_transports("b", "a"), 0);

    let view = a.handle.snapshot().await.unwrap();
    assert!(view.sessions.is_empty());
    assert!(!view.presence.contains_key("b"));
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_counts_as_leaving() {
    let (relay, network) = room(RelayMode::Broadcast);
    let (mut a, b) = connect_pair(&relay, &network, MeshConfig::default()).await;
    relay.detach(&b.id);

    let left = a
        .wait_for(SETTLE, |event| {
            matches!(event, EmittedEvents::ParticipantLeft { peer } if peer == "b")
        })
        .await;
    assert!(left.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(network.live_transports("a", "b"), 0);
}

#[tokio::test(start_paused = true)]
async fn foreign_envelopes_pass_through() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let a_id = "a".to_string();

    relay
        .inject(
            &a_id,
            json!({"type": "whiteboard-stroke", "from": "z", "_target": "y", "points": [1, 2]}),
        )
        .unwrap();
    relay
        .inject(
            &a_id,
            json!({"type": "whiteboard-stroke", "from": "z", "points": [3, 4]}),
        )
        .unwrap();

    let passed = a
        .wait_for(SETTLE, |event| matches!(event, EmittedEvents::Passthrough(_)))
        .await;
    match passed {
        Some(EmittedEvents::Passthrough(envelope)) => match envelope.signal {
            Signal::Other { kind, fields } => {
                assert_eq!(kind, "whiteboard-stroke");
                assert_eq!(fields["points"], json!([3, 4]));
            }
            _ => panic!("expected a pass-through signal"),
        },
        _ => panic!("nothing passed through"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!a
        .drain_events()
        .iter()
        .any(|e| matches!(e, EmittedEvents::Passthrough(_))));
}

#[tokio::test(start_paused = true)]
async fn invalid_frames_are_rejected_at_the_handle() {
    let (relay, network) = room(RelayMode::Broadcast);
    let a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    assert!(matches!(
        a.handle.deliver_json(r#"{"type": "offer", "from": "z"}"#),
        Err(MeshError::InvalidEnvelope(_))
    ));
    assert!(a.handle.deliver_json("not json").is_err());
    assert!(a.handle.snapshot().await.unwrap().joined);
}
