mod common;

use common::*;
use room_mesh::membership::Membership;
use room_mesh::testing::{LoopbackRelay, Participant, RelayMode, ScriptedNetwork};
use room_mesh::{EmittedEvents, GlarePolicy, MeshConfig, MeshError, Role, SessionState};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn second_joiner_is_offered_to_and_both_connect() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let alone = a.handle.snapshot().await.unwrap();
    assert!(alone.sessions.is_empty());
    assert!(alone.reservations.is_empty());

    let mut b = joined(&relay, &network, "b", MeshConfig::default(), av()).await;

    assert_eq!(
        states_until(&mut a, "b", SessionState::Connected).await,
        vec![
            SessionState::Offering,
            SessionState::OfferSent,
            SessionState::Connected
        ]
    );
    assert_eq!(
        states_until(&mut b, "a", SessionState::Connected).await,
        vec![
            SessionState::Answering,
            SessionState::AnswerSent,
            SessionState::Connected
        ]
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let a_view = a.handle.snapshot().await.unwrap();
    let b_view = b.handle.snapshot().await.unwrap();
    assert_eq!(a_view.sessions.len(), 1);
    assert_eq!(a_view.session("b").unwrap().role, Some(Role::Offerer));
    assert_eq!(b_view.session("a").unwrap().role, Some(Role::Answerer));
    assert!(b_view.reservations.is_empty());

    assert_eq!(relay.sent_by("a", "offer").len(), 1);
    assert_eq!(relay.sent_by("b", "offer").len(), 0);
    assert_eq!(network.live_transports("a", "b"), 1);
    assert_eq!(network.live_transports("b", "a"), 1);

    // each side applied the other's candidate after the description it belongs to
    let applied = network.applied_candidates("b", "a");
    assert_eq!(applied.len(), 1);
    assert!(applied[0].starts_with("candidate:a-"));
    let applied = network.applied_candidates("a", "b");
    assert_eq!(applied.len(), 1);
    assert!(applied[0].starts_with("candidate:b-"));
}

#[tokio::test(start_paused = true)]
async fn three_participants_form_a_full_mesh() {
    let (relay, network) = room(RelayMode::Unicast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let mut b = joined(&relay, &network, "b", MeshConfig::default(), av()).await;
    states_until(&mut a, "b", SessionState::Connected).await;
    let mut c = joined(&relay, &network, "c", MeshConfig::default(), av()).await;

    states_until(&mut a, "c", SessionState::Connected).await;
    states_until(&mut b, "c", SessionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    for (participant, others) in [(&a, ["b", "c"]), (&b, ["a", "c"]), (&c, ["a", "b"])] {
        let view = participant.handle.snapshot().await.unwrap();
        assert_eq!(view.sessions.len(), 2, "{} sessions", participant.id);
        for other in others {
            assert_eq!(view.session(other).unwrap().state, SessionState::Connected);
            assert_eq!(network.live_transports(&participant.id, other), 1);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn simultaneous_offers_settle_on_one_session() {
    let (relay, network) = room(RelayMode::Broadcast);
    // no stagger: both sides fire their offers at the same instant
    let config = MeshConfig {
        join_stagger_ms: 0,
        ..Default::default()
    };
    let (a, b) = connect_pair(&relay, &network, config).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let a_view = a.handle.snapshot().await.unwrap();
    let b_view = b.handle.snapshot().await.unwrap();
    let a_session = a_view.session("b").unwrap();
    let b_session = b_view.session("a").unwrap();
    assert_eq!(a_session.state, SessionState::Connected);
    assert_eq!(b_session.state, SessionState::Connected);
    assert_ne!(a_session.role, b_session.role);
    assert_eq!(network.live_transports("a", "b"), 1);
    assert_eq!(network.live_transports("b", "a"), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_incoming_recovers_from_mutual_yielding() {
    let (relay, network) = room(RelayMode::Broadcast);
    let config = MeshConfig {
        join_stagger_ms: 0,
        glare_policy: GlarePolicy::AcceptIncoming,
        ..Default::default()
    };
    let mut a = joined(&relay, &network, "a", config.clone(), av()).await;
    let mut b = joined(&relay, &network, "b", config, av()).await;

    // a round where both sides yielded ends when ANSWER_SENT expires
    states_until(&mut a, "b", SessionState::Connected).await;
    states_until(&mut b, "a", SessionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let a_view = a.handle.snapshot().await.unwrap();
    let b_view = b.handle.snapshot().await.unwrap();
    let a_session = a_view.session("b").unwrap();
    let b_session = b_view.session("a").unwrap();
    assert_eq!(a_session.state, SessionState::Connected);
    assert_eq!(b_session.state, SessionState::Connected);
    assert_ne!(a_session.role, b_session.role);
    assert_eq!(network.live_transports("a", "b"), 1);
    assert_eq!(network.live_transports("b", "a"), 1);
}

#[tokio::test(start_paused = true)]
async fn member_list_offers_follow_the_join_schedule() {
    let (relay, network) = room(RelayMode::Broadcast);
    for id in ["y", "z"] {
        relay.announce_self(&id.to_string(), id, "ROOM").await.unwrap();
    }
    let start = tokio::time::Instant::now();
    let _a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let offers_to = |peer: &str| {
        relay
            .sent_by("a", "offer")
            .iter()
            .filter(|r| r.to() == Some(peer))
            .count()
    };

    // present members get their own chance to offer first
    tokio::time::sleep_until(start + Duration::from_millis(590)).await;
    assert_eq!(relay.sent_by("a", "offer").len(), 0);
    tokio::time::sleep_until(start + Duration::from_millis(610)).await;
    assert_eq!((offers_to("y"), offers_to("z")), (1, 0));
    tokio::time::sleep_until(start + Duration::from_millis(690)).await;
    assert_eq!(offers_to("z"), 0);
    tokio::time::sleep_until(start + Duration::from_millis(710)).await;
    assert_eq!((offers_to("y"), offers_to("z")), (1, 1));
}

fn offer_from(from: &str, to: &str, id: u32) -> serde_json::Value {
    json!({
        "type": "offer",
        "from": from,
        "to": to,
        "_target": to,
        "offer": {"type": "offer", "sdp": format!("scripted:{from}:{id}")}
    })
}

fn candidate_from(from: &str, to: &str, candidate: &str) -> serde_json::Value {
    json!({
        "type": "ice-candidate",
        "from": from,
        "to": to,
        "candidate": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0}
    })
}

/// `a` is offering to a silent remote when that remote's own offer arrives
async fn offering_to(
    remote: &str,
    glare_policy: GlarePolicy,
) -> (LoopbackRelay, ScriptedNetwork, Participant) {
    let (relay, network) = room(RelayMode::Broadcast);
    let config = MeshConfig {
        glare_policy,
        ..Default::default()
    };
    let mut a = joined(&relay, &network, "a", config, av()).await;
    let a_id = "a".to_string();
    relay
        .inject(&a_id, json!({"type": "user-joined", "uid": remote}))
        .unwrap();
    a.wait_for(SETTLE, state_of(remote, SessionState::OfferSent))
        .await
        .unwrap();
    relay.inject(&a_id, offer_from(remote, "a", 900)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    (relay, network, a)
}

#[tokio::test(start_paused = true)]
async fn smaller_id_abandons_its_offer() {
    let (relay, network, a) = offering_to("z", GlarePolicy::SmallerIdAnswers).await;
    let view = a.handle.snapshot().await.unwrap();
    let session = view.session("z").unwrap();
    assert_eq!(session.role, Some(Role::Answerer));
    assert_eq!(session.state, SessionState::AnswerSent);
    let answers = relay.sent_by("a", "answer");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].to(), Some("z"));
    assert_eq!(network.created_transports("a", "z"), 2);
    assert_eq!(network.live_transports("a", "z"), 1);
}

#[tokio::test(start_paused = true)]
async fn larger_id_keeps_its_offer() {
    let (relay, network, a) = offering_to("0", GlarePolicy::SmallerIdAnswers).await;
    let view = a.handle.snapshot().await.unwrap();
    let session = view.session("0").unwrap();
    assert_eq!(session.role, Some(Role::Offerer));
    assert_eq!(session.state, SessionState::OfferSent);
    assert!(relay.sent_by("a", "answer").is_empty());
    assert_eq!(network.live_transports("a", "0"), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_incoming_always_yields() {
    let (relay, _network, a) = offering_to("0", GlarePolicy::AcceptIncoming).await;
    let view = a.handle.snapshot().await.unwrap();
    assert_eq!(view.session("0").unwrap().role, Some(Role::Answerer));
    assert_eq!(relay.sent_by("a", "answer").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn candidates_before_the_description_are_applied_in_order() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let a_id = "a".to_string();

    relay
        .inject(&a_id, json!({"type": "user-joined", "uid": "z"}))
        .unwrap();
    relay.inject(&a_id, offer_from("z", "a", 900)).unwrap();
    for candidate in ["c1", "bad-c2", "c1", "c3"] {
        relay
            .inject(&a_id, candidate_from("z", "a", candidate))
            .unwrap();
    }

    a.wait_for(SETTLE, state_of("z", SessionState::AnswerSent))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the malformed one is skipped, the repeat is suppressed
    assert_eq!(network.applied_candidates("a", "z"), vec!["c1", "c3"]);
    let view = a.handle.snapshot().await.unwrap();
    assert_eq!(view.session("z").unwrap().queued_candidates, 0);
    // the reservation made for z's join was consumed by its offer
    assert!(view.reservations.is_empty());
    assert!(relay.sent_by("a", "offer").is_empty());

    // our own candidate went out after our answer
    let sent: Vec<_> = relay
        .sent()
        .into_iter()
        .filter(|r| r.sender == "a" && (r.kind() == "answer" || r.kind() == "ice-candidate"))
        .map(|r| r.kind().to_owned())
        .collect();
    assert_eq!(sent, vec!["answer", "ice-candidate"]);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_retried_and_recovers() {
    let (relay, network) = room(RelayMode::Broadcast);
    let (mut a, mut b) = connect_pair(&relay, &network, MeshConfig::default()).await;

    assert_eq!(network.fail_link("a", "b"), 2);
    let states = states_until(&mut a, "b", SessionState::Connected).await;
    assert_eq!(
        &states[..3],
        &[
            SessionState::Failed,
            SessionState::Reconnecting,
            SessionState::Offering
        ]
    );
    states_until(&mut b, "a", SessionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let view = a.handle.snapshot().await.unwrap();
    let session = view.session("b").unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.retries, 0);
    assert_eq!(network.live_transports("a", "b"), 1);
    assert_eq!(network.live_transports("b", "a"), 1);
}

#[tokio::test(start_paused = true)]
async fn a_link_that_recovers_inside_the_grace_window_is_kept() {
    let (relay, network) = room(RelayMode::Broadcast);
    let (mut a, _b) = connect_pair(&relay, &network, MeshConfig::default()).await;
    let generation = a.handle.snapshot().await.unwrap().session("b").unwrap().generation;

    network.set_link_state("a", "b", room_mesh::ConnectivityState::Disconnected);
    tokio::time::sleep(Duration::from_millis(500)).await;
    network.set_link_state("a", "b", room_mesh::ConnectivityState::Connected);

    assert!(a
        .wait_for(Duration::from_secs(5), state_of("b", SessionState::Failed))
        .await
        .is_none());
    let session = a.handle.snapshot().await.unwrap();
    let session = session.session("b").unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.generation, generation);
}

#[tokio::test(start_paused = true)]
async fn unanswered_offers_end_in_peer_unreachable() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    relay
        .inject(&"a".to_string(), json!({"type": "user-joined", "uid": "z"}))
        .unwrap();

    let unreachable = a
        .wait_for(Duration::from_secs(60), |event| {
            matches!(event, EmittedEvents::PeerUnreachable { peer } if peer == "z")
        })
        .await;
    assert!(unreachable.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // one initial offer plus three re-initiations
    assert_eq!(relay.sent_by("a", "offer").len(), 4);
    assert_eq!(network.created_transports("a", "z"), 4);
    assert_eq!(network.live_transports("a", "z"), 0);

    let view = a.handle.snapshot().await.unwrap();
    assert!(view.session("z").is_none());
    // the participant is still in the room, only unreachable
    assert!(view.presence.contains_key("z"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_exhausts_the_retry_budget() {
    let (relay, network) = room(RelayMode::Broadcast);
    network.set_unreachable("b", true);
    let config = MeshConfig {
        max_reinitiations: 1,
        ..Default::default()
    };
    let mut a = joined(&relay, &network, "a", config.clone(), av()).await;
    let _b = joined(&relay, &network, "b", config, av()).await;

    let unreachable = a
        .wait_for(Duration::from_secs(60), |event| {
            matches!(event, EmittedEvents::PeerUnreachable { peer } if peer == "b")
        })
        .await;
    assert!(unreachable.is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(network.live_transports("a", "b"), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_creation_failure_takes_the_retry_path() {
    let (relay, network) = room(RelayMode::Broadcast);
    network.fail_creations("a", 1);
    let mut a = joined(&relay, &network, "a", MeshConfig::default(), av()).await;
    let _b = joined(&relay, &network, "b", MeshConfig::default(), av()).await;

    let states = states_until(&mut a, "b", SessionState::Connected).await;
    assert_eq!(
        &states[..4],
        &[
            SessionState::Offering,
            SessionState::Failed,
            SessionState::Reconnecting,
            SessionState::Offering
        ]
    );
    assert_eq!(network.created_transports("a", "b"), 1);
}

#[tokio::test(start_paused = true)]
async fn denied_media_is_fatal_to_the_join() {
    let (relay, network) = room(RelayMode::Broadcast);
    let mut a = relay.spawn_participant(
        "a",
        MeshConfig::default(),
        std::sync::Arc::new(room_mesh::testing::StaticMedia::denied()),
        &network,
    );
    let result = a.handle.join().await;
    assert!(matches!(result, Err(MeshError::MediaDenied(_))));
    let fatal = a
        .wait_for(SETTLE, |event| matches!(event, EmittedEvents::Fatal(_)))
        .await;
    assert!(matches!(
        fatal,
        Some(EmittedEvents::Fatal(MeshError::MediaDenied(_)))
    ));
    assert!(relay.roster().is_empty());
    assert!(!a.handle.snapshot().await.unwrap().joined);
}
