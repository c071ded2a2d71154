#![allow(dead_code)]

use room_mesh::testing::{LoopbackRelay, Participant, RelayMode, ScriptedNetwork, StaticMedia};
use room_mesh::{EmittedEvents, MediaKind, MeshConfig, SessionState};
use std::sync::Arc;
use std::time::Duration;

pub const SETTLE: Duration = Duration::from_secs(10);

pub fn room(mode: RelayMode) -> (LoopbackRelay, ScriptedNetwork) {
    let _ = env_logger::builder().is_test(true).try_init();
    (LoopbackRelay::new("ROOM", mode), ScriptedNetwork::new())
}

pub fn av() -> Arc<StaticMedia> {
    Arc::new(StaticMedia::new(&[MediaKind::Audio, MediaKind::Video]))
}

pub fn audio_only() -> Arc<StaticMedia> {
    Arc::new(StaticMedia::new(&[MediaKind::Audio]))
}

pub async fn joined(
    relay: &LoopbackRelay,
    network: &ScriptedNetwork,
    id: &str,
    config: MeshConfig,
    media: Arc<StaticMedia>,
) -> Participant {
    let participant = relay.spawn_participant(id, config, media, network);
    participant.handle.join().await.unwrap();
    participant
}

pub fn state_of(peer: &str, state: SessionState) -> impl FnMut(&EmittedEvents) -> bool {
    let peer = peer.to_owned();
    move |event| {
        matches!(event, EmittedEvents::SessionState { peer: p, state: s } if *p == peer && *s == state)
    }
}

/// session states reported for `peer` up to and including `last`
pub async fn states_until(
    participant: &mut Participant,
    peer: &str,
    last: SessionState,
) -> Vec<SessionState> {
    let mut seen = Vec::new();
    loop {
        let next = participant
            .wait_for(SETTLE, |event| {
                matches!(event, EmittedEvents::SessionState { peer: p, .. } if p == peer)
            })
            .await;
        match next {
            Some(EmittedEvents::SessionState { state, .. }) => {
                seen.push(state);
                if state == last {
                    return seen;
                }
            }
            _ => panic!("{} never reached {} for {}, saw {:?}", participant.id, last, peer, seen),
        }
    }
}

pub async fn connect_pair(
    relay: &LoopbackRelay,
    network: &ScriptedNetwork,
    config: MeshConfig,
) -> (Participant, Participant) {
    let mut a = joined(relay, network, "a", config.clone(), av()).await;
    let mut b = joined(relay, network, "b", config, av()).await;
    states_until(&mut a, "b", SessionState::Connected).await;
    states_until(&mut b, "a", SessionState::Connected).await;
    (a, b)
}
