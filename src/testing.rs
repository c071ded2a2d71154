// testing
// room-mesh needs a relay, a membership service and real peer connections to do anything.
// this module provides in-memory stand-ins for all three so that whole rooms can be driven
// from a test without touching the network.
//
// LoopbackRelay behaves like the production relay: join is rewritten to user-joined with a
// `uid`, directed messages get `_target`, presence messages are always broadcast and the
// sender never receives its own message.
//
// ScriptedNetwork hands out transports that "connect" when an answer is applied. tests can
// break links and make participants unreachable.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::internal::data_types::{ConnectivityState, MediaKind};
use crate::internal::events::TransportEvent;
use crate::media::{LocalTrack, MediaProvider, MimeType};
use crate::membership::{Member, Membership};
use crate::signaling::{Envelope, IceCandidate, SessionDescription};
use crate::{
    Controller, EmittedEvents, InitArgs, MediaTransport, MeshConfig, MeshError, PeerId,
    RoomHandle, TransportEventSink, TransportFactory,
};

// types the relay never addresses, whatever `to` says
const ALWAYS_BROADCAST: &[&str] = &[
    "join",
    "leave",
    "user-joined",
    "user-left",
    "mic-active",
    "mic-inactive",
    "camera-enabled",
    "camera-disabled",
    "request-camera-states",
];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// every message reaches everybody but the sender. receivers filter on `_target`
    Broadcast,
    /// directed messages only reach their target
    Unicast,
}

/// one message as the relay forwarded it
#[derive(Debug, Clone)]
pub struct Relayed {
    pub sender: PeerId,
    pub message: Value,
}

impl Relayed {
    pub fn kind(&self) -> &str {
        self.message["type"].as_str().unwrap_or_default()
    }

    pub fn to(&self) -> Option<&str> {
        self.message["to"].as_str()
    }
}

struct RelayState {
    mode: RelayMode,
    room: String,
    attached: HashMap<PeerId, RoomHandle>,
    left: HashSet<PeerId>,
    roster: Vec<Member>,
    sent: Vec<Relayed>,
}

#[derive(Clone)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new(room: &str, mode: RelayMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                mode,
                room: room.to_owned(),
                attached: HashMap::new(),
                left: HashSet::new(),
                roster: Vec::new(),
                sent: Vec::new(),
            })),
        }
    }

    pub fn room(&self) -> String {
        lock(&self.state).room.clone()
    }

    /// Connects a room to the relay. Everything the room sends on `outbound` is relayed;
    /// the room is told its channel is open right away.
    pub fn attach(
        &self,
        handle: RoomHandle,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let id = handle.local_id().clone();
        {
            let mut state = lock(&self.state);
            state.left.remove(&id);
            state.attached.insert(id.clone(), handle.clone());
        }
        let _ = handle.channel_opened();

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                relay.route(&id, envelope);
            }
            relay.detach(&id);
        })
    }

    /// drops the connection the way a closed websocket would
    pub fn detach(&self, id: &PeerId) {
        let announce = {
            let mut state = lock(&self.state);
            state.attached.remove(id).is_some() && !state.left.contains(id)
        };
        if announce {
            let room = self.room();
            self.relay_value(
                id,
                serde_json::json!({"type": "user-left", "uid": id, "room": room}),
                None,
            );
        }
    }

    fn route(&self, sender: &PeerId, envelope: Envelope) {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("relay: {}", e);
                return;
            }
        };
        let mut message: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                log::error!("relay: {}", e);
                return;
            }
        };
        let kind = message["type"].as_str().unwrap_or_default().to_owned();
        if kind == "join" {
            message["type"] = "user-joined".into();
            message["uid"] = sender.clone().into();
        }
        if kind == "leave" {
            lock(&self.state).left.insert(sender.clone());
        }
        let target = match message["to"].as_str() {
            Some(to) if !ALWAYS_BROADCAST.contains(&kind.as_str()) => Some(to.to_owned()),
            _ => None,
        };
        if let Some(target) = &target {
            message["_target"] = target.clone().into();
        }
        self.relay_value(sender, message, target);
    }

    fn relay_value(&self, sender: &PeerId, message: Value, target: Option<String>) {
        let receivers: Vec<(PeerId, RoomHandle)> = {
            let mut state = lock(&self.state);
            state.sent.push(Relayed {
                sender: sender.clone(),
                message: message.clone(),
            });
            let mode = state.mode;
            state
                .attached
                .iter()
                .filter(|(id, _)| *id != sender)
                .filter(|(id, _)| match (&target, mode) {
                    (Some(target), RelayMode::Unicast) => target == *id,
                    _ => true,
                })
                .map(|(id, handle)| (id.clone(), handle.clone()))
                .collect()
        };
        let text = message.to_string();
        for (id, handle) in receivers {
            if let Err(e) = handle.deliver_json(&text) {
                log::debug!("relay: {} is gone: {}", id, e);
            }
        }
    }

    /// delivers raw JSON to one attached participant, as if the relay sent it
    pub fn inject(&self, to: &PeerId, message: Value) -> Result<(), MeshError> {
        let handle = lock(&self.state).attached.get(to).cloned();
        match handle {
            Some(handle) => handle.deliver_json(&message.to_string()),
            None => Err(MeshError::Stopped),
        }
    }

    /// everything relayed so far, in order
    pub fn sent(&self) -> Vec<Relayed> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_by(&self, sender: &str, kind: &str) -> Vec<Relayed> {
        self.sent()
            .into_iter()
            .filter(|r| r.sender == sender && r.kind() == kind)
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    pub fn roster(&self) -> Vec<Member> {
        lock(&self.state).roster.clone()
    }

    /// Builds a room for `id` on top of this relay and the given network, and runs it.
    pub fn spawn_participant(
        &self,
        id: &str,
        config: MeshConfig,
        media: Arc<StaticMedia>,
        network: &ScriptedNetwork,
    ) -> Participant {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (controller, handle) = Controller::init(InitArgs {
            id: id.to_owned(),
            name: format!("{id}-name"),
            room: self.room(),
            config,
            media: media.clone(),
            membership: Arc::new(self.clone()),
            transports: Arc::new(network.factory_for(id)),
            signal_chan: signal_tx,
            emitted_event_chan: event_tx,
        });
        let task = controller.spawn();
        self.attach(handle.clone(), signal_rx);
        Participant {
            id: id.to_owned(),
            handle,
            events,
            media,
            task,
        }
    }
}

#[async_trait]
impl Membership for LoopbackRelay {
    async fn announce_self(&self, id: &PeerId, name: &str, _room: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.roster.retain(|m| m.uid != *id);
        state.roster.push(Member {
            uid: id.clone(),
            name: name.to_owned(),
        });
        Ok(())
    }

    async fn list_members(&self, room: &str) -> Result<Vec<Member>> {
        let state = lock(&self.state);
        if room != state.room {
            return Ok(Vec::new());
        }
        Ok(state.roster.clone())
    }

    async fn withdraw(&self, id: &PeerId, _name: &str, _room: &str) -> Result<()> {
        lock(&self.state).roster.retain(|m| m.uid != *id);
        Ok(())
    }
}

/// a room running on the loopback relay
pub struct Participant {
    pub id: PeerId,
    pub handle: RoomHandle,
    pub events: mpsc::UnboundedReceiver<EmittedEvents>,
    pub media: Arc<StaticMedia>,
    pub task: JoinHandle<()>,
}

impl Participant {
    /// waits (in tokio time) for the first event matching `pred`, skipping the others
    pub async fn wait_for<F>(&mut self, within: Duration, mut pred: F) -> Option<EmittedEvents>
    where
        F: FnMut(&EmittedEvents) -> bool,
    {
        let search = async {
            while let Some(event) = self.events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(within, search).await.ok().flatten()
    }

    /// everything emitted so far, without waiting
    pub fn drain_events(&mut self) -> Vec<EmittedEvents> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Hands out fixed tracks. `denied()` refuses capture altogether.
pub struct StaticMedia {
    tracks: Vec<LocalTrack>,
    denied: bool,
    enabled: Mutex<HashMap<MediaKind, bool>>,
    stopped: Mutex<bool>,
}

impl StaticMedia {
    pub fn new(kinds: &[MediaKind]) -> Self {
        Self {
            tracks: kinds
                .iter()
                .map(|kind| LocalTrack::new(*kind, MimeType::default_for(*kind), "testing"))
                .collect(),
            denied: false,
            enabled: Mutex::new(kinds.iter().map(|k| (*k, true)).collect()),
            stopped: Mutex::new(false),
        }
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::new(&[])
        }
    }

    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        lock(&self.enabled).get(&kind).copied().unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.stopped)
    }
}

#[async_trait]
impl MediaProvider for StaticMedia {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MeshError> {
        if self.denied {
            return Err(MeshError::MediaDenied("permission dismissed".into()));
        }
        Ok(self.tracks.clone())
    }

    async fn enable(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        if !self.tracks.iter().any(|t| t.kind == kind) {
            bail!("no {} track", kind);
        }
        lock(&self.enabled).insert(kind, enabled);
        Ok(())
    }

    fn tracks_of(&self) -> Vec<LocalTrack> {
        self.tracks.clone()
    }

    async fn stop(&self) {
        *lock(&self.stopped) = true;
    }
}

struct Endpoint {
    owner: PeerId,
    remote: PeerId,
    sink: TransportEventSink,
    remote_token: Option<String>,
    linked: Option<u64>,
    applied: Vec<String>,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    unreachable: HashSet<PeerId>,
    failing: HashMap<PeerId, usize>,
}

/// Deterministic transports. An offer or answer is the token `scripted:{owner}:{id}`;
/// applying an answer links both transports and reports connectivity to each side.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// transports created through this factory belong to `owner`
    pub fn factory_for(&self, owner: &str) -> ScriptedTransportFactory {
        ScriptedTransportFactory {
            owner: owner.to_owned(),
            network: self.clone(),
        }
    }

    /// every link involving `peer` fails, now and in the future
    pub fn set_unreachable(&self, peer: &str, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(peer.to_owned());
        } else {
            state.unreachable.remove(peer);
        }
    }

    /// the next `count` transports created for `owner` fail to come up
    pub fn fail_creations(&self, owner: &str, count: usize) {
        lock(&self.state).failing.insert(owner.to_owned(), count);
    }

    /// reports `state` on both ends of every live link between `a` and `b`
    pub fn set_link_state(&self, a: &str, b: &str, connectivity: ConnectivityState) -> usize {
        let state = lock(&self.state);
        let mut reported = 0;
        for endpoint in state.endpoints.values() {
            let between = (endpoint.owner == a && endpoint.remote == b)
                || (endpoint.owner == b && endpoint.remote == a);
            if between && endpoint.linked.is_some() && !endpoint.closed {
                endpoint.sink.emit(TransportEvent::Connectivity(connectivity));
                reported += 1;
            }
        }
        reported
    }

    pub fn fail_link(&self, a: &str, b: &str) -> usize {
        self.set_link_state(a, b, ConnectivityState::Failed)
    }

    /// transports `owner` holds towards `remote` that were not closed yet
    pub fn live_transports(&self, owner: &str, remote: &str) -> usize {
        lock(&self.state)
            .endpoints
            .values()
            .filter(|e| e.owner == owner && e.remote == remote && !e.closed)
            .count()
    }

    pub fn created_transports(&self, owner: &str, remote: &str) -> usize {
        lock(&self.state)
            .endpoints
            .values()
            .filter(|e| e.owner == owner && e.remote == remote)
            .count()
    }

    /// candidates the newest transport of `owner` towards `remote` accepted, in order
    pub fn applied_candidates(&self, owner: &str, remote: &str) -> Vec<String> {
        lock(&self.state)
            .endpoints
            .iter()
            .filter(|(_, e)| e.owner == owner && e.remote == remote)
            .max_by_key(|(id, _)| **id)
            .map(|(_, e)| e.applied.clone())
            .unwrap_or_default()
    }

    fn token_id(sdp: &str) -> Option<u64> {
        sdp.strip_prefix("scripted:")?
            .rsplit(':')
            .next()?
            .parse()
            .ok()
    }
}

pub struct ScriptedTransportFactory {
    owner: PeerId,
    network: ScriptedNetwork,
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>> {
        let mut state = lock(&self.network.state);
        if let Some(left) = state.failing.get_mut(&self.owner) {
            if *left > 0 {
                *left -= 1;
                bail!("scripted creation failure");
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        state.endpoints.insert(
            id,
            Endpoint {
                owner: self.owner.clone(),
                remote: remote.clone(),
                sink: events,
                remote_token: None,
                linked: None,
                applied: Vec::new(),
                closed: false,
            },
        );
        Ok(Box::new(ScriptedTransport {
            id,
            network: self.network.clone(),
        }))
    }
}

struct ScriptedTransport {
    id: u64,
    network: ScriptedNetwork,
}

impl ScriptedTransport {
    fn with<R>(&self, f: impl FnOnce(&mut NetworkState, u64) -> Result<R>) -> Result<R> {
        let mut state = lock(&self.network.state);
        match state.endpoints.get(&self.id) {
            Some(e) if !e.closed => {}
            _ => bail!("transport closed"),
        }
        f(&mut *state, self.id)
    }

    fn describe(&self, kind: &str) -> Result<SessionDescription> {
        self.with(|state, id| {
            let endpoint = state
                .endpoints
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
            let token = format!("scripted:{}:{}", endpoint.owner, id);
            // gathering starts with the local description
            endpoint.sink.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{}-{}",
                endpoint.owner, id
            ))));
            Ok(match kind {
                "offer" => SessionDescription::offer(token),
                _ => SessionDescription::answer(token),
            })
        })
    }
}

#[async_trait]
impl MediaTransport for ScriptedTransport {
    async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.describe("offer")
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.with(|state, id| match state.endpoints.get(&id) {
            Some(e) if e.remote_token.is_some() => Ok(()),
            _ => bail!("no remote offer"),
        })?;
        self.describe("answer")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.with(|state, id| {
            if !desc.sdp.starts_with("scripted:") {
                bail!("unparseable description");
            }
            let is_answer = desc.kind == crate::signaling::SdpKind::Answer;
            let peer_id = ScriptedNetwork::token_id(&desc.sdp);
            if let Some(endpoint) = state.endpoints.get_mut(&id) {
                endpoint.remote_token = Some(desc.sdp.clone());
            }
            if !is_answer {
                return Ok(());
            }
            // the answer closes the loop: link both ends and report connectivity
            let Some(peer_id) = peer_id else {
                return Ok(());
            };
            let (owner, remote) = match state.endpoints.get(&id) {
                Some(e) => (e.owner.clone(), e.remote.clone()),
                None => return Ok(()),
            };
            let reachable =
                !state.unreachable.contains(&owner) && !state.unreachable.contains(&remote);
            let connectivity = if reachable {
                ConnectivityState::Connected
            } else {
                ConnectivityState::Failed
            };
            for (this, other) in [(id, peer_id), (peer_id, id)] {
                if let Some(endpoint) = state.endpoints.get_mut(&this) {
                    if endpoint.closed {
                        continue;
                    }
                    endpoint.linked = Some(other);
                    endpoint.sink.emit(TransportEvent::Connectivity(connectivity));
                }
            }
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.with(|state, id| {
            let Some(endpoint) = state.endpoints.get_mut(&id) else {
                bail!("transport closed");
            };
            if endpoint.remote_token.is_none() {
                bail!("remote description not set");
            }
            if candidate.candidate.contains("bad") {
                bail!("malformed candidate");
            }
            endpoint.applied.push(candidate.candidate);
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        if let Some(endpoint) = lock(&self.network.state).endpoints.get_mut(&self.id) {
            endpoint.closed = true;
        }
        Ok(())
    }
}
