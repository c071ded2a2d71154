use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::MeshConfig;
use crate::internal::data_types::{MediaKind, Role, SessionState};
use crate::internal::events::{Command, EmittedEvents, RoomEvent, TimerEvent};
use crate::internal::presence::{LocalPresence, PresenceRecord, PresenceState};
use crate::internal::registry::SessionRegistry;
use crate::internal::router::RouteFilter;
use crate::internal::speech::{SpeechDetector, SpeechTransition};
use crate::internal::timers::Timer;
use crate::internal::transport::{TransportFactory, TransportSpawner};
use crate::media::MediaProvider;
use crate::membership::Membership;
use crate::signaling::{Envelope, Signal};
use crate::{MeshError, PeerId};

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub remote: PeerId,
    pub state: SessionState,
    pub role: Option<Role>,
    pub generation: u64,
    pub retries: u32,
    pub queued_candidates: usize,
    pub age: Duration,
}

/// A consistent picture of the room taken between two dispatches.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub local: PeerId,
    pub room: String,
    pub joined: bool,
    pub channel_open: bool,
    pub camera_enabled: bool,
    pub audio_enabled: bool,
    pub mic_active: bool,
    pub sessions: Vec<SessionSnapshot>,
    pub reservations: Vec<PeerId>,
    pub presence: HashMap<PeerId, PresenceRecord>,
}

impl RoomSnapshot {
    pub fn session(&self, peer: &str) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.remote == peer)
    }
}

/// Outbound sinks: the shared signaling channel and the application's event channel.
pub(crate) struct Outbox {
    local: PeerId,
    room: String,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    event_tx: mpsc::UnboundedSender<EmittedEvents>,
}

impl Outbox {
    pub fn broadcast(&self, signal: Signal) {
        self.send(Envelope::broadcast(self.local.clone(), signal).in_room(self.room.clone()));
    }

    pub fn send_to(&self, peer: &PeerId, signal: Signal) {
        self.send(
            Envelope::directed(self.local.clone(), peer.clone(), signal).in_room(self.room.clone()),
        );
    }

    fn send(&self, envelope: Envelope) {
        log::debug!(
            "sending {} to {}",
            envelope.signal.kind(),
            envelope.to.as_deref().unwrap_or("room")
        );
        if self.signal_tx.send(envelope).is_err() {
            log::warn!("signaling channel is gone, envelope dropped");
        }
    }

    pub fn emit(&self, event: EmittedEvents) {
        if self.event_tx.send(event).is_err() {
            log::debug!("application stopped listening for events");
        }
    }

    pub fn session_state(&self, peer: &PeerId, state: SessionState) {
        self.emit(EmittedEvents::SessionState {
            peer: peer.clone(),
            state,
        });
    }
}

pub(crate) struct RoomParts {
    pub local: PeerId,
    pub name: String,
    pub room: String,
    pub config: MeshConfig,
    pub media: Arc<dyn MediaProvider>,
    pub membership: Arc<dyn Membership>,
    pub transports: Arc<dyn TransportFactory>,
    pub signal_tx: mpsc::UnboundedSender<Envelope>,
    pub event_tx: mpsc::UnboundedSender<EmittedEvents>,
    pub timer_tx: mpsc::UnboundedSender<RoomEvent>,
}

/// Everything one room actor owns. Only the dispatch loop touches it.
pub(crate) struct Room {
    pub(super) local: PeerId,
    pub(super) name: String,
    pub(super) room: String,
    pub(super) config: MeshConfig,
    pub(super) registry: SessionRegistry,
    pub(super) presence: PresenceState,
    pub(super) local_presence: LocalPresence,
    pub(super) speech: SpeechDetector,
    pub(super) filter: RouteFilter,
    pub(super) spawner: TransportSpawner,
    pub(super) media: Arc<dyn MediaProvider>,
    pub(super) membership: Arc<dyn Membership>,
    pub(super) outbox: Outbox,
    pub(super) timer_tx: mpsc::UnboundedSender<RoomEvent>,
    pub(super) joined: bool,
    pub(super) channel_open: bool,
    pub(super) presence_replies: HashMap<PeerId, Timer>,
    pub(super) remote_mic: HashMap<PeerId, (u64, Timer)>,
    request_states: Option<Timer>,
    mic_release: Option<Timer>,
    mic_epoch: u64,
    pub(super) remote_epoch: u64,
}

impl Room {
    pub fn new(parts: RoomParts) -> Self {
        let RoomParts {
            local,
            name,
            room,
            config,
            media,
            membership,
            transports,
            signal_tx,
            event_tx,
            timer_tx,
        } = parts;
        Self {
            filter: RouteFilter::new(local.clone(), config.duplicate_window()),
            speech: SpeechDetector::new(config.min_speech()),
            spawner: TransportSpawner {
                factory: transports,
                tracks: Vec::new(),
                room_tx: timer_tx.clone(),
            },
            outbox: Outbox {
                local: local.clone(),
                room: room.clone(),
                signal_tx,
                event_tx,
            },
            local,
            name,
            room,
            config,
            registry: SessionRegistry::default(),
            presence: PresenceState::default(),
            local_presence: LocalPresence::default(),
            media,
            membership,
            timer_tx,
            joined: false,
            channel_open: false,
            presence_replies: HashMap::new(),
            remote_mic: HashMap::new(),
            request_states: None,
            mic_release: None,
            mic_epoch: 0,
            remote_epoch: 0,
        }
    }

    /// returns false once the actor should stop
    pub async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Deliver(envelope) => self.dispatch(envelope),
            Command::ChannelOpened => self.channel_opened(),
            Command::Join(reply) => {
                let result = self.join().await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(());
                return false;
            }
            Command::SetCamera(enabled) => self.set_camera(enabled).await,
            Command::SetAudio(enabled) => self.set_audio(enabled).await,
            Command::AudioLevel(level) => self.audio_level(level),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
        true
    }

    pub fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Transport {
                peer,
                generation,
                event,
            } => self.on_transport_event(&peer, generation, event),
            RoomEvent::Step {
                peer,
                generation,
                step,
            } => self.on_step(&peer, generation, step),
            RoomEvent::Timer(timer) => self.on_timer(timer),
        }
    }

    fn on_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Initiate { peer } => {
                if self.registry.is_reserved(&peer) {
                    self.initiate(&peer);
                } else {
                    log::debug!("initiation for {} no longer reserved", &peer);
                }
            }
            TimerEvent::Grace { peer, generation } => self.on_grace_expired(&peer, generation),
            TimerEvent::NegotiationExpired { peer, generation } => {
                self.on_negotiation_expired(&peer, generation)
            }
            TimerEvent::PresenceReply { peer } => {
                self.presence_replies.remove(&peer);
                if self.presence.contains(&peer) {
                    self.outbox
                        .send_to(&peer, Signal::camera(self.local_presence.camera_enabled));
                    self.outbox
                        .send_to(&peer, Signal::audio(self.local_presence.audio_enabled));
                }
            }
            TimerEvent::RequestStates => {
                self.request_states = None;
                self.outbox.broadcast(Signal::RequestCameraStates);
                self.outbox.broadcast(Signal::RequestAudioStates);
            }
            TimerEvent::MicRelease { epoch } => {
                if epoch == self.mic_epoch && self.speech.is_speaking() {
                    self.mic_release = None;
                    self.speech.release();
                    self.set_local_mic(false);
                }
            }
            TimerEvent::RemoteMicDecay { peer, epoch } => {
                if matches!(self.remote_mic.get(&peer), Some((e, _)) if *e == epoch) {
                    self.remote_mic.remove(&peer);
                    log::debug!("{} went quiet without saying so", &peer);
                    if self.presence.set_mic_active(&peer, false) {
                        self.presence_changed(&peer);
                    }
                }
            }
        }
    }

    /// Acquires local media, registers with the membership service and schedules
    /// offers to everyone already in the room.
    pub async fn join(&mut self) -> Result<(), MeshError> {
        if self.joined {
            log::debug!("already joined {}", &self.room);
            return Ok(());
        }

        let tracks = match self.media.acquire().await {
            Ok(tracks) => tracks,
            Err(e) => {
                log::error!("cannot join {}: {}", &self.room, e);
                self.outbox.emit(EmittedEvents::Fatal(e.clone()));
                return Err(e);
            }
        };
        if tracks.is_empty() {
            log::info!("joining {} without local media", &self.room);
        }
        self.local_presence.camera_enabled = tracks.iter().any(|t| t.kind == MediaKind::Video);
        self.local_presence.audio_enabled = false;
        if tracks.iter().any(|t| t.kind == MediaKind::Audio) {
            if let Err(e) = self.media.enable(MediaKind::Audio, false).await {
                log::warn!("failed to mute microphone: {}", e);
            }
        }
        self.spawner.tracks = tracks;

        if let Err(e) = self
            .membership
            .announce_self(&self.local, &self.name, &self.room)
            .await
        {
            log::warn!("failed to register with {}: {:#}", &self.room, e);
        }
        let members = match self.membership.list_members(&self.room).await {
            Ok(members) => members,
            Err(e) => {
                log::warn!("failed to list members of {}: {:#}", &self.room, e);
                Vec::new()
            }
        };
        self.joined = true;
        log::info!("joined {} as {}", &self.room, &self.local);

        // members already present offer to us as soon as they see our join,
        // so our own offers start one stagger step later
        let mut delay = self.config.join_delay() + self.config.join_stagger();
        for member in members {
            if member.uid == self.local {
                continue;
            }
            let mut changed = self.presence.observe(&member.uid);
            if !member.name.is_empty() {
                changed |= self.presence.set_name(&member.uid, member.name.clone());
            }
            if changed {
                self.presence_changed(&member.uid);
            }
            if self.reserve_initiation(&member.uid, delay) {
                delay += self.config.join_stagger();
            }
        }

        if self.channel_open {
            self.announce_presence();
        }
        Ok(())
    }

    pub fn channel_opened(&mut self) {
        self.channel_open = true;
        if self.joined {
            self.announce_presence();
        } else {
            log::debug!("signaling channel open, waiting for join");
        }
    }

    /// join, our camera and audio state, then a delayed request for everyone else's
    fn announce_presence(&mut self) {
        self.outbox.broadcast(Signal::Join {
            name: Some(self.name.clone()),
        });
        self.outbox
            .broadcast(Signal::camera(self.local_presence.camera_enabled));
        self.outbox
            .broadcast(Signal::audio(self.local_presence.audio_enabled));
        if self.local_presence.mic_active {
            self.outbox.broadcast(Signal::MicActive);
        }
        self.request_states = Some(Timer::schedule(
            self.config.camera_state_request_delay(),
            &self.timer_tx,
            RoomEvent::Timer(TimerEvent::RequestStates),
        ));
    }

    /// claims `peer` and schedules an offer after `delay`
    pub(super) fn reserve_initiation(&mut self, peer: &PeerId, delay: Duration) -> bool {
        let timer = Timer::schedule(
            delay,
            &self.timer_tx,
            RoomEvent::Timer(TimerEvent::Initiate { peer: peer.clone() }),
        );
        match self.registry.reserve(peer, timer) {
            Ok(()) => {
                log::debug!("offer to {} scheduled in {:?}", peer, delay);
                true
            }
            Err(e) => {
                log::debug!("not scheduling an offer: {}", e);
                false
            }
        }
    }

    pub async fn leave(&mut self) {
        log::info!("leaving {}", &self.room);
        for session in self.registry.drain("leaving room") {
            self.outbox
                .session_state(&session.remote, SessionState::Closed);
        }
        self.media.stop().await;
        if self.joined {
            if let Err(e) = self
                .membership
                .withdraw(&self.local, &self.name, &self.room)
                .await
            {
                log::warn!("failed to withdraw from {}: {:#}", &self.room, e);
            }
            self.outbox.broadcast(Signal::Leave);
        }
        self.clear_timers();
        self.presence.clear();
        self.joined = false;
    }

    /// every handle is gone. release transports without talking to anybody
    pub fn shutdown(&mut self) {
        self.registry.drain("controller dropped");
        self.clear_timers();
    }

    fn clear_timers(&mut self) {
        self.presence_replies.clear();
        self.remote_mic.clear();
        self.request_states = None;
        self.mic_release = None;
    }

    pub async fn set_camera(&mut self, enabled: bool) {
        if enabled
            && !self
                .media
                .tracks_of()
                .iter()
                .any(|t| t.kind == MediaKind::Video)
        {
            log::warn!("no camera to enable");
            return;
        }
        if let Err(e) = self.media.enable(MediaKind::Video, enabled).await {
            log::warn!("failed to toggle camera: {:#}", e);
            return;
        }
        self.local_presence.camera_enabled = enabled;
        if self.joined {
            self.outbox.broadcast(Signal::camera(enabled));
        }
    }

    pub async fn set_audio(&mut self, enabled: bool) {
        if let Err(e) = self.media.enable(MediaKind::Audio, enabled).await {
            log::warn!("failed to toggle microphone: {:#}", e);
            return;
        }
        self.local_presence.audio_enabled = enabled;
        if self.joined {
            self.outbox.broadcast(Signal::audio(enabled));
        }
        if !enabled {
            self.speech.reset();
            self.mic_release = None;
            self.set_local_mic(false);
        }
    }

    pub fn audio_level(&mut self, level: u8) {
        if !self.local_presence.audio_enabled {
            return;
        }
        match self.speech.push(level, Instant::now()) {
            Some(SpeechTransition::Started) => self.set_local_mic(true),
            Some(SpeechTransition::Paused) => {
                self.mic_epoch += 1;
                self.mic_release = Some(Timer::schedule(
                    self.config.mic_release_debounce(),
                    &self.timer_tx,
                    RoomEvent::Timer(TimerEvent::MicRelease {
                        epoch: self.mic_epoch,
                    }),
                ));
            }
            Some(SpeechTransition::Resumed) => self.mic_release = None,
            None => {}
        }
    }

    fn set_local_mic(&mut self, active: bool) {
        if self.local_presence.mic_active == active {
            return;
        }
        self.local_presence.mic_active = active;
        if self.joined {
            self.outbox.broadcast(Signal::mic(active));
        }
    }

    pub(super) fn presence_changed(&self, peer: &PeerId) {
        if let Some(record) = self.presence.get(peer) {
            self.outbox.emit(EmittedEvents::PresenceChanged {
                peer: peer.clone(),
                record: record.clone(),
            });
        }
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            local: self.local.clone(),
            room: self.room.clone(),
            joined: self.joined,
            channel_open: self.channel_open,
            camera_enabled: self.local_presence.camera_enabled,
            audio_enabled: self.local_presence.audio_enabled,
            mic_active: self.local_presence.mic_active,
            sessions: self.registry.snapshot(),
            reservations: self.registry.reservations(),
            presence: self.presence.snapshot(),
        }
    }
}
