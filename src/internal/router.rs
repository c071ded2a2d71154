use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::internal::data_types::SessionState;
use crate::internal::events::{EmittedEvents, RoomEvent, TimerEvent};
use crate::internal::registry::Slot;
use crate::internal::room::Room;
use crate::internal::timers::Timer;
use crate::signaling::{Envelope, Signal};
use crate::PeerId;

/// Decides whether an inbound envelope concerns us at all.
///
/// `_target` is checked first (relays that broadcast and let receivers filter),
/// then `to` (relays that address precisely). join and leave ignore `to`.
pub(crate) struct RouteFilter {
    local: PeerId,
    duplicates: DuplicateFilter,
}

impl RouteFilter {
    pub fn new(local: PeerId, window: Duration) -> Self {
        Self {
            local,
            duplicates: DuplicateFilter::new(window),
        }
    }

    pub fn admit(&mut self, envelope: &Envelope, now: Instant) -> Result<(), &'static str> {
        self.duplicates.prune(now);
        if let Some(target) = &envelope.target {
            if *target != self.local {
                return Err("targeted at someone else");
            }
        }
        if let Some(to) = &envelope.to {
            if *to != self.local && !envelope.signal.is_broadcast_only() {
                return Err("addressed to someone else");
            }
        }
        if envelope.signal.is_negotiation() && self.duplicates.is_repeat(envelope, now) {
            return Err("duplicate");
        }
        Ok(())
    }
}

/// Remembers offer/answer/candidate fingerprints for a short window.
pub(crate) struct DuplicateFilter {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl DuplicateFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
    }

    /// records the envelope and reports whether it was seen inside the window
    pub fn is_repeat(&mut self, envelope: &Envelope, now: Instant) -> bool {
        let key = fingerprint(envelope);
        if self.seen.contains_key(&key) {
            return true;
        }
        self.seen.insert(key, now);
        false
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

fn fingerprint(envelope: &Envelope) -> String {
    let payload = match &envelope.signal {
        Signal::Offer(desc) | Signal::Answer(desc) => desc.sdp.clone(),
        Signal::IceCandidate(candidate) => serde_json::to_string(candidate).unwrap_or_default(),
        _ => String::new(),
    };
    format!(
        "{}|{}|{}|{}",
        envelope.signal.kind(),
        envelope.from.as_deref().unwrap_or_default(),
        envelope.to.as_deref().unwrap_or_default(),
        payload
    )
}

impl Room {
    /// Routes one inbound envelope. Never fails: anything unusable is logged and dropped.
    pub(crate) fn dispatch(&mut self, envelope: Envelope) {
        if let Err(reason) = self.filter.admit(&envelope, Instant::now()) {
            log::debug!(
                "dropping {} from {}: {}",
                envelope.signal.kind(),
                envelope.from.as_deref().unwrap_or("?"),
                reason
            );
            return;
        }

        if let Signal::Other { kind, .. } = &envelope.signal {
            log::debug!("passing {} through to the application", kind);
            self.outbox.emit(EmittedEvents::Passthrough(envelope));
            return;
        }

        let Some(from) = envelope.from.clone() else {
            log::debug!("dropping {} without a sender", envelope.signal.kind());
            return;
        };
        if from == self.local {
            log::debug!("ignoring our own {}", envelope.signal.kind());
            return;
        }
        // answers and candidates are only meaningful inside an existing slot
        let observed = match &envelope.signal {
            Signal::Leave => false,
            Signal::Answer(_) | Signal::IceCandidate(_) => self.registry.contains(&from),
            _ => true,
        };
        if observed && self.presence.observe(&from) {
            self.presence_changed(&from);
        }

        match envelope.signal {
            Signal::Join { name } => self.on_join(&from, name),
            Signal::Offer(offer) => self.handle_offer(&from, offer),
            Signal::Answer(answer) => self.handle_answer(&from, answer),
            Signal::IceCandidate(candidate) => self.handle_ice_candidate(&from, candidate),
            Signal::Leave => self.on_leave(&from),
            Signal::CameraEnabled => self.on_camera(&from, true),
            Signal::CameraDisabled => self.on_camera(&from, false),
            Signal::AudioEnabled => self.on_audio(&from, true),
            Signal::AudioDisabled => self.on_audio(&from, false),
            Signal::MicActive => self.on_remote_mic(&from, true),
            Signal::MicInactive => self.on_remote_mic(&from, false),
            Signal::RequestCameraStates => {
                self.outbox
                    .send_to(&from, Signal::camera(self.local_presence.camera_enabled));
            }
            Signal::RequestAudioStates => {
                self.outbox
                    .send_to(&from, Signal::audio(self.local_presence.audio_enabled));
            }
            // forwarded above
            Signal::Other { .. } => {}
        }
    }

    fn on_join(&mut self, from: &PeerId, name: Option<String>) {
        if let Some(name) = name {
            if self.presence.set_name(from, name) {
                self.presence_changed(from);
            }
        }
        if !self.joined {
            log::debug!("{} joined before we did", from);
            return;
        }

        self.presence_replies.insert(
            from.clone(),
            Timer::schedule(
                self.config.presence_reply_delay(),
                &self.timer_tx,
                RoomEvent::Timer(TimerEvent::PresenceReply { peer: from.clone() }),
            ),
        );

        if self.registry.contains(from) {
            log::debug!("{} joined, negotiation already under way", from);
            return;
        }
        self.reserve_initiation(from, self.config.join_delay());
    }

    fn on_leave(&mut self, from: &PeerId) {
        let had_slot = match self.registry.remove(from, "participant left") {
            Some(Slot::Active(_)) => {
                self.outbox.session_state(from, SessionState::Closed);
                true
            }
            Some(Slot::Reserved(_)) => true,
            None => false,
        };
        self.presence_replies.remove(from);
        self.remote_mic.remove(from);
        let had_presence = self.presence.remove(from).is_some();
        if had_slot || had_presence {
            log::info!("{} left", from);
            self.outbox
                .emit(EmittedEvents::ParticipantLeft { peer: from.clone() });
        }
    }

    fn on_camera(&mut self, from: &PeerId, enabled: bool) {
        if self.presence.set_camera(from, enabled) {
            self.presence_changed(from);
        }
    }

    fn on_audio(&mut self, from: &PeerId, enabled: bool) {
        if !enabled {
            self.remote_mic.remove(from);
        }
        if self.presence.set_audio(from, enabled) {
            self.presence_changed(from);
        }
    }

    fn on_remote_mic(&mut self, from: &PeerId, active: bool) {
        if active {
            self.remote_epoch += 1;
            let epoch = self.remote_epoch;
            self.remote_mic.insert(
                from.clone(),
                (
                    epoch,
                    Timer::schedule(
                        self.config.remote_mic_timeout(),
                        &self.timer_tx,
                        RoomEvent::Timer(TimerEvent::RemoteMicDecay {
                            peer: from.clone(),
                            epoch,
                        }),
                    ),
                ),
            );
        } else {
            self.remote_mic.remove(from);
        }
        if self.presence.set_mic_active(from, active) {
            self.presence_changed(from);
        }
    }
}
