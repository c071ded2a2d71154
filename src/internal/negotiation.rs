use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::GlarePolicy;
use crate::internal::data_types::{ConnectivityState, Role, SessionState};
use crate::internal::events::{EmittedEvents, NegotiationStep, RoomEvent, TimerEvent, TransportEvent};
use crate::internal::peer_session::PeerSession;
use crate::internal::registry::Slot;
use crate::internal::room::{Outbox, Room};
use crate::internal::timers::Timer;
use crate::internal::transport::TransportCommand;
use crate::signaling::{IceCandidate, SessionDescription, Signal};
use crate::{MeshError, PeerId};

fn advance(session: &mut PeerSession, next: SessionState, outbox: &Outbox) -> bool {
    if !session.transition(next) {
        return false;
    }
    outbox.session_state(&session.remote, next);
    true
}

/// OFFER_SENT and ANSWER_SENT must make progress within `timeout`
fn arm_expiry(
    session: &mut PeerSession,
    timeout: Duration,
    timer_tx: &mpsc::UnboundedSender<RoomEvent>,
) {
    session.expiry = Some(Timer::schedule(
        timeout,
        timer_tx,
        RoomEvent::Timer(TimerEvent::NegotiationExpired {
            peer: session.remote.clone(),
            generation: session.generation,
        }),
    ));
}

fn start_offer(session: &mut PeerSession, outbox: &Outbox) {
    session.role = Some(Role::Offerer);
    if advance(session, SessionState::Offering, outbox) {
        session.send(TransportCommand::CreateOffer);
    }
}

impl Room {
    /// Offers to `peer` unless something already negotiates with it.
    pub(super) fn initiate(&mut self, peer: &PeerId) {
        if !self.joined {
            log::debug!("not initiating with {}: not in the room", peer);
            return;
        }
        let spawner = &self.spawner;
        let session = match self.registry.ensure_session(peer, |generation| {
            PeerSession::new(peer.clone(), generation, spawner.spawn(peer, generation))
        }) {
            Ok(session) => session,
            Err(e) => {
                log::debug!("not initiating: {}", e);
                return;
            }
        };
        start_offer(session, &self.outbox);
    }

    pub(super) fn handle_offer(&mut self, from: &PeerId, offer: SessionDescription) {
        match self.registry.session(from).map(|s| s.state) {
            Some(state) if state.is_offering() => {
                log::debug!("{}", MeshError::GlareConflict(from.clone()));
                let retries = self.registry.session(from).map_or(0, |s| s.retries);
                // retried sessions fall back to id order
                let yields = match self.config.glare_policy {
                    GlarePolicy::AcceptIncoming if retries == 0 => true,
                    _ => self.local < *from,
                };
                if !yields {
                    log::info!("keeping our offer to {}, it answers", from);
                    return;
                }
                log::info!("abandoning our offer to {} and answering", from);
                self.restart_session(from);
            }
            Some(SessionState::Idle) => {}
            Some(state) => {
                log::info!("{} restarted negotiation while {}", from, state);
                self.restart_session(from);
            }
            None => {
                let spawner = &self.spawner;
                if let Err(e) = self.registry.ensure_session(from, |generation| {
                    PeerSession::new(from.clone(), generation, spawner.spawn(from, generation))
                }) {
                    log::debug!("not answering: {}", e);
                    return;
                }
            }
        }

        let Some(session) = self.registry.session_mut(from) else {
            return;
        };
        session.role = Some(Role::Answerer);
        if advance(session, SessionState::Answering, &self.outbox) {
            session.remote_pending = true;
            session.send(TransportCommand::ApplyRemote(offer));
        }
    }

    pub(super) fn handle_answer(&mut self, from: &PeerId, answer: SessionDescription) {
        let Some(session) = self.registry.session_mut(from) else {
            log::debug!("answer from {} without a session, dropped", from);
            return;
        };
        if session.state != SessionState::OfferSent
            || session.remote_pending
            || session.remote_described()
        {
            log::debug!("answer from {} while {}, dropped", from, session.state);
            return;
        }
        session.remote_pending = true;
        session.send(TransportCommand::ApplyRemote(answer));
    }

    pub(super) fn handle_ice_candidate(&mut self, from: &PeerId, candidate: IceCandidate) {
        match self.registry.session_mut(from) {
            Some(session) if !session.state.is_terminal() => session.receive_candidate(candidate),
            _ => log::debug!("candidate from {} without a live session, dropped", from),
        }
    }

    /// new transport, new generation. completions from the old one become no-ops
    fn restart_session(&mut self, peer: &PeerId) {
        let generation = self.registry.allocate_generation();
        let transport = self.spawner.spawn(peer, generation);
        if let Some(session) = self.registry.session_mut(peer) {
            session.restart(generation, transport);
        }
    }

    pub(super) fn on_step(&mut self, peer: &PeerId, generation: u64, step: NegotiationStep) {
        let Some(session) = self.registry.current(peer, generation) else {
            log::debug!("stale completion from {}#{}: {:?}", peer, generation, step);
            return;
        };
        match step {
            NegotiationStep::OfferCreated(offer) => {
                if session.state != SessionState::Offering {
                    log::debug!("offer for {} created while {}", peer, session.state);
                    return;
                }
                self.outbox.send_to(peer, Signal::Offer(offer));
                advance(session, SessionState::OfferSent, &self.outbox);
                for candidate in session.mark_local_sent() {
                    self.outbox.send_to(peer, Signal::IceCandidate(candidate));
                }
                arm_expiry(session, self.config.pending_offer_timeout(), &self.timer_tx);
            }
            NegotiationStep::RemoteApplied => {
                session.mark_remote_described();
                match session.state {
                    SessionState::Answering => session.send(TransportCommand::CreateAnswer),
                    SessionState::OfferSent => {
                        session.expiry = None;
                        advance(session, SessionState::Connected, &self.outbox);
                    }
                    state => log::debug!("remote description for {} applied while {}", peer, state),
                }
            }
            NegotiationStep::AnswerCreated(answer) => {
                if session.state != SessionState::Answering {
                    log::debug!("answer for {} created while {}", peer, session.state);
                    return;
                }
                self.outbox.send_to(peer, Signal::Answer(answer));
                advance(session, SessionState::AnswerSent, &self.outbox);
                for candidate in session.mark_local_sent() {
                    self.outbox.send_to(peer, Signal::IceCandidate(candidate));
                }
                if session.transport_up {
                    advance(session, SessionState::Connected, &self.outbox);
                } else {
                    arm_expiry(session, self.config.pending_offer_timeout(), &self.timer_tx);
                }
            }
            NegotiationStep::IceApplyFailed { candidate, reason } => {
                let err = MeshError::IceApplyFailed {
                    peer: peer.clone(),
                    reason,
                };
                log::warn!("{} (skipping `{}`)", err, candidate);
            }
            NegotiationStep::Failed(reason) => {
                let err = MeshError::TransportFailed {
                    peer: peer.clone(),
                    reason,
                };
                log::warn!("{}", err);
                advance(session, SessionState::Failed, &self.outbox);
                self.recover(peer);
            }
        }
    }

    pub(super) fn on_transport_event(&mut self, peer: &PeerId, generation: u64, event: TransportEvent) {
        let grace = self.config.failure_grace();
        let Some(session) = self.registry.current(peer, generation) else {
            log::debug!("event from replaced transport {}#{}", peer, generation);
            return;
        };
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = session.hold_local_candidate(candidate) {
                    self.outbox.send_to(peer, Signal::IceCandidate(candidate));
                }
            }
            TransportEvent::Connectivity(state) => {
                log::debug!("transport {}#{}: {}", peer, generation, state);
                if state == ConnectivityState::Connected {
                    session.transport_up = true;
                    session.retries = 0;
                    if session.grace.take().is_some() {
                        log::info!("transport to {} recovered", peer);
                    }
                    if session.state == SessionState::AnswerSent {
                        session.expiry = None;
                        advance(session, SessionState::Connected, &self.outbox);
                    }
                } else if state.is_degraded() {
                    session.transport_up = false;
                    if session.grace.is_none() && !session.state.is_terminal() {
                        log::info!("transport to {} is {}, waiting {:?}", peer, state, grace);
                        session.grace = Some(Timer::schedule(
                            grace,
                            &self.timer_tx,
                            RoomEvent::Timer(TimerEvent::Grace {
                                peer: peer.clone(),
                                generation,
                            }),
                        ));
                    }
                }
            }
            TransportEvent::RemoteTrack(track) => {
                log::info!("remote track from {}", peer);
                self.outbox.emit(EmittedEvents::RemoteTrack {
                    peer: peer.clone(),
                    track,
                });
            }
        }
    }

    pub(super) fn on_grace_expired(&mut self, peer: &PeerId, generation: u64) {
        let Some(session) = self.registry.current(peer, generation) else {
            return;
        };
        session.grace = None;
        if session.transport_up || session.state.is_terminal() {
            return;
        }
        let err = MeshError::TransportFailed {
            peer: peer.clone(),
            reason: "no recovery within the grace window".into(),
        };
        log::warn!("{}", err);
        advance(session, SessionState::Failed, &self.outbox);
        self.recover(peer);
    }

    pub(super) fn on_negotiation_expired(&mut self, peer: &PeerId, generation: u64) {
        let Some(session) = self.registry.current(peer, generation) else {
            return;
        };
        session.expiry = None;
        match session.state {
            SessionState::OfferSent => log::warn!("offer to {} was not answered in time", peer),
            SessionState::AnswerSent => {
                log::warn!("answer to {} did not lead to a connection in time", peer)
            }
            _ => return,
        }
        advance(session, SessionState::Failed, &self.outbox);
        self.recover(peer);
    }

    /// A FAILED session either re-offers on a fresh transport or, once the
    /// re-initiation budget is spent or the participant is gone, is removed.
    fn recover(&mut self, peer: &PeerId) {
        let Some(retries) = self.registry.session(peer).map(|s| s.retries) else {
            return;
        };
        let present = self.joined && self.presence.contains(peer);

        if present && retries < self.config.max_reinitiations {
            let generation = self.registry.allocate_generation();
            let transport = self.spawner.spawn(peer, generation);
            let Some(session) = self.registry.session_mut(peer) else {
                return;
            };
            advance(session, SessionState::Reconnecting, &self.outbox);
            session.restart(generation, transport);
            session.retries = retries + 1;
            log::info!(
                "re-initiating with {} ({}/{})",
                peer,
                session.retries,
                self.config.max_reinitiations
            );
            start_offer(session, &self.outbox);
            return;
        }

        if let Some(Slot::Active(_)) = self.registry.remove(peer, "failed") {
            self.outbox.session_state(peer, SessionState::Closed);
        }
        if present {
            let err = MeshError::PeerUnreachable(peer.clone());
            log::warn!("{}", err);
            self.outbox
                .emit(EmittedEvents::PeerUnreachable { peer: peer.clone() });
        }
    }
}
