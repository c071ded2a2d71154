use std::collections::HashMap;
use tokio::time::Instant;

use crate::internal::peer_session::PeerSession;
use crate::internal::room::SessionSnapshot;
use crate::internal::timers::Timer;
use crate::{MeshError, PeerId};

/// A claim on a remote participant made before any asynchronous work starts.
pub(crate) struct Reservation {
    pub reserved_at: Instant,
    /// fires the deferred initiation. dropping the reservation cancels it
    _initiate: Timer,
}

pub(crate) enum Slot {
    Reserved(Reservation),
    Active(PeerSession),
}

/// At most one slot per remote participant. A missing entry is the third state, absent.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    slots: HashMap<PeerId, Slot>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// claims `peer` for a deferred initiation. fails if anything already holds the slot
    pub fn reserve(&mut self, peer: &PeerId, initiate: Timer) -> Result<(), MeshError> {
        if self.slots.contains_key(peer) {
            return Err(MeshError::AlreadyNegotiating(peer.clone()));
        }
        self.slots.insert(
            peer.clone(),
            Slot::Reserved(Reservation {
                reserved_at: Instant::now(),
                _initiate: initiate,
            }),
        );
        Ok(())
    }

    /// Check-and-create. A reservation is converted, an absent slot is filled, a live
    /// session is left alone and reported as `AlreadyNegotiating`.
    pub fn ensure_session(
        &mut self,
        peer: &PeerId,
        create: impl FnOnce(u64) -> PeerSession,
    ) -> Result<&mut PeerSession, MeshError> {
        if let Some(Slot::Active(session)) = self.slots.get(peer) {
            if !session.state.is_terminal() {
                return Err(MeshError::AlreadyNegotiating(peer.clone()));
            }
        }
        let generation = self.allocate_generation();
        match self.slots.insert(peer.clone(), Slot::Active(create(generation))) {
            Some(Slot::Active(mut old)) => {
                old.close("replaced");
            }
            Some(Slot::Reserved(reservation)) => {
                log::debug!(
                    "reservation for {} converted after {:?}",
                    peer,
                    reservation.reserved_at.elapsed()
                );
            }
            None => {}
        }
        self.session_mut(peer)
            .ok_or_else(|| MeshError::AlreadyNegotiating(peer.clone()))
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.slots.contains_key(peer)
    }

    pub fn is_reserved(&self, peer: &PeerId) -> bool {
        matches!(self.slots.get(peer), Some(Slot::Reserved(_)))
    }

    pub fn session(&self, peer: &PeerId) -> Option<&PeerSession> {
        match self.slots.get(peer) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSession> {
        match self.slots.get_mut(peer) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    /// the session for `peer`, but only if `generation` is still current
    pub fn current(&mut self, peer: &PeerId, generation: u64) -> Option<&mut PeerSession> {
        self.session_mut(peer)
            .filter(|session| session.generation == generation)
    }

    /// Drops whatever holds the slot. The session is closed on the way out, so
    /// removing twice has no further side effects.
    pub fn remove(&mut self, peer: &PeerId, reason: &str) -> Option<Slot> {
        let mut slot = self.slots.remove(peer)?;
        if let Slot::Active(session) = &mut slot {
            session.close(reason);
        }
        Some(slot)
    }

    /// removes every slot, closing every session
    pub fn drain(&mut self, reason: &str) -> Vec<PeerSession> {
        self.slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Active(mut session) => {
                    session.close(reason);
                    Some(session)
                }
                Slot::Reserved(_) => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn reservations(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Reserved(_)))
            .map(|(peer, _)| peer.clone())
            .collect();
        out.sort();
        out
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out: Vec<SessionSnapshot> = self
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(session) => Some(SessionSnapshot {
                    remote: session.remote.clone(),
                    state: session.state,
                    role: session.role,
                    generation: session.generation,
                    retries: session.retries,
                    queued_candidates: session.queued_candidates(),
                    age: session.created_at.elapsed(),
                }),
                Slot::Reserved(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.remote.cmp(&b.remote));
        out
    }
}
