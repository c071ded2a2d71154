use std::collections::VecDeque;
use tokio::time::Instant;

use crate::internal::data_types::{Role, SessionState};
use crate::internal::timers::Timer;
use crate::internal::transport::{TransportCommand, TransportHandle};
use crate::signaling::IceCandidate;
use crate::PeerId;

/// Negotiation and transport state for one remote participant.
pub(crate) struct PeerSession {
    pub remote: PeerId,
    /// identity of the current transport. bumped every time the transport is replaced
    pub generation: u64,
    pub state: SessionState,
    pub role: Option<Role>,
    /// consecutive automatic re-initiations
    pub retries: u32,
    pub created_at: Instant,
    /// the remote description was handed to the transport and is awaiting completion
    pub remote_pending: bool,
    remote_described: bool,
    local_sent: bool,
    /// remote candidates that arrived before the remote description was applied
    ice_queue: VecDeque<IceCandidate>,
    /// local candidates gathered before our offer/answer went out
    outbound_ice: Vec<IceCandidate>,
    pub transport_up: bool,
    transport: TransportHandle,
    pub grace: Option<Timer>,
    /// bounds OFFER_SENT and ANSWER_SENT
    pub expiry: Option<Timer>,
}

impl PeerSession {
    pub fn new(remote: PeerId, generation: u64, transport: TransportHandle) -> Self {
        Self {
            remote,
            generation,
            state: SessionState::Idle,
            role: None,
            retries: 0,
            created_at: Instant::now(),
            remote_pending: false,
            remote_described: false,
            local_sent: false,
            ice_queue: VecDeque::new(),
            outbound_ice: Vec::new(),
            transport_up: false,
            transport,
            grace: None,
            expiry: None,
        }
    }

    /// returns false (and leaves the state alone) for a transition the state machine forbids
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition(next) {
            log::debug!(
                "session {}#{}: ignoring {} -> {}",
                &self.remote,
                self.generation,
                self.state,
                next
            );
            return false;
        }
        log::info!(
            "session {}#{}: {} -> {}",
            &self.remote,
            self.generation,
            self.state,
            next
        );
        self.state = next;
        true
    }

    /// Swaps in a fresh transport under a new generation and starts over from IDLE.
    /// The retry counter survives.
    pub fn restart(&mut self, generation: u64, transport: TransportHandle) {
        log::debug!(
            "session {}#{}: restarting as #{}",
            &self.remote,
            self.generation,
            generation
        );
        self.release();
        self.generation = generation;
        self.transport = transport;
        self.state = SessionState::Idle;
        self.role = None;
        self.remote_pending = false;
        self.remote_described = false;
        self.local_sent = false;
        self.transport_up = false;
    }

    pub fn send(&self, cmd: TransportCommand) {
        self.transport.send(cmd);
    }

    pub fn remote_described(&self) -> bool {
        self.remote_described
    }

    pub fn queued_candidates(&self) -> usize {
        self.ice_queue.len()
    }

    /// applies the candidate now if the remote description is in place, queues it otherwise
    pub fn receive_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_described {
            self.transport.send(TransportCommand::AddIce(candidate));
        } else {
            log::debug!(
                "session {}#{}: queueing candidate until the remote description is applied",
                &self.remote,
                self.generation
            );
            self.ice_queue.push_back(candidate);
        }
    }

    /// the remote description is applied. drains the queue in arrival order
    pub fn mark_remote_described(&mut self) {
        self.remote_pending = false;
        self.remote_described = true;
        while let Some(candidate) = self.ice_queue.pop_front() {
            self.transport.send(TransportCommand::AddIce(candidate));
        }
    }

    /// returns the candidate if it may go out right away
    pub fn hold_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_sent {
            Some(candidate)
        } else {
            self.outbound_ice.push(candidate);
            None
        }
    }

    /// our description went out. returns the held local candidates
    pub fn mark_local_sent(&mut self) -> Vec<IceCandidate> {
        self.local_sent = true;
        std::mem::take(&mut self.outbound_ice)
    }

    /// Closes the session. Returns false if it was already closed.
    pub fn close(&mut self, reason: &str) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        log::info!(
            "session {}#{}: {} -> CLOSED ({})",
            &self.remote,
            self.generation,
            self.state,
            reason
        );
        self.state = SessionState::Closed;
        self.release();
        true
    }

    fn release(&mut self) {
        self.transport.close();
        self.ice_queue.clear();
        self.outbound_ice.clear();
        self.grace = None;
        self.expiry = None;
    }

    #[cfg(test)]
    pub fn transport_closed(&self) -> bool {
        self.transport.is_closed()
    }
}
