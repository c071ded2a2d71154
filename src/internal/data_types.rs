use derive_more::Display;
use serde::Serialize;

/// uniquely identifies participants within a room
pub type PeerId = String;

/// a fresh identifier for the local participant
pub fn generate_peer_id() -> PeerId {
    uuid::Uuid::new_v4().to_string()
}

/// Negotiation state of one Peer Session.
///
/// ```text
/// IDLE -> OFFERING -> OFFER_SENT ---+
/// IDLE -> ANSWERING -> ANSWER_SENT -+-> CONNECTED -> CLOSED
/// any -> FAILED -> RECONNECTING -> OFFERING
///        FAILED -> CLOSED
/// ```
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    #[display(fmt = "IDLE")]
    Idle,
    #[display(fmt = "OFFERING")]
    Offering,
    #[display(fmt = "OFFER_SENT")]
    OfferSent,
    #[display(fmt = "ANSWERING")]
    Answering,
    #[display(fmt = "ANSWER_SENT")]
    AnswerSent,
    #[display(fmt = "CONNECTED")]
    Connected,
    #[display(fmt = "FAILED")]
    Failed,
    #[display(fmt = "RECONNECTING")]
    Reconnecting,
    #[display(fmt = "CLOSED")]
    Closed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) | (_, Failed) => true,
            (Idle, Offering) | (Idle, Answering) => true,
            (Offering, OfferSent) | (Answering, AnswerSent) => true,
            (OfferSent, Connected) | (AnswerSent, Connected) => true,
            (Failed, Reconnecting) | (Reconnecting, Offering) => true,
            _ => false,
        }
    }

    /// a session in one of these states no longer blocks a new negotiation
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// we sent or are about to send an offer that has not been answered
    pub fn is_offering(self) -> bool {
        matches!(self, SessionState::Offering | SessionState::OfferSent)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    #[display(fmt = "offerer")]
    Offerer,
    #[display(fmt = "answerer")]
    Answerer,
}

/// connectivity of the underlying transport, as reported by ICE
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    #[display(fmt = "new")]
    New,
    #[display(fmt = "checking")]
    Checking,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "closed")]
    Closed,
}

impl ConnectivityState {
    /// failed and disconnected both arm the grace window
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ConnectivityState::Failed | ConnectivityState::Disconnected
        )
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn offer_path() {
        assert!(Idle.can_transition(Offering));
        assert!(Offering.can_transition(OfferSent));
        assert!(OfferSent.can_transition(Connected));
        assert!(!Offering.can_transition(Connected));
        assert!(!Idle.can_transition(Connected));
    }

    #[test]
    fn failure_paths() {
        assert!(AnswerSent.can_transition(Failed));
        assert!(Failed.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Offering));
        assert!(Failed.can_transition(Closed));
        assert!(!Failed.can_transition(Connected));
        assert!(!Closed.can_transition(Closed));
        assert!(!Closed.can_transition(Failed));
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(OfferSent.to_string(), "OFFER_SENT");
        assert_eq!(Role::Answerer.to_string(), "answerer");
    }
}
