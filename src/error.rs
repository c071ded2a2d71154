use crate::PeerId;

/// Errors surfaced by the orchestration core.
///
/// Only `MediaDenied`, `PeerUnreachable` and the channel variants ever reach the
/// application. The others are produced and absorbed inside the room actor and
/// exist so that every absorbed condition is logged under a stable name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    /// local capture was refused. fatal to the join, never retried
    #[error("local media was denied: {0}")]
    MediaDenied(String),
    #[error("a session with {0} is already negotiating")]
    AlreadyNegotiating(PeerId),
    #[error("offer collision with {0}")]
    GlareConflict(PeerId),
    #[error("failed to apply ICE candidate from {peer}: {reason}")]
    IceApplyFailed { peer: PeerId, reason: String },
    #[error("transport to {peer} failed: {reason}")]
    TransportFailed { peer: PeerId, reason: String },
    /// the re-initiation budget for this peer is spent. the rest of the room carries on
    #[error("{0} is unreachable")]
    PeerUnreachable(PeerId),
    #[error("signaling channel closed abnormally: {0}")]
    ChannelClosedAbnormally(String),
    #[error("signaling channel closed normally")]
    ChannelClosedNormally,
    /// close codes 4001 (invalid room) and 4002 (room full)
    #[error("relay rejected the room (close code {0})")]
    ChannelRejected(u16),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("room actor stopped")]
    Stopped,
}

impl MeshError {
    /// Maps a websocket close code onto the channel taxonomy.
    pub fn from_close_code(code: u16, reason: &str) -> Self {
        match code {
            1000 => MeshError::ChannelClosedNormally,
            4001 | 4002 => MeshError::ChannelRejected(code),
            _ => MeshError::ChannelClosedAbnormally(format!("close code {code}: {reason}")),
        }
    }

    /// true when the signaling channel should be re-established after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::ChannelClosedAbnormally(_))
    }
}
