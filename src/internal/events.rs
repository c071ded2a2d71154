use std::sync::Arc;
use tokio::sync::oneshot;
use webrtc::track::track_remote::TrackRemote;

use crate::internal::data_types::{ConnectivityState, SessionState};
use crate::internal::presence::PresenceRecord;
use crate::internal::room::RoomSnapshot;
use crate::signaling::{Envelope, IceCandidate, SessionDescription};
use crate::{MeshError, PeerId};

/// events for the application
#[derive(Clone)]
pub enum EmittedEvents {
    SessionState {
        peer: PeerId,
        state: SessionState,
    },
    /// a remote participant's track arrived. rendering it is up to the application
    RemoteTrack {
        peer: PeerId,
        track: Arc<TrackRemote>,
    },
    /// the participant left. its session is closed and its remote media display must be torn down
    ParticipantLeft {
        peer: PeerId,
    },
    PresenceChanged {
        peer: PeerId,
        record: PresenceRecord,
    },
    /// re-initiation budget exhausted. the rest of the room is unaffected
    PeerUnreachable {
        peer: PeerId,
    },
    /// an envelope the core does not own (whiteboard, chat, ...)
    Passthrough(Envelope),
    Fatal(MeshError),
}

/// reported by a media transport about itself
#[derive(Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    RemoteTrack(Arc<TrackRemote>),
}

/// requests from a `RoomHandle`
pub(crate) enum Command {
    Deliver(Envelope),
    ChannelOpened,
    Join(oneshot::Sender<Result<(), MeshError>>),
    Leave(oneshot::Sender<()>),
    SetCamera(bool),
    SetAudio(bool),
    AudioLevel(u8),
    Snapshot(oneshot::Sender<RoomSnapshot>),
}

/// produced inside the crate and fed back into the room actor
pub(crate) enum RoomEvent {
    Transport {
        peer: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    Step {
        peer: PeerId,
        generation: u64,
        step: NegotiationStep,
    },
    Timer(TimerEvent),
}

/// completion of an asynchronous step run by a transport worker
#[derive(Debug)]
pub(crate) enum NegotiationStep {
    OfferCreated(SessionDescription),
    RemoteApplied,
    AnswerCreated(SessionDescription),
    IceApplyFailed { candidate: String, reason: String },
    Failed(String),
}

#[derive(Debug)]
pub(crate) enum TimerEvent {
    Initiate { peer: PeerId },
    Grace { peer: PeerId, generation: u64 },
    NegotiationExpired { peer: PeerId, generation: u64 },
    PresenceReply { peer: PeerId },
    RequestStates,
    MicRelease { epoch: u64 },
    RemoteMicDecay { peer: PeerId, epoch: u64 },
}
