//! room-mesh
//!
//! Client-side orchestration of a full-mesh WebRTC room, built on
//! [webrtc-rs](https://github.com/webrtc-rs/webrtc). Every participant holds one peer session
//! per remote participant; a shared signaling relay carries offers, answers, ICE candidates
//! and presence announcements between them.
//!
//! This library is not responsible for media capture or rendering. Local media is handed in
//! through a [`MediaProvider`] and remote tracks are handed out as [`EmittedEvents::RemoteTrack`].
//!
//! Initializing a [`Controller`] yields the controller and a [`RoomHandle`]. The controller is a
//! single sequential dispatch loop: inbound envelopes, application requests, transport
//! callbacks and timers are all processed one at a time, so no two handlers ever observe a
//! half-updated session. The handle is cheap to clone and is what the signaling channel and the
//! application use to drive the room.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub mod config;
mod error;
mod internal;
pub mod media;
pub mod membership;
pub mod signaling;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::internal::events::{Command, RoomEvent};
use crate::internal::room::{Room, RoomParts};

// public exports
pub use config::{GlarePolicy, MeshConfig, ReconnectPolicy};
pub use error::MeshError;
pub use internal::data_types::*;
pub use internal::events::{EmittedEvents, TransportEvent};
pub use internal::presence::PresenceRecord;
pub use internal::room::{RoomSnapshot, SessionSnapshot};
pub use internal::rtc_transport::RtcTransportFactory;
pub use internal::speech::{SpeechDetector, SpeechTransition};
pub use internal::transport::{MediaTransport, TransportEventSink, TransportFactory};
pub use media::{LocalTrack, MediaProvider};
pub use membership::Membership;
pub use signaling::Envelope;

// a lazy version of the builder pattern
pub struct InitArgs {
    /// client's id, see [`generate_peer_id`]
    pub id: PeerId,
    /// display name announced to the room
    pub name: String,
    pub room: String,
    pub config: MeshConfig,
    pub media: Arc<dyn MediaProvider>,
    pub membership: Arc<dyn Membership>,
    pub transports: Arc<dyn TransportFactory>,
    /// every outbound envelope goes here. the signaling channel drains it
    pub signal_chan: mpsc::UnboundedSender<Envelope>,
    /// used to emit events
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

/// Owns the room state. Drive it with [`Controller::run`] or [`Controller::spawn`].
pub struct Controller {
    room: Room,
    /// requests from every `RoomHandle`
    commands: mpsc::UnboundedReceiver<Command>,
    /// transport callbacks, completed negotiation steps and timers
    internal: mpsc::UnboundedReceiver<RoomEvent>,
}

impl Controller {
    pub fn init(args: InitArgs) -> (Self, RoomHandle) {
        let InitArgs {
            id,
            name,
            room,
            config,
            media,
            membership,
            transports,
            signal_chan,
            emitted_event_chan,
        } = args;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let handle = RoomHandle {
            id: id.clone(),
            tx: command_tx,
        };
        let room = Room::new(RoomParts {
            local: id,
            name,
            room,
            config,
            media,
            membership,
            transports,
            signal_tx: signal_chan,
            event_tx: emitted_event_chan,
            timer_tx: internal_tx,
        });
        (
            Self {
                room,
                commands: command_rx,
                internal: internal_rx,
            },
            handle,
        )
    }

    /// Runs until `leave` completes or every `RoomHandle` is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.room.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        log::debug!("all room handles dropped");
                        self.room.shutdown();
                        break;
                    }
                },
                opt = self.internal.recv() => match opt {
                    Some(event) => self.room.handle_event(event),
                    None => {
                        log::error!("internal channel closed");
                        self.room.shutdown();
                        break;
                    }
                }
            }
        }
        log::debug!("room actor stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Cloneable handle into a running [`Controller`]. Every method fails with
/// [`MeshError::Stopped`] once the controller is gone.
#[derive(Clone)]
pub struct RoomHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<Command>,
}

impl RoomHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn send(&self, cmd: Command) -> Result<(), MeshError> {
        self.tx.send(cmd).map_err(|_| MeshError::Stopped)
    }

    /// hands an inbound envelope to the dispatch loop
    pub fn deliver(&self, envelope: Envelope) -> Result<(), MeshError> {
        self.send(Command::Deliver(envelope))
    }

    /// decodes a text frame from the relay and delivers it
    pub fn deliver_json(&self, text: &str) -> Result<(), MeshError> {
        let envelope = Envelope::from_json(text)?;
        self.deliver(envelope)
    }

    /// the signaling channel (re)connected. presence is announced again if joined
    pub fn channel_opened(&self) -> Result<(), MeshError> {
        self.send(Command::ChannelOpened)
    }

    pub async fn join(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Join(tx))?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Closes every session, stops local media and withdraws from the room. The controller
    /// exits afterwards, which closes the outbound signal channel normally.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Leave(tx))?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    pub fn set_camera(&self, enabled: bool) -> Result<(), MeshError> {
        self.send(Command::SetCamera(enabled))
    }

    pub fn set_audio(&self, enabled: bool) -> Result<(), MeshError> {
        self.send(Command::SetAudio(enabled))
    }

    /// average local microphone level, 0-255. drives `mic-active` announcements
    pub fn audio_level(&self, level: u8) -> Result<(), MeshError> {
        self.send(Command::AudioLevel(level))
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| MeshError::Stopped)
    }
}
