use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::internal::events::{NegotiationStep, RoomEvent, TransportEvent};
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::PeerId;

/// One direct media connection to one remote participant.
///
/// `create_offer` and `create_answer` also install the result as the local
/// description, which starts candidate gathering.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// builds a transport for `remote`. everything the transport observes about
    /// itself (local candidates, connectivity, remote tracks) goes to `events`
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>>;
}

/// Carries transport callbacks back to the room, tagged with the session generation
/// so that reports from a replaced transport are ignored.
#[derive(Clone)]
pub struct TransportEventSink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl TransportEventSink {
    pub(crate) fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn emit(&self, event: TransportEvent) {
        if self
            .tx
            .send(RoomEvent::Transport {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_err()
        {
            log::debug!("room is gone, dropping transport event for {}", self.peer);
        }
    }
}

pub(crate) enum TransportCommand {
    CreateOffer,
    ApplyRemote(SessionDescription),
    CreateAnswer,
    AddIce(IceCandidate),
    Close,
}

/// The session's end of a transport worker. Commands run in the order they are sent.
pub(crate) struct TransportHandle {
    tx: Option<mpsc::UnboundedSender<TransportCommand>>,
}

impl TransportHandle {
    pub fn new(tx: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn send(&self, cmd: TransportCommand) {
        match &self.tx {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    log::debug!("transport worker already exited");
                }
            }
            None => log::debug!("command for a closed transport"),
        }
    }

    /// releases the transport. only the first call does anything
    pub fn close(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(TransportCommand::Close);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Everything needed to spawn transport workers. Local tracks are shared by every session.
#[derive(Clone)]
pub(crate) struct TransportSpawner {
    pub factory: Arc<dyn TransportFactory>,
    pub tracks: Vec<LocalTrack>,
    pub room_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl TransportSpawner {
    pub fn spawn(&self, remote: &PeerId, generation: u64) -> TransportHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let worker = TransportWorker {
            remote: remote.clone(),
            generation,
            factory: self.factory.clone(),
            tracks: self.tracks.clone(),
            control_rx,
            room_tx: self.room_tx.clone(),
        };
        tokio::spawn(worker.run());
        TransportHandle::new(control_tx)
    }
}

/// creates the transport, attaches the local tracks, then runs commands one at a time
/// and reports each completion to the room
struct TransportWorker {
    remote: PeerId,
    generation: u64,
    factory: Arc<dyn TransportFactory>,
    tracks: Vec<LocalTrack>,
    control_rx: mpsc::UnboundedReceiver<TransportCommand>,
    room_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl TransportWorker {
    async fn run(mut self) {
        let sink = TransportEventSink::new(self.remote.clone(), self.generation, self.room_tx.clone());
        let transport = match self.factory.create(&self.remote, sink).await {
            Ok(t) => t,
            Err(e) => {
                log::error!("failed to create transport for {}: {}", &self.remote, e);
                self.report(NegotiationStep::Failed(e.to_string()));
                return;
            }
        };

        for track in &self.tracks {
            if let Err(e) = transport.add_track(track).await {
                log::warn!("failed to attach {} track for {}: {}", track.kind, &self.remote, e);
            }
        }

        while let Some(cmd) = self.control_rx.recv().await {
            match cmd {
                TransportCommand::CreateOffer => match transport.create_offer().await {
                    Ok(desc) => self.report(NegotiationStep::OfferCreated(desc)),
                    Err(e) => self.report(NegotiationStep::Failed(format!("create offer: {e}"))),
                },
                TransportCommand::ApplyRemote(desc) => {
                    match transport.set_remote_description(desc).await {
                        Ok(()) => self.report(NegotiationStep::RemoteApplied),
                        Err(e) => self.report(NegotiationStep::Failed(format!(
                            "set remote description: {e}"
                        ))),
                    }
                }
                TransportCommand::CreateAnswer => match transport.create_answer().await {
                    Ok(desc) => self.report(NegotiationStep::AnswerCreated(desc)),
                    Err(e) => self.report(NegotiationStep::Failed(format!("create answer: {e}"))),
                },
                TransportCommand::AddIce(candidate) => {
                    let text = candidate.candidate.clone();
                    if let Err(e) = transport.add_ice_candidate(candidate).await {
                        self.report(NegotiationStep::IceApplyFailed {
                            candidate: text,
                            reason: e.to_string(),
                        });
                    }
                }
                TransportCommand::Close => break,
            }
        }

        if let Err(e) = transport.close().await {
            log::debug!("error closing transport for {}: {}", &self.remote, e);
        }
        log::debug!("transport worker for {}#{} exited", &self.remote, self.generation);
    }

    fn report(&self, step: NegotiationStep) {
        let _ = self.room_tx.send(RoomEvent::Step {
            peer: self.remote.clone(),
            generation: self.generation,
            step,
        });
    }
}
