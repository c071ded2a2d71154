use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::rtp;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::internal::data_types::MediaKind;
use crate::media::{LocalTrack, MediaProvider, MimeType};
use crate::MeshError;

enum MediaWorkerCommands {
    Enable(bool),
    Terminate,
}

/// allows the capture layer to push encoded RTP packets. `None` for kinds the provider was built without
pub struct MediaInputs {
    pub camera_tx: Option<mpsc::UnboundedSender<rtp::packet::Packet>>,
    pub microphone_tx: Option<mpsc::UnboundedSender<rtp::packet::Packet>>,
}

struct Pending {
    kind: MediaKind,
    media_rx: mpsc::UnboundedReceiver<rtp::packet::Packet>,
}

#[derive(Default)]
struct Acquired {
    tracks: Vec<LocalTrack>,
    workers: HashMap<MediaKind, mpsc::UnboundedSender<MediaWorkerCommands>>,
}

/// Serves one shared `TrackLocalStaticRTP` per media kind, fed from `MediaInputs`.
pub struct RtpMediaProvider {
    stream_id: String,
    pending: Mutex<Vec<Pending>>,
    acquired: Mutex<Option<Acquired>>,
}

impl RtpMediaProvider {
    pub fn new(kinds: &[MediaKind], stream_id: &str) -> (Self, MediaInputs) {
        let mut inputs = MediaInputs {
            camera_tx: None,
            microphone_tx: None,
        };
        let mut pending = Vec::new();
        for kind in kinds {
            let (tx, rx) = mpsc::unbounded_channel::<rtp::packet::Packet>();
            match kind {
                MediaKind::Video => inputs.camera_tx = Some(tx),
                MediaKind::Audio => inputs.microphone_tx = Some(tx),
            }
            pending.push(Pending {
                kind: *kind,
                media_rx: rx,
            });
        }
        (
            Self {
                stream_id: stream_id.to_owned(),
                pending: Mutex::new(pending),
                acquired: Mutex::new(None),
            },
            inputs,
        )
    }
}

#[async_trait]
impl MediaProvider for RtpMediaProvider {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MeshError> {
        let mut acquired = self
            .acquired
            .lock()
            .map_err(|_| MeshError::MediaDenied("media provider poisoned".into()))?;
        if let Some(acquired) = acquired.as_ref() {
            return Ok(acquired.tracks.clone());
        }
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .map_err(|_| MeshError::MediaDenied("media provider poisoned".into()))?,
        );

        let mut result = Acquired::default();
        for Pending { kind, media_rx } in pending {
            let track = LocalTrack::new(kind, MimeType::default_for(kind), &self.stream_id);
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let worker = MediaWorker {
                kind,
                control_rx,
                media_rx,
                track: track.rtp.clone(),
                enabled: true,
            };
            tokio::spawn(worker.run());
            result.workers.insert(kind, control_tx);
            result.tracks.push(track);
        }
        let tracks = result.tracks.clone();
        *acquired = Some(result);
        Ok(tracks)
    }

    async fn enable(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        let acquired = match self.acquired.lock() {
            Ok(acquired) => acquired,
            Err(_) => bail!("media provider poisoned"),
        };
        match acquired.as_ref().and_then(|a| a.workers.get(&kind)) {
            Some(worker) => {
                worker.send(MediaWorkerCommands::Enable(enabled))?;
                Ok(())
            }
            None => bail!("no {} track", kind),
        }
    }

    fn tracks_of(&self) -> Vec<LocalTrack> {
        match self.acquired.lock() {
            Ok(acquired) => acquired
                .as_ref()
                .map(|a| a.tracks.clone())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn stop(&self) {
        let acquired = match self.acquired.lock() {
            Ok(mut acquired) => acquired.take(),
            Err(_) => None,
        };
        if let Some(acquired) = acquired {
            for worker in acquired.workers.values() {
                let _ = worker.send(MediaWorkerCommands::Terminate);
            }
        }
    }
}

/// each MediaWorker only handles one kind of media and writes to a single shared track
struct MediaWorker {
    kind: MediaKind,
    control_rx: mpsc::UnboundedReceiver<MediaWorkerCommands>,
    /// receives RTP packets from the capture layer
    media_rx: mpsc::UnboundedReceiver<rtp::packet::Packet>,
    track: Arc<TrackLocalStaticRTP>,
    /// packets are dropped while disabled
    enabled: bool,
}

impl MediaWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.control_rx.recv() => match cmd {
                    Some(MediaWorkerCommands::Enable(enabled)) => {
                        log::debug!("{} {}", self.kind, if enabled { "enabled" } else { "disabled" });
                        self.enabled = enabled;
                    }
                    Some(MediaWorkerCommands::Terminate) | None => return,
                },
                opt = self.media_rx.recv() => match opt {
                    Some(packet) => {
                        if !self.enabled {
                            continue;
                        }
                        if let Err(e) = self.track.write_rtp(&packet).await {
                            log::warn!("failed to write RTP packet to {} track: {}", self.kind, e);
                        }
                    }
                    None => {
                        log::info!("{} input closed. exiting", self.kind);
                        return;
                    }
                }
            }
        }
    }
}
