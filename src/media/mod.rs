use anyhow::{bail, Result};
use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::media_engine::{
    MIME_TYPE_AV1, MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
    MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::internal::data_types::MediaKind;
use crate::MeshError;

mod rtp_source;
pub use rtp_source::{MediaInputs, RtpMediaProvider};

/// Local capture, as far as the orchestration core is concerned.
///
/// Capturing and encoding is the application's job. The provider only hands out
/// tracks that every peer session attaches read-only.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// `MediaDenied` is fatal to the join. Zero tracks of a kind is fine.
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MeshError>;
    async fn enable(&self, kind: MediaKind, enabled: bool) -> Result<()>;
    fn tracks_of(&self) -> Vec<LocalTrack>;
    /// only called when leaving the room. stopping a track affects every session
    async fn stop(&self);
}

/// A shared outgoing track.
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub rtp: Arc<TrackLocalStaticRTP>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, mime_type: MimeType, stream_id: &str) -> Self {
        let rtp = TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            kind.to_string(),
            stream_id.to_owned(),
        );
        Self {
            kind,
            rtp: Arc::new(rtp),
        }
    }
}

/// represents the MIME types from webrtc::api::media_engine
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    #[display(fmt = "{}", MIME_TYPE_H264)]
    H264,
    #[display(fmt = "{}", MIME_TYPE_VP8)]
    VP8,
    #[display(fmt = "{}", MIME_TYPE_VP9)]
    VP9,
    #[display(fmt = "{}", MIME_TYPE_AV1)]
    AV1,
    #[display(fmt = "{}", MIME_TYPE_OPUS)]
    OPUS,
    #[display(fmt = "{}", MIME_TYPE_G722)]
    G722,
    // G.711 mu-law and A-law
    #[display(fmt = "{}", MIME_TYPE_PCMU)]
    PCMU,
    #[display(fmt = "{}", MIME_TYPE_PCMA)]
    PCMA,
}

impl MimeType {
    pub fn from_string(s: &str) -> Result<Self> {
        let mime_type = match s {
            MIME_TYPE_H264 => MimeType::H264,
            MIME_TYPE_VP8 => MimeType::VP8,
            MIME_TYPE_VP9 => MimeType::VP9,
            MIME_TYPE_AV1 => MimeType::AV1,
            MIME_TYPE_OPUS => MimeType::OPUS,
            MIME_TYPE_G722 => MimeType::G722,
            MIME_TYPE_PCMU => MimeType::PCMU,
            MIME_TYPE_PCMA => MimeType::PCMA,
            _ => bail!("invalid mime type: {}", s),
        };
        Ok(mime_type)
    }

    /// default codec for each kind of local track
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MimeType::OPUS,
            MediaKind::Video => MimeType::VP8,
        }
    }
}
