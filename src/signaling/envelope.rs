use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{MeshError, PeerId};

/// One addressed or broadcast message exchanged over the relay.
///
/// The wire form is a flat JSON object: `{"type": "offer", "from": "..", "to": "..", "offer": {..}}`.
/// Envelopes are never mutated after they are received; the router only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    /// sender. the relay fills `uid` instead for the joins it forwards
    pub from: Option<PeerId>,
    /// precise addressing chosen by the sender
    pub to: Option<PeerId>,
    /// addressing stamped by a relay that broadcasts and lets receivers filter (`_target`)
    pub target: Option<PeerId>,
    pub room: Option<String>,
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Join { name: Option<String> },
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Leave,
    CameraEnabled,
    CameraDisabled,
    MicActive,
    MicInactive,
    AudioEnabled,
    AudioDisabled,
    RequestCameraStates,
    RequestAudioStates,
    /// whiteboard, chat and anything else the core does not own. carried unchanged
    Other {
        kind: String,
        fields: Map<String, Value>,
    },
}

impl Signal {
    /// the wire `type` of this signal
    pub fn kind(&self) -> &str {
        match self {
            Signal::Join { .. } => "join",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::Leave => "leave",
            Signal::CameraEnabled => "camera-enabled",
            Signal::CameraDisabled => "camera-disabled",
            Signal::MicActive => "mic-active",
            Signal::MicInactive => "mic-inactive",
            Signal::AudioEnabled => "audio-enabled",
            Signal::AudioDisabled => "audio-disabled",
            Signal::RequestCameraStates => "request-camera-states",
            Signal::RequestAudioStates => "request-audio-states",
            Signal::Other { kind, .. } => kind,
        }
    }

    /// join and leave are always room-wide, whatever `to` says
    pub fn is_broadcast_only(&self) -> bool {
        matches!(self, Signal::Join { .. } | Signal::Leave)
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Signal::Offer(_) | Signal::Answer(_) | Signal::IceCandidate(_)
        )
    }

    pub fn camera(enabled: bool) -> Self {
        if enabled {
            Signal::CameraEnabled
        } else {
            Signal::CameraDisabled
        }
    }

    pub fn audio(enabled: bool) -> Self {
        if enabled {
            Signal::AudioEnabled
        } else {
            Signal::AudioDisabled
        }
    }

    pub fn mic(active: bool) -> Self {
        if active {
            Signal::MicActive
        } else {
            Signal::MicInactive
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// `{type, sdp}`, the shape browsers and webrtc-rs both serialize descriptions to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

impl Envelope {
    /// an envelope from `from` with no addressing
    pub fn broadcast(from: impl Into<PeerId>, signal: Signal) -> Self {
        Self {
            from: Some(from.into()),
            to: None,
            target: None,
            room: None,
            signal,
        }
    }

    /// an envelope from `from` addressed to `to`
    pub fn directed(from: impl Into<PeerId>, to: impl Into<PeerId>, signal: Signal) -> Self {
        Self {
            to: Some(to.into()),
            ..Self::broadcast(from, signal)
        }
    }

    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn from_json(s: &str) -> Result<Self, MeshError> {
        serde_json::from_str(s).map_err(|e| MeshError::InvalidEnvelope(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::InvalidEnvelope(e.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, deserialize_with = "opt_id", skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, deserialize_with = "opt_id", skip_serializing)]
    uid: Option<String>,
    #[serde(default, deserialize_with = "opt_id", skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(
        rename = "_target",
        alias = "target",
        default,
        deserialize_with = "opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// identifiers sometimes arrive as numbers from older relays
pub(crate) fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn payload<T: serde::de::DeserializeOwned>(
    rest: &mut Map<String, Value>,
    key: &str,
) -> Result<T, MeshError> {
    let value = rest
        .remove(key)
        .ok_or_else(|| MeshError::InvalidEnvelope(format!("missing `{key}` payload")))?;
    serde_json::from_value(value).map_err(|e| MeshError::InvalidEnvelope(format!("`{key}`: {e}")))
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = MeshError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let RawEnvelope {
            kind,
            from,
            uid,
            to,
            target,
            room,
            mut rest,
        } = raw;
        let signal = match kind.as_str() {
            "join" | "user-joined" => Signal::Join {
                name: rest.get("name").and_then(Value::as_str).map(str::to_owned),
            },
            "offer" => Signal::Offer(payload(&mut rest, "offer")?),
            "answer" => Signal::Answer(payload(&mut rest, "answer")?),
            "ice-candidate" => Signal::IceCandidate(payload(&mut rest, "candidate")?),
            "leave" | "user-left" => Signal::Leave,
            "camera-enabled" => Signal::CameraEnabled,
            "camera-disabled" => Signal::CameraDisabled,
            "mic-active" => Signal::MicActive,
            "mic-inactive" => Signal::MicInactive,
            "audio-enabled" => Signal::AudioEnabled,
            "audio-disabled" => Signal::AudioDisabled,
            "request-camera-states" => Signal::RequestCameraStates,
            "request-audio-states" => Signal::RequestAudioStates,
            _ => Signal::Other { kind, fields: rest },
        };
        Ok(Envelope {
            from: from.or(uid),
            to,
            target,
            room,
            signal,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let mut rest = Map::new();
        let kind = envelope.signal.kind().to_owned();
        match envelope.signal {
            Signal::Join { name: Some(name) } => {
                rest.insert("name".into(), Value::String(name));
            }
            Signal::Offer(desc) => {
                rest.insert("offer".into(), description_value(desc));
            }
            Signal::Answer(desc) => {
                rest.insert("answer".into(), description_value(desc));
            }
            Signal::IceCandidate(candidate) => {
                rest.insert(
                    "candidate".into(),
                    serde_json::to_value(candidate).unwrap_or(Value::Null),
                );
            }
            Signal::Other { fields, .. } => rest = fields,
            _ => {}
        }
        RawEnvelope {
            kind,
            from: envelope.from,
            uid: None,
            to: envelope.to,
            target: envelope.target,
            room: envelope.room,
            rest,
        }
    }
}

fn description_value(desc: SessionDescription) -> Value {
    let kind = match desc.kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    serde_json::json!({ "type": kind, "sdp": desc.sdp })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_relay_join() {
        let env = Envelope::from_json(r#"{"type":"user-joined","uid":"b1","name":"Bea"}"#).unwrap();
        assert_eq!(env.from.as_deref(), Some("b1"));
        assert_eq!(
            env.signal,
            Signal::Join {
                name: Some("Bea".into())
            }
        );
    }

    #[test]
    fn decodes_targeted_offer() {
        let env = Envelope::from_json(
            r#"{"type":"offer","from":"a","to":"b","_target":"b","offer":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(env.target.as_deref(), Some("b"));
        assert_eq!(env.signal, Signal::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn accepts_plain_target_and_numeric_ids() {
        let env = Envelope::from_json(r#"{"type":"camera-enabled","from":17,"target":"c"}"#).unwrap();
        assert_eq!(env.from.as_deref(), Some("17"));
        assert_eq!(env.target.as_deref(), Some("c"));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let env = Envelope::directed(
            "a",
            "b",
            Signal::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        );
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert!(json.get("_target").is_none());
    }

    #[test]
    fn unknown_types_pass_through() {
        let raw = r#"{"type":"draw-line","from":"a","points":[1,2,3]}"#;
        let env = Envelope::from_json(raw).unwrap();
        match &env.signal {
            Signal::Other { kind, fields } => {
                assert_eq!(kind, "draw-line");
                assert_eq!(fields["points"], serde_json::json!([1, 2, 3]));
            }
            other => panic!("unexpected {other:?}"),
        }
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["points"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn offer_without_payload_is_invalid() {
        let err = Envelope::from_json(r#"{"type":"offer","from":"a"}"#).unwrap_err();
        assert!(matches!(err, MeshError::InvalidEnvelope(_)));
    }
}
