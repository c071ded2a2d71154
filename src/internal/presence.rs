use serde::Serialize;
use std::collections::HashMap;

use crate::PeerId;

/// Last explicitly announced state of one participant.
///
/// Camera and audio start out unknown, which reads as off. Nothing here is ever
/// inferred from media track mute/unmute events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub name: Option<String>,
    pub camera_enabled: Option<bool>,
    pub audio_enabled: Option<bool>,
    pub mic_active: bool,
}

impl PresenceRecord {
    pub fn camera_on(&self) -> bool {
        self.camera_enabled.unwrap_or(false)
    }

    pub fn audio_on(&self) -> bool {
        self.audio_enabled.unwrap_or(false)
    }
}

/// Presence records of the remote participants. Owned by the room actor.
#[derive(Default)]
pub(crate) struct PresenceState {
    records: HashMap<PeerId, PresenceRecord>,
}

impl PresenceState {
    /// creates the record on first sight. returns true if it was created
    pub fn observe(&mut self, peer: &PeerId) -> bool {
        if self.records.contains_key(peer) {
            return false;
        }
        self.records.insert(peer.clone(), PresenceRecord::default());
        true
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PresenceRecord> {
        self.records.get(peer)
    }

    // the setters below overwrite unconditionally and report whether anything changed

    pub fn set_name(&mut self, peer: &PeerId, name: String) -> bool {
        let record = self.records.entry(peer.clone()).or_default();
        if record.name.as_ref() == Some(&name) {
            return false;
        }
        record.name = Some(name);
        true
    }

    pub fn set_camera(&mut self, peer: &PeerId, enabled: bool) -> bool {
        let record = self.records.entry(peer.clone()).or_default();
        let changed = record.camera_enabled != Some(enabled);
        record.camera_enabled = Some(enabled);
        changed
    }

    pub fn set_audio(&mut self, peer: &PeerId, enabled: bool) -> bool {
        let record = self.records.entry(peer.clone()).or_default();
        let changed = record.audio_enabled != Some(enabled);
        record.audio_enabled = Some(enabled);
        if !enabled && record.mic_active {
            record.mic_active = false;
            return true;
        }
        changed
    }

    pub fn set_mic_active(&mut self, peer: &PeerId, active: bool) -> bool {
        let record = self.records.entry(peer.clone()).or_default();
        let changed = record.mic_active != active;
        record.mic_active = active;
        changed
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PresenceRecord> {
        self.records.remove(peer)
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PresenceRecord> {
        self.records.clone()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// what the local participant has announced about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LocalPresence {
    pub camera_enabled: bool,
    pub audio_enabled: bool,
    pub mic_active: bool,
}
