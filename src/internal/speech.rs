use std::time::Duration;
use tokio::time::Instant;

const SMOOTHING: f32 = 0.85;
const THRESHOLD: f32 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechTransition {
    /// speech lasted long enough to be announced
    Started,
    /// level dropped while speaking. the release debounce starts now
    Paused,
    /// speech resumed inside the release debounce
    Resumed,
}

/// Turns average input levels (0-255) into speaking transitions.
///
/// Blips shorter than `min_speech` never produce `Started`. The caller owns the
/// release debounce and calls [`SpeechDetector::release`] when it expires.
pub struct SpeechDetector {
    min_speech: Duration,
    smoothed: f32,
    onset: Option<Instant>,
    speaking: bool,
    paused: bool,
}

impl SpeechDetector {
    pub fn new(min_speech: Duration) -> Self {
        Self {
            min_speech,
            smoothed: 0.0,
            onset: None,
            speaking: false,
            paused: false,
        }
    }

    pub fn push(&mut self, level: u8, now: Instant) -> Option<SpeechTransition> {
        self.smoothed = SMOOTHING * self.smoothed + (1.0 - SMOOTHING) * f32::from(level);

        if self.smoothed > THRESHOLD {
            if self.speaking {
                if self.paused {
                    self.paused = false;
                    return Some(SpeechTransition::Resumed);
                }
                return None;
            }
            let onset = *self.onset.get_or_insert(now);
            if now.duration_since(onset) >= self.min_speech {
                self.speaking = true;
                return Some(SpeechTransition::Started);
            }
            return None;
        }

        self.onset = None;
        if self.speaking && !self.paused {
            self.paused = true;
            return Some(SpeechTransition::Paused);
        }
        None
    }

    pub fn release(&mut self) {
        self.speaking = false;
        self.paused = false;
    }

    /// forget everything, e.g. after the microphone was muted
    pub fn reset(&mut self) {
        self.release();
        self.smoothed = 0.0;
        self.onset = None;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}
