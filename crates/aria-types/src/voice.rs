//! Process-wide voice settings.
//!
//! Settings are initialized to defaults at startup, mutated only through a
//! validated settings update, and read by the voice bridge on every
//! capture/playback invocation. They are never persisted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Speech rate bounds, in words per minute.
pub const SPEECH_RATE_RANGE: (u32, u32) = (50, 300);
/// Recognition (initial silence) timeout bounds, in seconds.
pub const RECOGNITION_TIMEOUT_RANGE: (u32, u32) = (1, 10);
/// Phrase (end-of-phrase silence) timeout bounds, in seconds.
pub const PHRASE_TIMEOUT_RANGE: (u32, u32) = (1, 5);

/// A rejected settings update. The whole update is discarded when any field
/// is out of bounds, leaving prior settings intact.
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("speech_rate {0} out of bounds [50, 300] wpm")]
    SpeechRate(u32),
    #[error("speech_volume {0} out of bounds [0.0, 1.0]")]
    SpeechVolume(f64),
    #[error("recognition_timeout_secs {0} out of bounds [1, 10]")]
    RecognitionTimeout(u32),
    #[error("phrase_timeout_secs {0} out of bounds [1, 5]")]
    PhraseTimeout(u32),
}

/// Voice capture and playback tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Text-to-speech rate, words per minute.
    pub speech_rate: u32,
    /// Text-to-speech volume, fraction of full scale. `f64` so the JSON
    /// representation round-trips exactly (0.9 stays 0.9 on the wire).
    pub speech_volume: f64,
    /// Seconds of initial silence before a capture window gives up.
    pub recognition_timeout_secs: u32,
    /// Seconds of trailing silence that end a phrase.
    pub phrase_timeout_secs: u32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            speech_rate: 150,
            speech_volume: 0.9,
            recognition_timeout_secs: 5,
            phrase_timeout_secs: 2,
        }
    }
}

impl VoiceSettings {
    /// Validates every field against its bound.
    ///
    /// Returns the first violation found; callers reject the whole update on
    /// any `Err`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.speech_rate < SPEECH_RATE_RANGE.0 || self.speech_rate > SPEECH_RATE_RANGE.1 {
            return Err(SettingsError::SpeechRate(self.speech_rate));
        }
        if !(0.0..=1.0).contains(&self.speech_volume) || self.speech_volume.is_nan() {
            return Err(SettingsError::SpeechVolume(self.speech_volume));
        }
        if self.recognition_timeout_secs < RECOGNITION_TIMEOUT_RANGE.0
            || self.recognition_timeout_secs > RECOGNITION_TIMEOUT_RANGE.1
        {
            return Err(SettingsError::RecognitionTimeout(
                self.recognition_timeout_secs,
            ));
        }
        if self.phrase_timeout_secs < PHRASE_TIMEOUT_RANGE.0
            || self.phrase_timeout_secs > PHRASE_TIMEOUT_RANGE.1
        {
            return Err(SettingsError::PhraseTimeout(self.phrase_timeout_secs));
        }
        Ok(())
    }
}

/// A partial settings update. Omitted fields keep their current values;
/// the merged result is validated as a whole before anything is stored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VoiceSettingsPatch {
    pub speech_rate: Option<u32>,
    pub speech_volume: Option<f64>,
    pub recognition_timeout_secs: Option<u32>,
    pub phrase_timeout_secs: Option<u32>,
}

impl VoiceSettingsPatch {
    /// Merges the patch onto `current` and validates the result.
    ///
    /// All-or-nothing: any out-of-bounds field rejects the whole update and
    /// `current` is returned untouched by the caller.
    pub fn apply(&self, current: VoiceSettings) -> Result<VoiceSettings, SettingsError> {
        let merged = VoiceSettings {
            speech_rate: self.speech_rate.unwrap_or(current.speech_rate),
            speech_volume: self.speech_volume.unwrap_or(current.speech_volume),
            recognition_timeout_secs: self
                .recognition_timeout_secs
                .unwrap_or(current.recognition_timeout_secs),
            phrase_timeout_secs: self.phrase_timeout_secs.unwrap_or(current.phrase_timeout_secs),
        };
        merged.validate()?;
        Ok(merged)
    }
}
