//! External audio tooling paths.

use std::path::PathBuf;

/// Paths to the external binaries the bridge drives.
///
/// All three are configurable so deployments can substitute their own
/// tooling (and tests can substitute scripts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceBinaries {
    /// Microphone capture binary. Must accept `-q -f S16_LE -r 16000
    /// -d <secs> -t wav` and write WAV to stdout (arecord-compatible).
    pub capture_binary: PathBuf,

    /// Speech recognizer binary. Must accept `-m <model> -f -`, read audio
    /// from stdin, and write the transcript to stdout (whisper.cpp CLI
    /// compatible).
    pub recognizer_binary: PathBuf,

    /// Recognition model file passed to the recognizer via `-m`.
    pub recognizer_model: PathBuf,

    /// Speech synthesis binary. Must accept `-s <wpm> -a <amplitude>
    /// <text>` and play through the default output device
    /// (espeak-ng compatible).
    pub tts_binary: PathBuf,
}

impl Default for VoiceBinaries {
    fn default() -> Self {
        Self {
            capture_binary: PathBuf::from("arecord"),
            recognizer_binary: PathBuf::from("whisper-cli"),
            recognizer_model: PathBuf::from("models/ggml-base.en.bin"),
            tts_binary: PathBuf::from("espeak-ng"),
        }
    }
}
