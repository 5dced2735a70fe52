//! One-shot speech recognition via an external recognizer process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::VoiceError;

/// Maximum audio input size (10 MiB). Prevents OOM from oversized payloads.
const MAX_AUDIO_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for recognizer process execution.
const RECOGNIZER_TIMEOUT: Duration = Duration::from_secs(120);

/// Drives the external recognizer binary for one utterance at a time.
#[derive(Debug, Clone)]
pub struct Recognizer {
    binary_path: PathBuf,
    model_path: PathBuf,
}

impl Recognizer {
    pub fn new(binary_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
        }
    }

    /// Transcribes a recorded utterance.
    ///
    /// Audio is piped to the recognizer's stdin; the transcript is read from
    /// stdout. An empty transcript is `NoSpeechDetected`; any engine failure
    /// is `RecognitionFailed`.
    pub async fn transcribe(&self, audio_data: &[u8]) -> Result<String, VoiceError> {
        if audio_data.len() > MAX_AUDIO_INPUT_BYTES {
            return Err(VoiceError::RecognitionFailed(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                MAX_AUDIO_INPUT_BYTES
            )));
        }

        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoiceError::RecognitionFailed(format!("failed to spawn recognizer: {e}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::RecognitionFailed("failed to open stdin".to_string()))?;
        stdin
            .write_all(audio_data)
            .await
            .map_err(|e| VoiceError::RecognitionFailed(format!("failed to write audio: {e}")))?;
        drop(stdin); // close stdin to signal EOF

        let output = tokio::time::timeout(RECOGNIZER_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::RecognitionFailed(format!(
                    "recognizer timed out after {} seconds",
                    RECOGNIZER_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::RecognitionFailed(format!("failed to read output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::RecognitionFailed(format!(
                "recognizer exited with error: {stderr}"
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(VoiceError::NoSpeechDetected);
        }
        Ok(text)
    }
}
