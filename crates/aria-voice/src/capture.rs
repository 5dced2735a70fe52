//! Microphone capture via an external recorder process.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::VoiceError;

/// Records one window of audio from the default input device.
///
/// The recorder is invoked arecord-style: 16 kHz mono s16le WAV written to
/// stdout, bounded by `-d <window_secs>`. A spawn failure means the capture
/// device (or binary) is missing.
pub(crate) async fn capture_window(
    binary: &Path,
    window_secs: u32,
) -> Result<Vec<u8>, VoiceError> {
    let child = Command::new(binary)
        .arg("-q")
        .arg("-f")
        .arg("S16_LE")
        .arg("-r")
        .arg("16000")
        .arg("-d")
        .arg(window_secs.to_string())
        .arg("-t")
        .arg("wav")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| VoiceError::DeviceUnavailable(format!("failed to spawn recorder: {e}")))?;

    // Generous margin over the recording window itself.
    let deadline = Duration::from_secs(u64::from(window_secs) + 10);
    let output = tokio::time::timeout(deadline, child.wait_with_output())
        .await
        .map_err(|_| {
            VoiceError::DeviceUnavailable(format!(
                "recorder did not finish within {} seconds",
                deadline.as_secs()
            ))
        })?
        .map_err(|e| VoiceError::DeviceUnavailable(format!("failed to read recorder output: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VoiceError::DeviceUnavailable(format!(
            "recorder exited with error: {stderr}"
        )));
    }

    Ok(output.stdout)
}
