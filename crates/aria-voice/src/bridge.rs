//! The voice bridge: process-wide listening/speaking state, the capture
//! loop, and speech playback.
//!
//! Listening and speaking are process-wide flags because the bridge drives
//! one microphone and one audio output. Every state transition and every
//! recognized transcript is published on a broadcast channel so the server
//! can fan events out to all connected sessions.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aria_types::VoiceSettings;
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::capture;
use crate::config::VoiceBinaries;
use crate::error::VoiceError;
use crate::recognizer::Recognizer;

/// Broadcast capacity for voice events. Laggy subscribers drop old events.
const EVENT_CAPACITY: usize = 64;

/// A state transition or transcript from the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    ListeningChanged(bool),
    SpeakingChanged(bool),
    /// Recognized speech from the capture loop.
    Transcript(String),
}

struct Playback {
    kill: oneshot::Sender<()>,
    done: JoinHandle<()>,
}

/// Process-wide voice state.
///
/// Single-tenant by design: one microphone, one speaker, shared by every
/// connected session.
pub struct VoiceBridge {
    binaries: VoiceBinaries,
    listening: AtomicBool,
    speaking: AtomicBool,
    events: broadcast::Sender<VoiceEvent>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    playback: Mutex<Option<Playback>>,
}

impl VoiceBridge {
    pub fn new(binaries: VoiceBinaries) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            binaries,
            listening: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            events,
            capture_task: Mutex::new(None),
            playback: Mutex::new(None),
        }
    }

    /// Subscribes to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Whether the capture and synthesis binaries resolve to real files or
    /// names on PATH. Used by the health endpoint.
    pub fn binaries_resolvable(&self) -> bool {
        let resolvable = |path: &std::path::Path| {
            path.exists()
                || std::env::var_os("PATH").is_some_and(|paths| {
                    std::env::split_paths(&paths).any(|dir| dir.join(path).exists())
                })
        };
        resolvable(&self.binaries.capture_binary) && resolvable(&self.binaries.tts_binary)
    }

    fn publish(&self, event: VoiceEvent) {
        // No receivers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    /// Starts the capture loop.
    ///
    /// Fails with `AlreadyListening` if a loop is already running, and with
    /// `DeviceUnavailable` if the recorder cannot produce audio. The
    /// calibration pass happens before the listening transition is announced,
    /// so a failed start leaves the flag untouched and publishes nothing.
    pub async fn start_listening(
        self: &Arc<Self>,
        settings: VoiceSettings,
    ) -> Result<(), VoiceError> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VoiceError::AlreadyListening);
        }

        // Ambient-noise calibration pass; also proves the capture device
        // works before we announce the transition.
        if let Err(e) = capture::capture_window(&self.binaries.capture_binary, 1).await {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.publish(VoiceEvent::ListeningChanged(true));
        tracing::info!("voice capture started");

        let bridge = Arc::clone(self);
        let handle = tokio::spawn(async move { bridge.capture_loop(settings).await });
        *self.capture_task.lock().await = Some(handle);
        Ok(())
    }

    /// Stops the capture loop. Idempotent: stopping while not listening is
    /// a no-op.
    pub async fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.capture_task.lock().await.take() {
            handle.abort();
        }
        self.publish(VoiceEvent::ListeningChanged(false));
        tracing::info!("voice capture stopped");
    }

    async fn capture_loop(self: Arc<Self>, settings: VoiceSettings) {
        let recognizer = Recognizer::new(
            &self.binaries.recognizer_binary,
            &self.binaries.recognizer_model,
        );
        // Window: time allowed for a phrase to start, plus its tail.
        let window_secs = settings.recognition_timeout_secs + settings.phrase_timeout_secs;

        while self.listening.load(Ordering::SeqCst) {
            let audio =
                match capture::capture_window(&self.binaries.capture_binary, window_secs).await {
                    Ok(audio) => audio,
                    Err(e) => {
                        tracing::warn!(error = %e, "audio capture failed, stopping listener");
                        break;
                    }
                };

            if !self.listening.load(Ordering::SeqCst) {
                break;
            }

            match recognizer.transcribe(&audio).await {
                Ok(text) => {
                    tracing::debug!(chars = text.len(), "recognized speech");
                    self.publish(VoiceEvent::Transcript(text));
                }
                Err(VoiceError::NoSpeechDetected) => {}
                Err(e) => tracing::warn!(error = %e, "speech recognition failed"),
            }
        }

        if self.listening.swap(false, Ordering::SeqCst) {
            self.publish(VoiceEvent::ListeningChanged(false));
        }
    }

    /// Speaks `text` through the synthesis engine.
    ///
    /// With `interrupt`, any current playback is killed first and its
    /// speaking=false transition is published before the new speaking=true.
    /// Without it, the call waits for current playback to finish. Returns
    /// once playback has started; completion is reported via the event
    /// stream.
    pub async fn speak(
        self: &Arc<Self>,
        text: &str,
        interrupt: bool,
        settings: &VoiceSettings,
    ) -> Result<(), VoiceError> {
        let mut slot = self.playback.lock().await;

        if let Some(playback) = slot.take() {
            if interrupt {
                let _ = playback.kill.send(());
            }
            // The monitor publishes speaking=false on its way out.
            let _ = playback.done.await;
        }

        // espeak-ng amplitude is 0..=200 with 100 as the nominal level.
        let amplitude = (settings.speech_volume * 100.0).round() as u32;
        let mut child = Command::new(&self.binaries.tts_binary)
            .arg("-s")
            .arg(settings.speech_rate.to_string())
            .arg("-a")
            .arg(amplitude.to_string())
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoiceError::EngineUnavailable(format!("failed to spawn speech engine: {e}"))
            })?;

        self.speaking.store(true, Ordering::SeqCst);
        self.publish(VoiceEvent::SpeakingChanged(true));

        let (kill_tx, kill_rx) = oneshot::channel();
        let bridge = Arc::clone(self);
        let done = tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = kill_rx => {
                    let _ = child.kill().await;
                }
            }
            bridge.speaking.store(false, Ordering::SeqCst);
            bridge.publish(VoiceEvent::SpeakingChanged(false));
        });

        *slot = Some(Playback {
            kill: kill_tx,
            done,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create script");
        writeln!(file, "#!/bin/sh\n{body}").expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    fn test_settings() -> VoiceSettings {
        VoiceSettings {
            speech_rate: 150,
            speech_volume: 0.9,
            recognition_timeout_secs: 1,
            phrase_timeout_secs: 1,
        }
    }

    fn bridge_with(dir: &TempDir, capture_body: &str, recognizer_body: &str) -> Arc<VoiceBridge> {
        Arc::new(VoiceBridge::new(VoiceBinaries {
            capture_binary: write_script(dir, "capture.sh", capture_body),
            recognizer_binary: write_script(dir, "recognizer.sh", recognizer_body),
            recognizer_model: PathBuf::from("unused-model"),
            tts_binary: write_script(dir, "tts.sh", "sleep 5"),
        }))
    }

    async fn next_event(rx: &mut broadcast::Receiver<VoiceEvent>) -> VoiceEvent {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for voice event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn double_start_is_already_listening() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_with(&dir, "echo fake-audio", "cat > /dev/null");

        bridge
            .start_listening(test_settings())
            .await
            .expect("first start should succeed");
        assert!(bridge.is_listening());

        let err = bridge
            .start_listening(test_settings())
            .await
            .expect_err("second start must fail");
        assert!(matches!(err, VoiceError::AlreadyListening));
        assert!(bridge.is_listening(), "flag stays set after rejected start");

        bridge.stop_listening().await;
        assert!(!bridge.is_listening());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_with(&dir, "echo fake-audio", "cat > /dev/null");

        bridge.stop_listening().await;

        bridge
            .start_listening(test_settings())
            .await
            .expect("start should succeed");
        bridge.stop_listening().await;
        bridge.stop_listening().await;
        assert!(!bridge.is_listening());
    }

    #[tokio::test]
    async fn missing_recorder_is_device_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = Arc::new(VoiceBridge::new(VoiceBinaries {
            capture_binary: PathBuf::from("/nonexistent/recorder"),
            recognizer_binary: PathBuf::from("/nonexistent/recognizer"),
            recognizer_model: PathBuf::from("unused-model"),
            tts_binary: write_script(&dir, "tts.sh", "exit 0"),
        }));
        let mut events = bridge.subscribe();

        let err = bridge
            .start_listening(test_settings())
            .await
            .expect_err("missing recorder must fail");
        assert!(matches!(err, VoiceError::DeviceUnavailable(_)));
        assert!(!bridge.is_listening(), "failed start leaves flag clear");
        assert!(
            events.try_recv().is_err(),
            "failed start publishes no events"
        );
    }

    #[tokio::test]
    async fn capture_loop_publishes_transcripts() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_with(
            &dir,
            "echo fake-audio",
            "cat > /dev/null\necho 'turn on the lights'",
        );
        let mut events = bridge.subscribe();

        bridge
            .start_listening(test_settings())
            .await
            .expect("start should succeed");

        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::ListeningChanged(true)
        );
        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::Transcript("turn on the lights".to_string())
        );

        bridge.stop_listening().await;
    }

    #[tokio::test]
    async fn interrupt_publishes_false_before_new_true() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = bridge_with(&dir, "echo fake-audio", "cat > /dev/null");
        let mut events = bridge.subscribe();
        let settings = test_settings();

        bridge
            .speak("first utterance", false, &settings)
            .await
            .expect("first speak should start");
        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::SpeakingChanged(true)
        );
        assert!(bridge.is_speaking());

        bridge
            .speak("second utterance", true, &settings)
            .await
            .expect("interrupting speak should start");
        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::SpeakingChanged(false),
            "interrupted playback must report speaking=false first"
        );
        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::SpeakingChanged(true)
        );
    }

    #[tokio::test]
    async fn missing_engine_is_engine_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = Arc::new(VoiceBridge::new(VoiceBinaries {
            capture_binary: write_script(&dir, "capture.sh", "exit 0"),
            recognizer_binary: write_script(&dir, "recognizer.sh", "exit 0"),
            recognizer_model: PathBuf::from("unused-model"),
            tts_binary: PathBuf::from("/nonexistent/engine"),
        }));

        let err = bridge
            .speak("hello", false, &test_settings())
            .await
            .expect_err("missing engine must fail");
        assert!(matches!(err, VoiceError::EngineUnavailable(_)));
        assert!(!bridge.is_speaking());
    }

    #[tokio::test]
    async fn natural_finish_publishes_speaking_false() {
        let dir = TempDir::new().expect("tempdir");
        let bridge = Arc::new(VoiceBridge::new(VoiceBinaries {
            capture_binary: write_script(&dir, "capture.sh", "exit 0"),
            recognizer_binary: write_script(&dir, "recognizer.sh", "exit 0"),
            recognizer_model: PathBuf::from("unused-model"),
            tts_binary: write_script(&dir, "tts.sh", "exit 0"),
        }));
        let mut events = bridge.subscribe();

        bridge
            .speak("short", false, &test_settings())
            .await
            .expect("speak should start");

        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::SpeakingChanged(true)
        );
        assert_eq!(
            next_event(&mut events).await,
            VoiceEvent::SpeakingChanged(false)
        );
        assert!(!bridge.is_speaking());
    }
}
