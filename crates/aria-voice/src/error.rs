use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("audio capture unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("already listening")]
    AlreadyListening,

    #[error("no speech detected")]
    NoSpeechDetected,

    #[error("speech recognition failed: {0}")]
    RecognitionFailed(String),

    #[error("speech engine unavailable: {0}")]
    EngineUnavailable(String),
}
