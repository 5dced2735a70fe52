//! Voice infrastructure for the Aria server.
//!
//! Drives three external audio tools: a recorder for microphone capture, a
//! recognizer for speech-to-text, and a synthesis engine for spoken replies.
//! The `VoiceBridge` owns the process-wide listening/speaking state and
//! publishes every transition and transcript on a broadcast channel for the
//! server to fan out.

mod bridge;
mod capture;
pub mod config;
pub mod error;
mod recognizer;

pub use bridge::{VoiceBridge, VoiceEvent};
pub use config::VoiceBinaries;
pub use error::VoiceError;
pub use recognizer::Recognizer;
