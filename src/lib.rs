//! meetlink - realtime meeting-audio streaming client
//!
//! Captures microphone audio on a dedicated thread, converts it to 16 kHz
//! mono 16-bit PCM frames, and streams them over a self-healing WebSocket
//! session to a meeting-transcription service.

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
