//! capture - microphone-to-PCM pipeline
//!
//! Pulls fixed-size blocks of float samples from the ALSA input device on a
//! dedicated real-time thread and converts them to signed 16-bit PCM, one
//! discrete frame per processing quantum.

mod device;
pub mod pcm;
mod worker;

pub use worker::{AudioFrame, CaptureWorker};
