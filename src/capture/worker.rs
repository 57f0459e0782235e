//! The capture worker: a dedicated OS thread that turns microphone input
//! into discrete PCM frames.
//!
//! Uses std::thread (NOT a tokio task) for real-time audio I/O to avoid
//! contention with async network tasks. One device period in, one
//! `AudioFrame` out; the thread never waits on the consumer, a lagging
//! receiver loses frames instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::device::{self, CaptureParams};
use super::pcm;
use crate::config::Config;
use crate::error::CaptureError;

/// One immutable block of signed 16-bit little-endian PCM samples, mono,
/// produced once per processing quantum. Ownership transfers to the
/// consumer on delivery; dropped frames are acceptable for a live stream.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    fn from_samples(samples: &[f32]) -> Self {
        Self {
            data: Bytes::from(pcm::quantum_to_bytes(samples)),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Handle to the capture thread.
///
/// `start` acquires the device before returning, so a missing or busy
/// microphone fails the call instead of a background thread. Once started,
/// the owner must `stop()` on every exit path; `Drop` backstops that so the
/// OS microphone indicator always clears.
pub struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Open the capture device and start emitting frames on `frame_tx`.
    ///
    /// Device errors are terminal for this attempt and returned to the
    /// caller; there is no automatic retry.
    pub fn start(config: &Config, frame_tx: mpsc::Sender<AudioFrame>) -> Result<Self, CaptureError> {
        let running = Arc::new(AtomicBool::new(true));

        // The device is opened on the capture thread (ALSA handles stay
        // where they are used), but `start` blocks until the open result
        // comes back so acquisition failures surface here.
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<CaptureParams, CaptureError>>();

        let device_name = config.capture_device.clone();
        let sample_rate = config.sample_rate;
        let channels = config.channels;
        let period_size = config.period_size;

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    let (pcm, params) =
                        match device::open_capture(&device_name, sample_rate, channels, period_size)
                        {
                            Ok(opened) => {
                                let _ = ready_tx.send(Ok(opened.1.clone()));
                                opened
                            }
                            Err(e) => {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        };
                    capture_loop(&pcm, &params, frame_tx, &running);
                })
                .map_err(CaptureError::ThreadSpawn)?
        };

        match ready_rx.recv() {
            Ok(Ok(params)) => {
                tracing::info!(
                    rate = params.sample_rate,
                    channels = params.channels,
                    quantum = params.period_size,
                    "capture started"
                );
                Ok(Self {
                    running,
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                // Thread died before reporting; treat as a spawn failure.
                let _ = handle.join();
                Err(CaptureError::ThreadSpawn(std::io::Error::other(
                    "capture thread exited before opening the device",
                )))
            }
        }
    }

    /// Signal the thread to stop and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
            tracing::info!("capture stopped");
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    pcm: &PCM,
    params: &CaptureParams,
    frame_tx: mpsc::Sender<AudioFrame>,
    running: &AtomicBool,
) {
    let io = match pcm.io_f32() {
        Ok(io) => io,
        Err(e) => {
            tracing::error!("failed to map capture I/O: {}", e);
            return;
        }
    };

    // One period of interleaved f32 samples, reused across quanta.
    let mut read_buf = vec![0f32; params.period_size * params.channels as usize];

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                if frames == 0 {
                    continue;
                }
                let frame =
                    AudioFrame::from_samples(&read_buf[..frames * params.channels as usize]);
                if !deliver_frame(&frame_tx, frame) {
                    return;
                }
            }
            Err(e) => {
                // A failed read aborts only this quantum, not the stream.
                tracing::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    tracing::error!("failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }
}

/// Hand one frame to the consumer without ever parking the capture thread.
/// A full channel drops the frame (live audio, no backpressure); a closed
/// channel ends the stream. Returns whether capture should continue.
fn deliver_frame(frame_tx: &mpsc::Sender<AudioFrame>, frame: AudioFrame) -> bool {
    match frame_tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("frame consumer lagging, dropping quantum");
            true
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!("frame receiver dropped, stopping capture");
            false
        }
    }
}
