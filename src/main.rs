use meetlink::api;
use meetlink::capture::{AudioFrame, CaptureWorker};
use meetlink::config::Config;
use meetlink::protocol::SessionState;
use meetlink::session::{SessionEvent, TransportSession};
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    // Meeting id from the command line, or create one via the API.
    let meeting_id = match std::env::args().nth(1) {
        Some(id) => id,
        None => api::create_meeting(&config).await?,
    };
    tracing::info!(%meeting_id, "starting session");

    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(100);
    let (frame_tx, mut frame_rx) = mpsc::channel::<AudioFrame>(100);

    let (session, handle) = TransportSession::new(&config, &meeting_id, event_tx)?;
    let session_task = tokio::spawn(session.run());

    let mut status_rx = handle.watch_status();
    let mut capture: Option<CaptureWorker> = None;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down...");
                break;
            }

            changed = status_rx.changed() => {
                if changed.is_err() {
                    break; // session task ended
                }
                let status = *status_rx.borrow_and_update();
                tracing::info!(state = ?status.state, can_record = status.can_record, "status");

                // The server gates capture: do not touch the microphone
                // until it asserts canRecord in the handshake.
                if status.state == SessionState::Connected
                    && status.can_record
                    && capture.is_none()
                {
                    match CaptureWorker::start(&config, frame_tx.clone()) {
                        Ok(worker) => capture = Some(worker),
                        Err(e) => tracing::error!("failed to start capture: {}", e),
                    }
                }
            }

            Some(frame) = frame_rx.recv() => {
                // The session drops frames while not connected; no value in
                // stale audio.
                handle.send_binary(frame.into_bytes()).await;
            }

            Some(event) = event_rx.recv() => {
                match event {
                    SessionEvent::Text(raw) => tracing::info!("transcript frame: {}", raw),
                    SessionEvent::Message(content) => tracing::info!("server message: {}", content),
                    SessionEvent::Latency(rtt) => {
                        tracing::debug!(rtt_ms = rtt.as_millis() as u64, "heartbeat latency");
                    }
                }
            }
        }
    }

    // Release the microphone on every exit path, then close the session
    // with the normal-closure code so it does not reconnect.
    if let Some(mut worker) = capture.take() {
        worker.stop();
    }
    handle.close().await;
    let _ = session_task.await;
    Ok(())
}
