//! TransportSession: one logical meeting session over a self-healing
//! WebSocket.
//!
//! The session is a single owned task. All state transitions happen inside
//! its `select!` loop on discrete events (socket message, command, timer
//! fire), so `SessionState`, the heartbeat, and the reconnect counter never
//! see concurrent mutation. Consumers talk to it through a cloneable
//! [`SessionHandle`] and observe it through a watch channel plus an event
//! stream. Dropping every handle (or calling `close`) ends the task, and
//! with it every pending timer.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::config::Config;
use crate::error::ConfigError;
use crate::protocol::{ClientMessage, ServerMessage, SessionState};

/// Timing and retry knobs. The defaults are the production protocol
/// constants; tests inject shorter ones.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// How long an unanswered ping may stay outstanding before the link
    /// is declared dead.
    pub pong_timeout: Duration,
    /// Base reconnect delay, grown by `backoff_factor` per attempt.
    pub backoff_base: Duration,
    /// Multiplier applied per failed attempt.
    pub backoff_factor: f64,
    /// Upper bound on a single reconnect delay.
    pub backoff_cap: Duration,
    /// Reconnect attempts before the session parks and waits for a manual
    /// reconnect.
    pub max_reconnect_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(1000),
            backoff_factor: 1.5,
            backoff_cap: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
        }
    }
}

/// Snapshot of the session published through the watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Server-asserted capture permission from the handshake
    /// acknowledgment. Consumers must not start capture until this is
    /// observed true.
    pub can_record: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Connecting,
            can_record: false,
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    SendBinary(Bytes),
    SendControl(Value),
    /// Manual reconnect trigger: resets the attempt counter and, if
    /// disconnected, connects immediately instead of waiting out a stale
    /// backoff.
    Reconnect,
    Close,
}

/// Inbound traffic the transport does not interpret, surfaced to the
/// consumer in network-delivery order.
#[derive(Debug)]
pub enum SessionEvent {
    /// Well-formed JSON text frame with an unrecognized type (e.g.
    /// transcript payloads), forwarded verbatim.
    Text(String),
    /// Content of a `{"type":"message"}` frame.
    Message(String),
    /// Measured heartbeat round-trip time.
    Latency(Duration),
}

/// Cloneable front end for a running [`TransportSession`].
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// A fresh receiver for status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Queue one audio frame. The session transmits it only while
    /// `Connected`; otherwise the frame is dropped with a warning. Stale
    /// audio has no value, so nothing is buffered.
    pub async fn send_binary(&self, frame: Bytes) {
        self.send(SessionCommand::SendBinary(frame)).await;
    }

    /// Send a JSON control message. `"ping"`-typed messages are routed
    /// through the heartbeat path instead of being sent twice.
    pub async fn send_control(&self, message: Value) {
        self.send(SessionCommand::SendControl(message)).await;
    }

    /// Manual reconnect. Environment recovery signals (the app coming back
    /// to the foreground, the network link coming back up) should call this
    /// so recovery bypasses any exponential backoff in progress.
    pub async fn reconnect(&self) {
        self.send(SessionCommand::Reconnect).await;
    }

    /// Deliberate teardown with a normal-closure code; the session will not
    /// reconnect afterwards.
    pub async fn close(&self) {
        self.send(SessionCommand::Close).await;
    }

    async fn send(&self, cmd: SessionCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            tracing::debug!("session task gone, command dropped");
        }
    }
}

enum LinkExit {
    /// Deliberate shutdown; do not reconnect.
    Closed,
    /// Transport or liveness failure; recoverable via reconnection.
    Lost(anyhow::Error),
    /// Manual reconnect while the link is not usable: drop the transport
    /// and re-open immediately, no backoff.
    Reopen,
}

/// The connection-session manager. Owns the socket exclusively; nothing
/// else may send on or close it.
pub struct TransportSession {
    url: Url,
    opts: SessionOptions,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    status: SessionStatus,
    attempts: u32,
}

impl TransportSession {
    /// Build a session for `<ws-base>/ws/meetings/<session_id>`.
    ///
    /// Fails fast with `ConfigError` if the endpoint base does not form a
    /// valid URL. Nothing connects until [`run`](Self::run) is awaited.
    pub fn new(
        config: &Config,
        session_id: &str,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<(Self, SessionHandle), ConfigError> {
        Self::with_options(config, session_id, event_tx, SessionOptions::default())
    }

    pub fn with_options(
        config: &Config,
        session_id: &str,
        event_tx: mpsc::Sender<SessionEvent>,
        opts: SessionOptions,
    ) -> Result<(Self, SessionHandle), ConfigError> {
        let raw = format!(
            "{}/ws/meetings/{}",
            config.ws_url.trim_end_matches('/'),
            session_id
        );
        let url = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { url: raw, source })?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let session = Self {
            url,
            opts,
            cmd_rx,
            event_tx,
            status_tx,
            status: SessionStatus::default(),
            attempts: 0,
        };
        let handle = SessionHandle { cmd_tx, status_rx };
        Ok((session, handle))
    }

    /// Drive the session until it is deliberately closed or permanently
    /// out of reconnect attempts with no handle left to revive it.
    pub async fn run(mut self) {
        loop {
            match self.connect_and_run().await {
                LinkExit::Closed => break,
                LinkExit::Reopen => {
                    self.set_status(SessionState::Disconnected, false);
                    continue;
                }
                LinkExit::Lost(e) => {
                    tracing::warn!("session link lost: {}", e);
                }
            }
            self.set_status(SessionState::Disconnected, false);

            if self.attempts >= self.opts.max_reconnect_attempts {
                tracing::warn!(
                    attempts = self.attempts,
                    "reconnect attempts exhausted, waiting for manual reconnect"
                );
                if !self.park_until_reconnect().await {
                    break;
                }
            } else {
                let delay = backoff_delay(self.attempts, &self.opts);
                self.attempts += 1;
                tracing::info!(
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after backoff"
                );
                if !self.wait_backoff(delay).await {
                    break;
                }
            }
        }
        self.set_status(SessionState::Disconnected, false);
    }

    /// One transport connection: open, handshake, then the event loop.
    async fn connect_and_run(&mut self) -> LinkExit {
        self.set_status(SessionState::Connecting, false);

        let (ws_stream, _) = match connect_async(self.url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => return LinkExit::Lost(e.into()),
        };
        tracing::debug!(url = %self.url, "transport open, awaiting handshake");

        let (mut write, mut read) = ws_stream.split();

        // A successful network-level open does not mean the server has the
        // session ready; stay in Connecting until it acknowledges with a
        // connection_status message. The immediate ping doubles as the
        // liveness probe for that handshake.
        let mut ping_sent_at: Option<std::time::Instant> = None;
        let mut pong_deadline: Option<Instant> = None;
        if let Err(e) = self
            .send_ping(&mut write, &mut ping_sent_at, &mut pong_deadline)
            .await
        {
            return LinkExit::Lost(e);
        }

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.opts.heartbeat_interval,
            self.opts.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // A transport that opens but never completes the handshake is as
        // dead as one that drops pongs; give it the same window.
        let mut handshake_deadline = Some(Instant::now() + self.opts.pong_timeout);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(exit) = self.dispatch_text(
                                text.as_str(),
                                &mut ping_sent_at,
                                &mut pong_deadline,
                            ).await {
                                return exit;
                            }
                            if self.status.state == SessionState::Connected {
                                handshake_deadline = None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let normal = frame
                                .as_ref()
                                .map(|f| f.code == CloseCode::Normal)
                                .unwrap_or(false);
                            if normal {
                                tracing::info!("server closed session normally");
                                return LinkExit::Closed;
                            }
                            return LinkExit::Lost(anyhow::anyhow!(
                                "abnormal close: {:?}", frame
                            ));
                        }
                        Some(Ok(_)) => {} // ws-level ping/pong/binary
                        Some(Err(e)) => return LinkExit::Lost(e.into()),
                        None => return LinkExit::Lost(anyhow::anyhow!("connection closed")),
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::SendBinary(data)) => {
                            if self.status.state == SessionState::Connected {
                                if let Err(e) = write.send(Message::Binary(data)).await {
                                    return LinkExit::Lost(e.into());
                                }
                            } else {
                                tracing::warn!("dropping audio frame, session not connected");
                            }
                        }
                        Some(SessionCommand::SendControl(value)) => {
                            if value.get("type").and_then(Value::as_str) == Some("ping") {
                                if let Err(e) = self
                                    .send_ping(&mut write, &mut ping_sent_at, &mut pong_deadline)
                                    .await
                                {
                                    return LinkExit::Lost(e);
                                }
                            } else if let Err(e) =
                                write.send(Message::Text(value.to_string().into())).await
                            {
                                return LinkExit::Lost(e.into());
                            }
                        }
                        Some(SessionCommand::Reconnect) => {
                            self.attempts = 0;
                            if self.status.state != SessionState::Connected {
                                // The transport is up but the session is not
                                // usable. A fresh connection is the only way
                                // to get a new handshake.
                                tracing::info!("manual reconnect, reopening transport");
                                return LinkExit::Reopen;
                            }
                        }
                        Some(SessionCommand::Close) | None => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client shutdown".into(),
                                })))
                                .await;
                            tracing::info!("session closed");
                            return LinkExit::Closed;
                        }
                    }
                }

                _ = heartbeat.tick(), if self.status.state == SessionState::Connected => {
                    if let Err(e) = self
                        .send_ping(&mut write, &mut ping_sent_at, &mut pong_deadline)
                        .await
                    {
                        return LinkExit::Lost(e);
                    }
                }

                _ = tokio::time::sleep_until(deadline_or_far(pong_deadline)),
                    if pong_deadline.is_some() =>
                {
                    return LinkExit::Lost(anyhow::anyhow!(
                        "heartbeat timed out after {:?}", self.opts.pong_timeout
                    ));
                }

                _ = tokio::time::sleep_until(deadline_or_far(handshake_deadline)),
                    if handshake_deadline.is_some() =>
                {
                    return LinkExit::Lost(anyhow::anyhow!(
                        "handshake timed out after {:?}", self.opts.pong_timeout
                    ));
                }
            }
        }
    }

    /// Inbound text dispatch. Malformed frames are ignored; unrecognized
    /// types are forwarded to the consumer untouched. Returns an exit when
    /// the frame invalidates the link itself.
    async fn dispatch_text(
        &mut self,
        text: &str,
        ping_sent_at: &mut Option<std::time::Instant>,
        pong_deadline: &mut Option<Instant>,
    ) -> Option<LinkExit> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("ignoring non-JSON text frame: {}", e);
                return None;
            }
        };

        match serde_json::from_value::<ServerMessage>(value) {
            Ok(ServerMessage::Pong) => {
                *pong_deadline = None;
                if let Some(sent_at) = ping_sent_at.take() {
                    let rtt = sent_at.elapsed();
                    tracing::debug!(rtt_ms = rtt.as_millis() as u64, "pong");
                    let _ = self.event_tx.send(SessionEvent::Latency(rtt)).await;
                }
            }
            Ok(ServerMessage::ConnectionStatus { status, can_record }) => {
                if status == SessionState::Connected
                    && self.status.state != SessionState::Connected
                {
                    tracing::info!(can_record, "session acknowledged by server");
                    self.attempts = 0;
                }
                self.set_status(status, can_record);
                if status == SessionState::Disconnected {
                    // The server has given up on this session; the socket is
                    // of no further use.
                    return Some(LinkExit::Lost(anyhow::anyhow!(
                        "server declared session disconnected"
                    )));
                }
            }
            Ok(ServerMessage::Message { content }) => {
                let _ = self.event_tx.send(SessionEvent::Message(content)).await;
            }
            Err(_) => {
                // Transcript payloads and anything this transport does not
                // understand belong to the presentation layer.
                let _ = self
                    .event_tx
                    .send(SessionEvent::Text(text.to_string()))
                    .await;
            }
        }
        None
    }

    async fn send_ping<S>(
        &mut self,
        write: &mut S,
        ping_sent_at: &mut Option<std::time::Instant>,
        pong_deadline: &mut Option<Instant>,
    ) -> anyhow::Result<()>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let frame = serde_json::to_string(&ClientMessage::Ping)?;
        write.send(Message::Text(frame.into())).await?;
        *ping_sent_at = Some(std::time::Instant::now());
        // Re-arming replaces any previous deadline, so exactly one timeout
        // is pending at a time.
        *pong_deadline = Some(Instant::now() + self.opts.pong_timeout);
        Ok(())
    }

    /// Sleep out one backoff delay while still servicing commands.
    /// Returns false when a deliberate close ends the session.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.cmd_rx.recv() => {
                    if !self.handle_offline_command(cmd) {
                        return false;
                    }
                    if self.attempts == 0 {
                        // Manual reconnect: skip the rest of the backoff.
                        return true;
                    }
                }
            }
        }
    }

    /// Attempts are exhausted; only a manual reconnect (or teardown) gets
    /// the session moving again. Returns false on deliberate close.
    async fn park_until_reconnect(&mut self) -> bool {
        loop {
            let cmd = self.cmd_rx.recv().await;
            if !self.handle_offline_command(cmd) {
                return false;
            }
            if self.attempts == 0 {
                return true;
            }
        }
    }

    /// Command handling while no transport exists. Returns false when the
    /// session should end.
    fn handle_offline_command(&mut self, cmd: Option<SessionCommand>) -> bool {
        match cmd {
            Some(SessionCommand::Reconnect) => {
                tracing::info!("manual reconnect requested");
                self.attempts = 0;
                true
            }
            Some(SessionCommand::SendBinary(_)) => {
                tracing::warn!("dropping audio frame, session not connected");
                true
            }
            Some(SessionCommand::SendControl(_)) => {
                tracing::warn!("dropping control message, session not connected");
                true
            }
            Some(SessionCommand::Close) | None => false,
        }
    }

    fn set_status(&mut self, state: SessionState, can_record: bool) {
        let next = SessionStatus { state, can_record };
        if next != self.status {
            tracing::info!(?state, can_record, "session status");
            self.status = next;
            let _ = self.status_tx.send(next);
        }
    }
}

fn backoff_delay(attempt: u32, opts: &SessionOptions) -> Duration {
    let ms = opts.backoff_base.as_millis() as f64 * opts.backoff_factor.powi(attempt as i32);
    Duration::from_millis((ms as u64).min(opts.backoff_cap.as_millis() as u64))
}

fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}
