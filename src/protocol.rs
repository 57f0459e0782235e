//! Wire protocol data model for the meeting session channel.
//!
//! Text frames carry JSON control/transcript messages; binary frames carry
//! raw 16-bit little-endian PCM with no extra framing (frame boundaries are
//! message boundaries).

use serde::{Deserialize, Serialize};

/// Application-level session state.
///
/// `Connecting` covers both the transport-level open and the
/// handshake-pending phase; only `Connected` permits binary sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Control messages the server sends as JSON text frames.
///
/// Frames with an unrecognized `type` (e.g. transcript payloads) are not
/// represented here; the session forwards them verbatim to the consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Heartbeat acknowledgment.
    Pong,
    /// Handshake acknowledgment and later server-declared state changes.
    ConnectionStatus {
        status: SessionState,
        #[serde(rename = "canRecord", default)]
        can_record: bool,
    },
    /// Opaque content forwarded to the consumer, not interpreted here.
    Message { content: String },
}

/// Control messages the client sends as JSON text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}
