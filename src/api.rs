//! HTTP API calls made before the realtime session opens.

use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize)]
struct CreateMeetingResponse {
    meeting_id: String,
}

/// Create a meeting and return its id, used as the session id for the
/// WebSocket endpoint.
pub async fn create_meeting(config: &Config) -> anyhow::Result<String> {
    let url = format!("{}/meetings", config.api_url.trim_end_matches('/'));
    tracing::info!(%url, "creating meeting");

    let client = Client::new();
    let resp = client.post(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("meeting creation failed: HTTP {}", resp.status());
    }

    let body: CreateMeetingResponse = resp.json().await?;
    Ok(body.meeting_id)
}
