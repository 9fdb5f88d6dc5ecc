//! Client for the broadcast service: persona listing, motion clip listings,
//! room liveness, session start/stop and the event archive.
//!
//! The core only talks to the `Backend` trait so tests can substitute a fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use avatar_proto::config::BackendConfig;
use avatar_proto::protocol::{Persona, SessionRef};
use avatar_proto::room::RoomId;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Answer of the room liveness check.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LiveStatus {
    pub is_live: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn list_personas(&self) -> Result<Vec<Persona>>;

    /// Raw clip listing for a persona.  Shape checking happens in the catalog.
    async fn clip_listing(&self, persona_id: &str) -> Result<Value>;

    async fn room_status(&self, room: &RoomId) -> Result<LiveStatus>;

    /// Returns the session token issued by the service.
    async fn start_session(&self, room: &RoomId, persona_id: &str) -> Result<String>;

    async fn stop_session(&self, session: &SessionRef) -> Result<()>;

    async fn archived_events(&self, session: &SessionRef, limit: u32) -> Result<Vec<Value>>;
}

#[derive(Serialize)]
struct StartRequest<'a> {
    room_id: &'a str,
    character_id: &'a str,
}

#[derive(Deserialize)]
struct StartResponse {
    session_id: Option<String>,
    detail: Option<String>,
}

#[derive(Serialize)]
struct StopRequest<'a> {
    room_id: &'a str,
    session_id: &'a str,
}

/// Error bodies from the service look like `{"detail": "..."}`.
#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<Value>,
}

pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid backend base URL {:?}", config.base_url))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("avatar-daemon/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Backend base URL cannot carry a path: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Turn a non-success response into an error carrying the service's
/// `detail` text when it sent one.
async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.detail)
        .map(|d| match d {
            Value::String(s) => s,
            other => other.to_string(),
        });
    match detail {
        Some(detail) => anyhow::bail!("{} failed ({}): {}", what, status, detail),
        None => anyhow::bail!("{} returned status: {}", what, status),
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_personas(&self) -> Result<Vec<Persona>> {
        let url = self.endpoint(&["character"])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch persona list")?;
        let personas: Option<Vec<Persona>> = ensure_success(response, "Persona list")
            .await?
            .json()
            .await
            .context("Failed to parse persona list")?;
        Ok(personas.unwrap_or_default())
    }

    async fn clip_listing(&self, persona_id: &str) -> Result<Value> {
        let url = self.endpoint(&[persona_id, "motion", "list.json"])?;
        debug!("backend: clip listing {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to fetch clip listing")?;
        ensure_success(response, "Clip listing")
            .await?
            .json()
            .await
            .context("Clip listing is not JSON")
    }

    async fn room_status(&self, room: &RoomId) -> Result<LiveStatus> {
        let url = self.endpoint(&["broadcast", "status"])?;
        let response = self
            .client
            .get(url)
            .query(&[("room_id", room.as_str())])
            .send()
            .await
            .context("Failed to reach broadcast status endpoint")?;
        ensure_success(response, "Broadcast status")
            .await?
            .json()
            .await
            .context("Failed to parse broadcast status")
    }

    async fn start_session(&self, room: &RoomId, persona_id: &str) -> Result<String> {
        let url = self.endpoint(&["broadcast", "start"])?;
        let response = self
            .client
            .post(url)
            .json(&StartRequest {
                room_id: room.as_str(),
                character_id: persona_id,
            })
            .send()
            .await
            .context("Failed to reach broadcast start endpoint")?;
        let body: StartResponse = ensure_success(response, "Broadcast start")
            .await?
            .json()
            .await
            .context("Failed to parse broadcast start response")?;
        match (body.session_id, body.detail) {
            (Some(id), _) if !id.is_empty() => Ok(id),
            (_, Some(detail)) => anyhow::bail!("Broadcast start refused: {}", detail),
            _ => anyhow::bail!("Broadcast start returned no session id"),
        }
    }

    async fn stop_session(&self, session: &SessionRef) -> Result<()> {
        let url = self.endpoint(&["broadcast", "stop"])?;
        let response = self
            .client
            .post(url)
            .json(&StopRequest {
                room_id: &session.room_id,
                session_id: &session.session_id,
            })
            .send()
            .await
            .context("Failed to reach broadcast stop endpoint")?;
        ensure_success(response, "Broadcast stop").await?;
        Ok(())
    }

    async fn archived_events(&self, session: &SessionRef, limit: u32) -> Result<Vec<Value>> {
        let url = self.endpoint(&["broadcast", "events"])?;
        let limit = limit.to_string();
        let response = self
            .client
            .get(url)
            .query(&[
                ("room_id", session.room_id.as_str()),
                ("session_id", session.session_id.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .context("Failed to fetch archived events")?;
        let body: Value = ensure_success(response, "Event archive")
            .await?
            .json()
            .await
            .context("Failed to parse archived events")?;
        Ok(archive_entries(body))
    }
}

/// The archive endpoint answers with a bare list or `{"events": [...]}`.
fn archive_entries(body: Value) -> Vec<Value> {
    match body {
        Value::Array(events) => events,
        Value::Object(mut obj) => match obj.remove("events") {
            Some(Value::Array(events)) => events,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(&BackendConfig {
            base_url: base.to_string(),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let b = backend("http://localhost:8000/");
        assert_eq!(
            b.endpoint(&["broadcast", "status"]).unwrap().as_str(),
            "http://localhost:8000/broadcast/status"
        );

        let b = backend("http://host/api");
        assert_eq!(
            b.endpoint(&["p 1", "motion", "list.json"]).unwrap().as_str(),
            "http://host/api/p%201/motion/list.json"
        );
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = BackendConfig {
            base_url: "not a url".into(),
            ..BackendConfig::default()
        };
        assert!(HttpBackend::new(&config).is_err());
    }

    #[test]
    fn test_archive_entries_accepts_both_shapes() {
        assert_eq!(archive_entries(json!([{"a": 1}])).len(), 1);
        assert_eq!(archive_entries(json!({"events": [{"a": 1}, {"b": 2}]})).len(), 2);
        assert!(archive_entries(json!({"detail": "nope"})).is_empty());
    }

    #[test]
    fn test_live_status_parses_detail() {
        let status: LiveStatus =
            serde_json::from_value(json!({"is_live": false, "detail": "offline"})).unwrap();
        assert!(!status.is_live);
        assert_eq!(status.detail.as_deref(), Some("offline"));
    }
}
