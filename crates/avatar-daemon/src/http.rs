use crate::backend::Backend;
use crate::core::{PanelError, PanelEvent};
use crate::session::GateError;
use avatar_proto::protocol::{Command, LoggedEvent, PanelState, Persona};
use avatar_proto::state::StateManager;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<PanelEvent>,
    pub backend: Arc<dyn Backend>,
    pub archive_limit: u32,
    /// How long a handler waits for the core to answer a command.
    pub reply_timeout: Duration,
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/personas", get(get_personas))
        .route("/api/personas/reload", post(reload_personas))
        .route("/api/persona", delete(clear_persona))
        .route("/api/persona/:id", post(select_persona))
        .route("/api/room/:room_id/confirm", post(confirm_room))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/play/tag/:tag", post(play_tag))
        .route("/api/play/clip/:name", post(play_clip))
        .route("/api/display/ended", post(display_ended))
        .route("/api/display/ready", post(display_ready))
        .route("/api/catalog/reload", post(reload_catalog))
        .route("/api/events", get(get_events))
        .route("/api/events/archive", get(get_archive))
        // The browser overlay may be served from another origin
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Error body: `{"error": "..."}` with a status matching the failure.
enum ApiError {
    Panel(PanelError),
    NotFound(String),
    Unavailable,
}

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        ApiError::Panel(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Panel(PanelError::Gate(GateError::InvalidRoom(e))) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            ApiError::Panel(e @ PanelError::Gate(_)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Panel(e @ PanelError::Catalog(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Panel(e @ PanelError::Service(_)) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Panel core is not responding".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Hand a command to the core and wait for its answer.
async fn dispatch(state: &HttpState, cmd: Command) -> Result<Json<Value>, ApiError> {
    let (tx, rx) = oneshot::channel();
    state
        .event_tx
        .send(PanelEvent::Command {
            cmd,
            reply: Some(tx),
        })
        .await
        .map_err(|_| ApiError::Unavailable)?;

    match tokio::time::timeout(state.reply_timeout, rx).await {
        Ok(Ok(result)) => {
            result?;
            Ok(Json(json!({ "ok": true })))
        }
        Ok(Err(_)) => Err(ApiError::Unavailable),
        Err(_) => {
            warn!("HTTP API: command timed out after {:?}", state.reply_timeout);
            Err(ApiError::Unavailable)
        }
    }
}

async fn get_state(State(state): State<HttpState>) -> Json<PanelState> {
    Json(state.state_manager.get_state().await)
}

async fn get_personas(State(state): State<HttpState>) -> Json<Vec<Persona>> {
    Json(state.state_manager.get_state().await.personas)
}

async fn reload_personas(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::ReloadPersonas).await
}

async fn select_persona(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!("HTTP API: select persona {}", id);
    dispatch(
        &state,
        Command::SelectPersona {
            persona_id: Some(id),
        },
    )
    .await
}

async fn clear_persona(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::SelectPersona { persona_id: None }).await
}

async fn confirm_room(
    State(state): State<HttpState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!("HTTP API: confirm room {}", room_id);
    dispatch(&state, Command::ConfirmRoom { room_id }).await
}

async fn start(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    info!("HTTP API: start");
    dispatch(&state, Command::Start).await
}

async fn stop(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    info!("HTTP API: stop");
    dispatch(&state, Command::Stop).await
}

async fn play_tag(
    State(state): State<HttpState>,
    Path(tag): Path<String>,
) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::PlayTag { tag }).await
}

async fn play_clip(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::PlayClip { name }).await
}

/// `?url=` names the clip the overlay is reporting on.
#[derive(Deserialize)]
struct DisplayQuery {
    url: Option<String>,
}

async fn display_ended(
    State(state): State<HttpState>,
    Query(query): Query<DisplayQuery>,
) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::ClipEnded { url: query.url }).await
}

async fn display_ready(
    State(state): State<HttpState>,
    Query(query): Query<DisplayQuery>,
) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::ClipReady { url: query.url }).await
}

async fn reload_catalog(State(state): State<HttpState>) -> Result<Json<Value>, ApiError> {
    dispatch(&state, Command::ReloadCatalog).await
}

async fn get_events(State(state): State<HttpState>) -> Json<Vec<LoggedEvent>> {
    Json(state.state_manager.get_state().await.event_log)
}

#[derive(Deserialize)]
struct ArchiveQuery {
    limit: Option<u32>,
}

/// Archived events of the running session, or of the last one that ended.
async fn get_archive(
    State(state): State<HttpState>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let snapshot = state.state_manager.get_state().await;
    let session = match (snapshot.room_id, snapshot.session_token) {
        (Some(room_id), Some(session_id)) => avatar_proto::protocol::SessionRef {
            room_id,
            session_id,
        },
        _ => snapshot
            .last_session
            .ok_or_else(|| ApiError::NotFound("No session to fetch events for".into()))?,
    };

    let limit = query.limit.unwrap_or(state.archive_limit).max(1);
    match state.backend.archived_events(&session, limit).await {
        Ok(events) => Ok(Json(events)),
        Err(e) => {
            warn!("HTTP API: archive fetch failed: {:#}", e);
            Err(PanelError::Service(format!("{:#}", e)).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use avatar_proto::protocol::SessionRef;
    use avatar_proto::room::RoomIdError;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Api {
        app: Router,
        state_manager: Arc<StateManager>,
        _dir: tempfile::TempDir,
    }

    /// Router wired to a stand-in core that answers every command with
    /// whatever `answer` returns.
    fn api<F>(answer: F) -> Api
    where
        F: Fn(&Command) -> Result<(), PanelError> + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let state_manager = Arc::new(StateManager::new(dir.path().join("state.json")));
        let backend = FakeBackend::default();
        backend
            .archive
            .lock()
            .unwrap()
            .extend([json!({"type": "chat"}), json!({"type": "gift"}), json!({"type": "like"})]);

        let (event_tx, mut event_rx) = mpsc::channel::<PanelEvent>(8);
        tokio::spawn(async move {
            while let Some(evt) = event_rx.recv().await {
                if let PanelEvent::Command {
                    cmd,
                    reply: Some(reply),
                } = evt
                {
                    let _ = reply.send(answer(&cmd));
                }
            }
        });

        let app = router(HttpState {
            state_manager: state_manager.clone(),
            event_tx,
            backend: Arc::new(backend),
            archive_limit: 2,
            reply_timeout: Duration::from_secs(5),
        });
        Api {
            app,
            state_manager,
            _dir: dir,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_state_snapshot() {
        let api = api(|_| Ok(()));
        let (status, body) = call(&api.app, "GET", "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lifecycle"], "idle");
        assert_eq!(body["feed_status"], "disconnected");
    }

    #[tokio::test]
    async fn test_command_errors_map_to_status() {
        let api = api(|cmd| match cmd {
            Command::Start => Err(GateError::NoPersona.into()),
            Command::ConfirmRoom { .. } => Err(GateError::InvalidRoom(RoomIdError::InvalidChar('!')).into()),
            Command::PlayTag { .. } => Err(PanelError::Catalog(
                crate::catalog::CatalogError::NoPlayableClip("neutral".into()),
            )),
            Command::Stop => Err(PanelError::Service("Broadcast stop returned status: 500".into())),
            _ => Ok(()),
        });

        let (status, body) = call(&api.app, "POST", "/api/start").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "No persona selected");

        let (status, _) = call(&api.app, "POST", "/api/room/bad!/confirm").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&api.app, "POST", "/api/play/tag/neutral").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&api.app, "POST", "/api/stop").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, body) = call(&api.app, "POST", "/api/display/ended").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_display_reports_forward_clip_url() {
        let api = api(|cmd| match cmd {
            Command::ClipEnded { url } | Command::ClipReady { url } => {
                match url.as_deref() {
                    Some("http://m/a.mp4") => Ok(()),
                    other => Err(PanelError::Service(format!("got {:?}", other))),
                }
            }
            _ => Ok(()),
        });

        let uri = "/api/display/ready?url=http%3A%2F%2Fm%2Fa.mp4";
        let (status, _) = call(&api.app, "POST", uri).await;
        assert_eq!(status, StatusCode::OK);
        let uri = "/api/display/ended?url=http%3A%2F%2Fm%2Fa.mp4";
        let (status, _) = call(&api.app, "POST", uri).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&api.app, "POST", "/api/display/ended").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "got None");
    }

    #[tokio::test]
    async fn test_archive_uses_last_session() {
        let api = api(|_| Ok(()));
        let (status, body) = call(&api.app, "GET", "/api/events/archive").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("No session"));

        api.state_manager
            .publish(PanelState {
                last_session: Some(SessionRef {
                    room_id: "abc123".into(),
                    session_id: "s-1".into(),
                }),
                ..Default::default()
            })
            .await;

        let (status, body) = call(&api.app, "GET", "/api/events/archive").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = call(&api.app, "GET", "/api/events/archive?limit=10").await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }
}
