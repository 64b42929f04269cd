//! HTTP control plane for dispatchd.
//!
//! Local-only REST API over the dispatcher, execution logs, and app profiles,
//! plus an SSE stream of UI events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use dispatch_core::{AppProfile, Credentials, Id, Invocation, UiEvent};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::dispatch::{DispatchError, Dispatcher, ScriptRequest};
use crate::events::{DiscardLines, EventBus};
use crate::storage::{Storage, StorageError};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Arc<Storage>,
    pub events: EventBus,
    pub auth_token: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/commands", post(run_command))
        .route("/commands/line", post(run_command_line))
        .route("/executions", post(start_execution).get(list_executions))
        .route("/executions/cancel", post(cancel_latest))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/scripts/dispatch", post(dispatch_script))
        .route("/events", get(stream_events))
        .route("/logs", get(list_logs).delete(clear_logs))
        .route("/logs/{id}", get(get_log).delete(delete_log))
        .route("/apps", get(list_apps).post(create_app))
        .route(
            "/apps/{id}",
            get(get_app).put(update_app).delete(delete_app),
        )
        .route("/cli/installed", get(cli_installed))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Start the HTTP server and serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state).layer(TraceLayer::new_for_http());

    // Never expose the API beyond the local machine.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(context: &str, err: &StorageError) -> ApiError {
    match err {
        StorageError::LogNotFound(_) | StorageError::AppNotFound(_) => {
            warn!("{}: {}", context, err);
            api_error(StatusCode::NOT_FOUND, err.to_string())
        }
        _ => {
            error!("{}: {}", context, err);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{context}: {err}"),
            )
        }
    }
}

fn dispatch_error(err: &DispatchError) -> ApiError {
    match err {
        DispatchError::Storage(inner) => storage_error("dispatch failed", inner),
        DispatchError::ReadScript { .. } => {
            warn!("dispatch failed: {}", err);
            api_error(StatusCode::NOT_FOUND, err.to_string())
        }
        DispatchError::InvalidScriptPath(_) | DispatchError::EmptyCommand => {
            warn!("rejected request: {}", err);
            api_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        DispatchError::WriteScript { .. } => {
            error!("dispatch failed: {}", err);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Request body for POST /commands/line.
#[derive(Debug, Deserialize)]
pub struct CommandLineRequest {
    pub line: String,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
}

/// Response for POST /executions.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub execution_id: Id,
}

/// Response for GET /executions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub running: Vec<Id>,
}

/// Response for the cancel endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Query params for GET/DELETE /logs.
#[derive(Debug, Deserialize, Default)]
pub struct LogsQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Response for DELETE /logs.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearLogsResponse {
    pub removed: u64,
}

/// Query params for GET /events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Only forward events for this execution.
    #[serde(default)]
    pub execution_id: Option<Id>,
}

/// Request body for POST /apps and PUT /apps/{id}.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppRequest {
    pub name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub token_id: String,
    /// Left empty on update to keep the stored secret.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub suffix: String,
}

/// Placeholder returned instead of a stored token secret.
pub const REDACTED_SECRET: &str = "********";

fn redact(mut app: AppProfile) -> AppProfile {
    if !app.token_secret.is_empty() {
        app.token_secret = REDACTED_SECRET.to_string();
    }
    app
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /commands - Run one invocation to completion.
async fn run_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(invocation): Json<Invocation>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let result = state.dispatcher.runner().run(invocation).await;
    Ok(Json(result))
}

/// POST /commands/line - Quick action from a free-form command line.
async fn run_command_line(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CommandLineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let credentials = match (req.token_id, req.token_secret) {
        (Some(id), Some(secret)) => Some(Credentials::new(id, secret)),
        _ => None,
    };
    let result = state
        .dispatcher
        .run_command_line(&req.line, credentials)
        .await
        .map_err(|e| dispatch_error(&e))?;
    Ok(Json(result))
}

/// POST /executions - Start an invocation and return immediately.
async fn start_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(invocation): Json<Invocation>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let handle = state
        .dispatcher
        .runner()
        .spawn(invocation, Arc::new(DiscardLines), None)
        .await;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartExecutionResponse {
            execution_id: handle.id,
        }),
    ))
}

/// GET /executions - Ids of running invocations.
async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let running = state.dispatcher.runner().registry().running_ids().await;
    Ok(Json(ListExecutionsResponse { running }))
}

/// POST /executions/cancel - Cancel the most recently started invocation.
async fn cancel_latest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let cancelled = state.dispatcher.runner().cancel_running().await;
    Ok(Json(CancelResponse { cancelled }))
}

/// POST /executions/{id}/cancel - Cancel one invocation.
async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let cancelled = state
        .dispatcher
        .runner()
        .cancel(&Id::from_string(id))
        .await;
    Ok(Json(CancelResponse { cancelled }))
}

/// POST /scripts/dispatch - Deploy or run a script, optionally against an app.
async fn dispatch_script(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ScriptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let (receipt, _handle) = state
        .dispatcher
        .dispatch_script(req)
        .await
        .map_err(|e| dispatch_error(&e))?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// GET /events - Stream UI events (SSE).
///
/// Each SSE event is named after the UI notification (`command:start`,
/// `command:output`, `command:complete`) and carries the event as JSON.
/// Slow clients skip events they fell behind on.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamEventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let rx = state.events.subscribe();
    let stream = stream::unfold(
        (rx, query.execution_id),
        |(mut rx, filter): (broadcast::Receiver<UiEvent>, Option<Id>)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter.as_ref().is_some_and(|id| id != event.execution_id()) {
                            continue;
                        }
                        let json = match event.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                error!("failed to encode event: {}", e);
                                continue;
                            }
                        };
                        let sse = SseEvent::default().event(event.event_name()).data(json);
                        return Some((Ok::<_, Infallible>(sse), (rx, filter)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /logs - List execution logs, newest first.
async fn list_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let logs = state
        .dispatcher
        .recorder()
        .list(query.project_id.as_deref(), query.limit)
        .await
        .map_err(|e| storage_error("failed to list logs", &e))?;
    Ok(Json(logs))
}

/// DELETE /logs - Clear all logs, or one project's.
async fn clear_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let removed = state
        .dispatcher
        .recorder()
        .clear(query.project_id.as_deref())
        .await
        .map_err(|e| storage_error("failed to clear logs", &e))?;
    Ok(Json(ClearLogsResponse { removed }))
}

/// GET /logs/{id} - Get a single log entry.
async fn get_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let entry = state
        .dispatcher
        .recorder()
        .get(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("log not found", &e))?;
    Ok(Json(entry))
}

/// DELETE /logs/{id} - Delete a log entry. Unknown ids are a no-op.
async fn delete_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .dispatcher
        .recorder()
        .delete(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("failed to delete log", &e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /apps - List app profiles.
async fn list_apps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let apps = state
        .storage
        .list_apps()
        .await
        .map_err(|e| storage_error("failed to list apps", &e))?;
    Ok(Json(apps.into_iter().map(redact).collect::<Vec<_>>()))
}

/// POST /apps - Create an app profile.
async fn create_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AppRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if req.name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "app name must not be empty"));
    }

    let now = Utc::now();
    let app = AppProfile {
        id: Id::new(),
        name: req.name,
        app_name: req.app_name,
        description: req.description,
        token_id: req.token_id,
        token_secret: req.token_secret,
        workspace: req.workspace,
        suffix: req.suffix,
        created_at: now,
        updated_at: now,
    };
    state
        .storage
        .insert_app(&app)
        .await
        .map_err(|e| storage_error("failed to create app", &e))?;

    info!("created app: {} ({})", app.name, app.id);
    Ok((StatusCode::CREATED, Json(redact(app))))
}

/// GET /apps/{id} - Get one app profile.
async fn get_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let app = state
        .storage
        .get_app(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("app not found", &e))?;
    Ok(Json(redact(app)))
}

/// PUT /apps/{id} - Replace an app profile's fields.
async fn update_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<AppRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let mut app = state
        .storage
        .get_app(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("app not found", &e))?;

    app.name = req.name;
    app.app_name = req.app_name;
    app.description = req.description;
    app.token_id = req.token_id;
    if !req.token_secret.is_empty() {
        app.token_secret = req.token_secret;
    }
    app.workspace = req.workspace;
    app.suffix = req.suffix;

    let app = state
        .storage
        .update_app(&app)
        .await
        .map_err(|e| storage_error("failed to update app", &e))?;
    info!("updated app: {} ({})", app.name, app.id);
    Ok(Json(redact(app)))
}

/// DELETE /apps/{id} - Delete an app profile.
async fn delete_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .storage
        .delete_app(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("failed to delete app", &e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /cli/installed - Whether the modal CLI answers `--version`.
async fn cli_installed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let installed = state.dispatcher.check_installed().await;
    Ok(Json(serde_json::json!({ "installed": installed })))
}
