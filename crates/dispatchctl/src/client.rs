//! HTTP client for the dispatchd daemon.
//!
//! Talks to dispatchd over its local HTTP API and decodes its SSE stream.

use std::collections::BTreeMap;
use std::path::PathBuf;

use dispatch_core::{AppProfile, ExecutionLogEntry, Id, Invocation, RunResult, UiEvent};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: dispatchd\n  → or set DISPATCHD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check DISPATCHD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure dispatchd is running\n  → check DISPATCHD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else if e.is_decode() {
            ClientError::InvalidResponse(e.to_string())
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /commands/line.
#[derive(Debug, Serialize)]
pub struct CommandLineRequest {
    pub line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
}

/// Log metadata sent with a script dispatch.
#[derive(Debug, Default, Serialize)]
pub struct LogMetadata {
    pub project_id: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

/// Request payload for POST /scripts/dispatch.
#[derive(Debug, Serialize)]
pub struct DispatchRequest {
    /// `deploy` or `run`.
    pub command: String,
    pub script_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogMetadata>,
}

/// Response from POST /scripts/dispatch.
#[derive(Debug, Deserialize)]
pub struct DispatchResponse {
    pub execution_id: Id,
    #[serde(default)]
    pub log_id: Option<Id>,
}

/// Request payload for POST /apps.
#[derive(Debug, Default, Serialize)]
pub struct CreateAppRequest {
    pub name: String,
    pub app_name: String,
    pub description: String,
    pub token_id: String,
    pub token_secret: String,
    pub workspace: String,
    pub suffix: String,
}

#[derive(Debug, Deserialize)]
struct StartExecutionResponse {
    execution_id: Id,
}

#[derive(Debug, Deserialize)]
struct ListExecutionsResponse {
    running: Vec<Id>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Deserialize)]
struct ClearLogsResponse {
    removed: u64,
}

#[derive(Debug, Deserialize)]
struct InstalledResponse {
    installed: bool,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for dispatchd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe /health. Err if the connection failed.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready (5s window, backoff from 200ms).
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    /// Wait for daemon to become ready with custom timeout.
    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        if status == 404 {
            return ClientError::NotFound(message);
        }

        ClientError::HttpError { status, message }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        self.decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response)
    }

    /// POST /commands
    pub async fn run_command(&self, invocation: &Invocation) -> Result<RunResult, ClientError> {
        self.post("/commands", invocation).await
    }

    /// POST /commands/line
    pub async fn run_command_line(&self, req: &CommandLineRequest) -> Result<RunResult, ClientError> {
        self.post("/commands/line", req).await
    }

    /// POST /executions
    pub async fn start_execution(&self, invocation: &Invocation) -> Result<Id, ClientError> {
        let response: StartExecutionResponse = self.post("/executions", invocation).await?;
        Ok(response.execution_id)
    }

    /// GET /executions
    pub async fn list_executions(&self) -> Result<Vec<Id>, ClientError> {
        let response: ListExecutionsResponse = self.get("/executions").await?;
        Ok(response.running)
    }

    /// Cancel one execution, or the latest one when `id` is None.
    pub async fn cancel(&self, id: Option<&str>) -> Result<bool, ClientError> {
        let path = match id {
            Some(id) => format!("/executions/{}/cancel", urlencoding::encode(id)),
            None => "/executions/cancel".to_string(),
        };
        let response: CancelResponse = self.post(&path, &serde_json::json!({})).await?;
        Ok(response.cancelled)
    }

    /// POST /scripts/dispatch
    pub async fn dispatch_script(
        &self,
        req: &DispatchRequest,
    ) -> Result<DispatchResponse, ClientError> {
        self.post("/scripts/dispatch", req).await
    }

    /// GET /logs
    pub async fn list_logs(
        &self,
        project_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionLogEntry>, ClientError> {
        self.get(&format!("/logs{}", logs_query(project_id, limit)))
            .await
    }

    /// GET /logs/{id}
    pub async fn get_log(&self, id: &str) -> Result<ExecutionLogEntry, ClientError> {
        self.get(&format!("/logs/{}", urlencoding::encode(id)))
            .await
    }

    /// DELETE /logs/{id}
    pub async fn delete_log(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/logs/{}", urlencoding::encode(id)))
            .await?;
        Ok(())
    }

    /// DELETE /logs
    pub async fn clear_logs(&self, project_id: Option<&str>) -> Result<u64, ClientError> {
        let response = self
            .delete(&format!("/logs{}", logs_query(project_id, None)))
            .await?;
        let cleared: ClearLogsResponse = response.json().await?;
        Ok(cleared.removed)
    }

    /// GET /apps
    pub async fn list_apps(&self) -> Result<Vec<AppProfile>, ClientError> {
        self.get("/apps").await
    }

    /// POST /apps
    pub async fn create_app(&self, req: &CreateAppRequest) -> Result<AppProfile, ClientError> {
        self.post("/apps", req).await
    }

    /// DELETE /apps/{id}
    pub async fn delete_app(&self, id: &str) -> Result<(), ClientError> {
        self.delete(&format!("/apps/{}", urlencoding::encode(id)))
            .await?;
        Ok(())
    }

    /// GET /cli/installed
    pub async fn cli_installed(&self) -> Result<bool, ClientError> {
        let response: InstalledResponse = self.get("/cli/installed").await?;
        Ok(response.installed)
    }

    /// GET /events
    ///
    /// Opens the event stream. The daemon has subscribed by the time this
    /// returns, so anything started afterwards is seen in full.
    pub async fn open_events(&self, execution_id: Option<&str>) -> Result<EventStream, ClientError> {
        let mut url = format!("{}/events", self.base_url);
        if let Some(id) = execution_id {
            url.push_str(&format!("?execution_id={}", urlencoding::encode(id)));
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(EventStream { response })
    }

    /// Stream UI events to `on_event` until it returns false or the daemon
    /// closes the stream.
    pub async fn watch_events<F>(
        &self,
        execution_id: Option<&str>,
        on_event: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&UiEvent) -> bool,
    {
        self.open_events(execution_id).await?.for_each(on_event).await
    }
}

/// An open SSE connection to GET /events.
#[derive(Debug)]
pub struct EventStream {
    response: reqwest::Response,
}

impl EventStream {
    /// Feed decoded events to `on_event` until it returns false.
    pub async fn for_each<F>(self, mut on_event: F) -> Result<(), ClientError>
    where
        F: FnMut(&UiEvent) -> bool,
    {
        use futures::StreamExt;

        let mut stream = self.response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Complete SSE events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();

                if let Some(event) = parse_sse_event(&event_str) {
                    if !on_event(&event) {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

fn logs_query(project_id: Option<&str>, limit: Option<usize>) -> String {
    let mut params = Vec::new();
    if let Some(project) = project_id {
        params.push(format!("project_id={}", urlencoding::encode(project)));
    }
    if let Some(limit) = limit {
        params.push(format!("limit={limit}"));
    }
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

/// Parse one SSE event block into a UI event.
///
/// Keep-alive comments and events with other names yield None.
fn parse_sse_event(event_str: &str) -> Option<UiEvent> {
    let mut event_type = None;
    let mut data = Vec::new();

    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    let event: UiEvent = serde_json::from_str(&data.join("\n")).ok()?;
    if event_type.is_some_and(|name| name != event.event_name()) {
        return None;
    }
    Some(event)
}
