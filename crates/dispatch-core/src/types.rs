//! Core types shared by the daemon and the CLI client.
//!
//! Invocations describe one call of the external `modal` CLI; run results,
//! execution log entries, and app profiles are what flows back out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for executions, log entries, and app profiles.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Last eight characters, the random tail of a `UUIDv7`.
    pub fn short(&self) -> &str {
        self.0.get(self.0.len().saturating_sub(8)..).unwrap_or(&self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Invocation ---

/// Token pair handed to the CLI through environment overrides.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub token_id: String,
    pub token_secret: String,
}

impl Credentials {
    pub fn new(token_id: impl Into<String>, token_secret: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            token_secret: token_secret.into(),
        }
    }

    /// Overrides are only applied when both halves are present.
    pub fn is_empty(&self) -> bool {
        self.token_id.is_empty() || self.token_secret.is_empty()
    }

    /// Short token-id prefix that is safe to log.
    pub fn redacted_id(&self) -> String {
        let prefix: String = self.token_id.chars().take(8).collect();
        format!("{prefix}...")
    }
}

// Never print the secret, not even in debug output.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token_id", &self.redacted_id())
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

/// A fully specified request to run the external CLI once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub subcommand: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl Invocation {
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            args: Vec::new(),
            working_dir: None,
            credentials: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Credentials that will actually be applied (both halves non-empty).
    pub fn effective_credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref().filter(|c| !c.is_empty())
    }

    /// Full argument vector passed to the binary.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.subcommand.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

// --- Results and states ---

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Killed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

/// Lifecycle of one asynchronous invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

impl From<TerminalStatus> for ExecutionState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => Self::Completed,
            TerminalStatus::Failed => Self::Failed,
            TerminalStatus::Killed => Self::Killed,
        }
    }
}

/// Terminal outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: TerminalStatus,
    pub succeeded: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn completed(output: String) -> Self {
        Self {
            status: TerminalStatus::Completed,
            succeeded: true,
            output,
            error: None,
        }
    }

    pub fn failed(output: String, error: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            succeeded: false,
            output,
            error: Some(error.into()),
        }
    }

    pub fn killed(output: String, error: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Killed,
            succeeded: false,
            output,
            error: Some(error.into()),
        }
    }

    /// Status recorded in the execution log for this result.
    pub fn log_status(&self) -> LogStatus {
        if self.succeeded {
            LogStatus::Success
        } else {
            LogStatus::Failed
        }
    }
}

// --- Execution log ---

/// Persisted status of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which CLI subcommand a script is dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptCommand {
    Deploy,
    Run,
}

impl ScriptCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Run => "run",
        }
    }
}

/// Metadata captured when an execution log entry is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExecutionLog {
    pub project_id: String,
    pub project_name: String,
    pub script_name: String,
    pub script_path: String,
    pub script_content: String,
    pub command: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// A persisted record of one asynchronous invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Id,
    pub project_id: String,
    pub project_name: String,
    pub script_name: String,
    pub script_path: String,
    pub script_content: String,
    pub command: String,
    pub variables: BTreeMap<String, String>,
    /// Unix seconds.
    pub start_time: i64,
    /// Unix seconds; 0 while running.
    pub end_time: i64,
    pub status: LogStatus,
    pub output: String,
}

// --- App profiles ---

/// A deployment target: credentials plus the name suffix that isolates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    pub id: Id,
    pub name: String,
    /// App name on the platform.
    pub app_name: String,
    pub description: String,
    pub token_id: String,
    pub token_secret: String,
    pub workspace: String,
    /// Environment suffix such as `-test` or `prod`.
    pub suffix: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppProfile {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.token_id, &self.token_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn id_short_keeps_tail() {
        let id = Id::from_string("0192a3b4-c5d6-7e8f-9a0b-1c2d3e4f5a6b");
        assert_eq!(id.short(), "3e4f5a6b");
        assert_eq!(Id::from_string("abc").short(), "abc");
    }

    #[test]
    fn invocation_argv_starts_with_subcommand() {
        let inv = Invocation::new("deploy").arg("app.py").args(["--name", "x"]);
        assert_eq!(inv.argv(), vec!["deploy", "app.py", "--name", "x"]);
    }

    #[test]
    fn half_empty_credentials_are_not_applied() {
        let inv = Invocation::new("run").credentials(Credentials::new("ak-123", ""));
        assert!(inv.effective_credentials().is_none());

        let inv = Invocation::new("run").credentials(Credentials::new("ak-123", "as-456"));
        assert!(inv.effective_credentials().is_some());
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = Credentials::new("ak-1234567890", "as-topsecret");
        let debug = format!("{creds:?}");
        assert!(debug.contains("ak-12345..."));
        assert!(!debug.contains("topsecret"));
    }

    #[test]
    fn run_result_constructors_keep_succeeded_consistent() {
        assert!(RunResult::completed(String::new()).succeeded);
        assert!(!RunResult::failed(String::new(), "boom").succeeded);
        let killed = RunResult::killed("partial".into(), "killed");
        assert!(!killed.succeeded);
        assert_eq!(killed.status, TerminalStatus::Killed);
        assert_eq!(killed.log_status(), LogStatus::Failed);
    }

    #[test]
    fn log_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LogStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(LogStatus::parse("success"), Some(LogStatus::Success));
        assert_eq!(LogStatus::parse("SUCCESS"), None);
    }

    #[test]
    fn execution_state_terminal_states() {
        assert!(!ExecutionState::NotStarted.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::from(TerminalStatus::Killed).is_terminal());
    }
}
