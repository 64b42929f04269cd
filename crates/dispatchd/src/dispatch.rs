//! Script dispatch and quick commands.
//!
//! Ties the pieces together the way the desktop actions do: resolve an app
//! profile, rewrite the script for its environment, write the rewritten copy
//! next to the original, optionally open an execution log entry, and hand the
//! invocation to the asynchronous runner.

use dispatch_core::{
    rewrite_for_environment, AppProfile, Config, Credentials, Id, Invocation, NewExecutionLog,
    RunResult, ScriptCommand,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::DiscardLines;
use crate::recorder::Recorder;
use crate::runner::{ExecutionHandle, Runner};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to read script {path}: {source}")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write temp script {path}: {source}")]
    WriteScript {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("script path has no file name: {0}")]
    InvalidScriptPath(String),
    #[error("command must not be empty")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Execution log metadata supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogMetadata {
    pub project_id: String,
    pub project_name: String,
    /// Display name; defaults to the script's file name.
    #[serde(default)]
    pub script_name: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Request to deploy or run one script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub command: ScriptCommand,
    /// Script path, relative to `work_dir` when that is set.
    pub script_path: PathBuf,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Text to run instead of the file on disk.
    #[serde(default)]
    pub content: Option<String>,
    /// App profile providing credentials and the environment suffix.
    #[serde(default)]
    pub app_id: Option<Id>,
    #[serde(default)]
    pub log: Option<LogMetadata>,
}

impl ScriptRequest {
    pub fn new(command: ScriptCommand, script_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            script_path: script_path.into(),
            work_dir: None,
            extra_args: Vec::new(),
            content: None,
            app_id: None,
            log: None,
        }
    }
}

/// Ids returned once a script has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub execution_id: Id,
    #[serde(default)]
    pub log_id: Option<Id>,
}

/// Split a quick-action line into an argv, dropping a leading `modal `.
pub fn parse_command_line(line: &str) -> Result<Vec<String>> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("modal ").unwrap_or(trimmed);
    let parts: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(DispatchError::EmptyCommand);
    }
    Ok(parts)
}

/// Script dispatch service.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runner: Runner,
    storage: Arc<Storage>,
    recorder: Recorder,
    temp_prefix: String,
}

impl Dispatcher {
    pub fn new(runner: Runner, storage: Arc<Storage>, recorder: Recorder, config: &Config) -> Self {
        Self {
            runner,
            storage,
            recorder,
            temp_prefix: config.temp_prefix.clone(),
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Deploy or run a script asynchronously.
    ///
    /// When the text handed to the CLI differs from the file on disk, it is
    /// written to `<temp_prefix><short id>_<file name>` beside the script and
    /// removed once the run terminates. The short id is the execution's, so
    /// concurrent dispatches of one script never share a temp file.
    pub async fn dispatch_script(
        &self,
        mut request: ScriptRequest,
    ) -> Result<(DispatchReceipt, ExecutionHandle)> {
        let profile = match &request.app_id {
            Some(id) => Some(self.storage.get_app(id).await?),
            None => None,
        };

        let work_dir = request
            .work_dir
            .as_deref()
            .map(|dir| self.runner.builder().resolve_dir(dir));
        let script_full = match &work_dir {
            Some(dir) => dir.join(&request.script_path),
            None => request.script_path.clone(),
        };
        let file_name = script_full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DispatchError::InvalidScriptPath(script_full.display().to_string()))?;

        let original = match &request.content {
            Some(content) => Cow::Borrowed(content.as_str()),
            None => Cow::Owned(tokio::fs::read_to_string(&script_full).await.map_err(
                |source| DispatchError::ReadScript {
                    path: script_full.display().to_string(),
                    source,
                },
            )?),
        };
        let text = match &profile {
            Some(app) => rewrite_for_environment(&original, &app.suffix),
            None => Cow::Borrowed(&*original),
        };

        let execution_id = Id::new();
        let temp_prefix = format!("{}{}_", self.temp_prefix, execution_id.short());
        let needs_temp = request.content.is_some() || matches!(text, Cow::Owned(_));
        let (script_arg, temp_path) = if needs_temp {
            let temp_path = script_full.with_file_name(format!("{temp_prefix}{file_name}"));
            tokio::fs::write(&temp_path, text.as_bytes())
                .await
                .map_err(|source| DispatchError::WriteScript {
                    path: temp_path.display().to_string(),
                    source,
                })?;
            let script_arg = temp_script_path(&request.script_path, &temp_prefix)
                .unwrap_or_else(|| temp_path.clone());
            (script_arg, Some(temp_path))
        } else {
            (request.script_path.clone(), None)
        };

        let mut invocation = Invocation::new(request.command.as_str())
            .arg(script_arg.to_string_lossy())
            .args(request.extra_args.iter().cloned());
        if let Some(dir) = &request.work_dir {
            invocation = invocation.working_dir(dir);
        }
        if let Some(app) = &profile {
            invocation = invocation.credentials(app.credentials());
            log_profile(app);
        }

        let log_id = match request.log.take() {
            Some(meta) => self.open_log(meta, &request, &file_name, &text).await,
            None => None,
        };

        let handle = self
            .runner
            .spawn_as(execution_id, invocation, Arc::new(DiscardLines), log_id.clone())
            .await;
        let handle = match temp_path {
            Some(path) => handle.on_terminated(move || {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "failed to remove temp script");
                }
            }),
            None => handle,
        };

        let receipt = DispatchReceipt {
            execution_id: handle.id.clone(),
            log_id,
        };
        Ok((receipt, handle))
    }

    /// Run a quick-action command line synchronously.
    pub async fn run_command_line(
        &self,
        line: &str,
        credentials: Option<Credentials>,
    ) -> Result<RunResult> {
        let mut parts = parse_command_line(line)?.into_iter();
        let subcommand = parts.next().ok_or(DispatchError::EmptyCommand)?;
        let mut invocation = Invocation::new(subcommand).args(parts);
        if let Some(creds) = credentials {
            invocation = invocation.credentials(creds);
        }
        Ok(self.runner.run(invocation).await)
    }

    /// True when `<cli> --version` exits zero.
    pub async fn check_installed(&self) -> bool {
        let result = self.runner.run_silent(Invocation::new("--version")).await;
        if result.succeeded {
            info!(version = %result.output.trim(), "modal CLI available");
        }
        result.succeeded
    }

    /// Open a running log entry. Failures are logged and the run goes ahead
    /// without a log.
    async fn open_log(
        &self,
        meta: LogMetadata,
        request: &ScriptRequest,
        file_name: &str,
        text: &str,
    ) -> Option<Id> {
        let entry = NewExecutionLog {
            project_id: meta.project_id,
            project_name: meta.project_name,
            script_name: meta.script_name.unwrap_or_else(|| file_name.to_string()),
            script_path: request.script_path.display().to_string(),
            script_content: text.to_string(),
            command: request.command.as_str().to_string(),
            variables: meta.variables,
        };
        match self.recorder.create(entry).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "failed to create execution log");
                None
            }
        }
    }
}

fn log_profile(app: &AppProfile) {
    info!(
        app = %app.name,
        suffix = %app.suffix,
        token_id = %app.credentials().redacted_id(),
        "dispatching with app profile"
    );
}

/// Path the temp copy of `script` would be written to.
pub fn temp_script_path(script: &Path, prefix: &str) -> Option<PathBuf> {
    let name = script.file_name()?.to_string_lossy();
    Some(script.with_file_name(format!("{prefix}{name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::events::EventBus;
    use crate::runner::RunnerConfig;
    use chrono::Utc;
    use dispatch_core::{LogStatus, TerminalStatus, UiEvent};
    use tempfile::TempDir;

    #[test]
    fn parse_command_line_strips_prefix() {
        assert_eq!(
            parse_command_line("modal app list --json").unwrap(),
            vec!["app", "list", "--json"]
        );
        assert_eq!(
            parse_command_line("  volume   ls  data ").unwrap(),
            vec!["volume", "ls", "data"]
        );
    }

    #[test]
    fn parse_command_line_rejects_empty() {
        assert!(matches!(
            parse_command_line("   "),
            Err(DispatchError::EmptyCommand)
        ));
        assert!(matches!(
            parse_command_line("modal "),
            Err(DispatchError::EmptyCommand)
        ));
    }

    #[test]
    fn temp_script_path_keeps_directory() {
        assert_eq!(
            temp_script_path(Path::new("svc/app.py"), "_temp_3e4f5a6b_"),
            Some(PathBuf::from("svc/_temp_3e4f5a6b_app.py"))
        );
        assert_eq!(temp_script_path(Path::new("/"), "_temp_"), None);
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        /// Fake CLI that prints its argv, the token id, and the script it was given.
        const ECHO_CLI: &str = r#"echo "args=$*"
echo "token=$MODAL_TOKEN_ID"
if [ -f "$2" ]; then cat "$2"; fi"#;

        struct Fixture {
            dispatcher: Dispatcher,
            storage: Arc<Storage>,
            dir: TempDir,
        }

        async fn fixture(cli_body: &str) -> Fixture {
            use std::os::unix::fs::PermissionsExt;

            let dir = TempDir::new().unwrap();
            let cli = dir.path().join("modal");
            std::fs::write(&cli, format!("#!/bin/sh\n{cli_body}\n")).unwrap();
            let mut perms = std::fs::metadata(&cli).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&cli, perms).unwrap();

            let projects = dir.path().join("projects");
            std::fs::create_dir_all(projects.join("svc")).unwrap();

            let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
            storage.migrate_embedded().await.unwrap();
            let storage = Arc::new(storage);

            let config = Config::default();
            let recorder = Recorder::from_config(Arc::clone(&storage), &config);
            let runner = Runner::new(
                CommandBuilder::new(cli).with_projects_dir(&projects),
                RunnerConfig::default(),
                EventBus::default(),
            )
            .with_recorder(recorder.clone());

            Fixture {
                dispatcher: Dispatcher::new(runner, Arc::clone(&storage), recorder, &config),
                storage,
                dir,
            }
        }

        fn write_script(fx: &Fixture, body: &str) -> PathBuf {
            let path = fx.dir.path().join("projects/svc/app.py");
            std::fs::write(&path, body).unwrap();
            path
        }

        /// Files in the script directory left behind by temp copies.
        fn temp_leftovers(fx: &Fixture) -> Vec<String> {
            std::fs::read_dir(fx.dir.path().join("projects/svc"))
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with("_temp_"))
                .collect()
        }

        async fn insert_profile(storage: &Storage, suffix: &str) -> AppProfile {
            insert_named_profile(storage, "staging", suffix).await
        }

        async fn insert_named_profile(storage: &Storage, name: &str, suffix: &str) -> AppProfile {
            let now = Utc::now();
            let app = AppProfile {
                id: Id::new(),
                name: name.to_string(),
                app_name: "svc".to_string(),
                description: String::new(),
                token_id: format!("ak-{name}"),
                token_secret: format!("as-{name}"),
                workspace: "team".to_string(),
                suffix: suffix.to_string(),
                created_at: now,
                updated_at: now,
            };
            storage.insert_app(&app).await.unwrap();
            app
        }

        #[tokio::test]
        async fn dispatch_unmodified_script_passes_original_path() {
            let fx = fixture(ECHO_CLI).await;
            write_script(&fx, "print('hi')\n");

            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            assert!(receipt.log_id.is_none());

            let result = handle.wait().await;
            assert!(result.succeeded);
            assert!(result.output.starts_with("args=deploy app.py\n"));
            assert!(result.output.contains("print('hi')"));
        }

        #[tokio::test]
        async fn dispatch_to_app_rewrites_and_removes_temp_script() {
            let fx = fixture(ECHO_CLI).await;
            let script = write_script(&fx, "app = modal.App(\"svc\")\n");
            let app = insert_profile(&fx.storage, "test").await;

            let mut request = ScriptRequest::new(ScriptCommand::Run, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.app_id = Some(app.id.clone());
            request.extra_args = vec!["--detach".to_string()];

            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            let result = handle.wait().await;

            assert!(result.succeeded, "{result:?}");
            let expected = format!(
                "args=run _temp_{}_app.py --detach",
                receipt.execution_id.short()
            );
            assert!(result.output.contains(&expected), "{}", result.output);
            assert!(result.output.contains("token=ak-staging"));
            assert!(result.output.contains("modal.App(\"svc-test\")"));
            // Original untouched, temp copy gone.
            assert_eq!(
                std::fs::read_to_string(&script).unwrap(),
                "app = modal.App(\"svc\")\n"
            );
            assert!(temp_leftovers(&fx).is_empty());
        }

        #[tokio::test]
        async fn concurrent_dispatches_to_different_apps_keep_their_own_script() {
            let fx = fixture(
                r#"sleep 0.5
echo "token=$MODAL_TOKEN_ID"
cat "$2""#,
            )
            .await;
            write_script(&fx, "app = modal.App(\"svc\")\n");
            let alpha = insert_named_profile(&fx.storage, "alpha", "alpha").await;
            let beta = insert_named_profile(&fx.storage, "beta", "beta").await;

            let request_for = |app: &AppProfile| {
                let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
                request.work_dir = Some(PathBuf::from("svc"));
                request.app_id = Some(app.id.clone());
                request
            };
            let (_, first) = fx.dispatcher.dispatch_script(request_for(&alpha)).await.unwrap();
            let (_, second) = fx.dispatcher.dispatch_script(request_for(&beta)).await.unwrap();

            let (first, second) = tokio::join!(first.wait(), second.wait());
            assert!(first.succeeded, "{first:?}");
            assert!(second.succeeded, "{second:?}");
            assert!(first.output.contains("token=ak-alpha"));
            assert!(first.output.contains("modal.App(\"svc-alpha\")"));
            assert!(second.output.contains("token=ak-beta"));
            assert!(second.output.contains("modal.App(\"svc-beta\")"));
            assert!(temp_leftovers(&fx).is_empty());
        }

        #[tokio::test]
        async fn cancelled_dispatch_finalizes_log_and_removes_temp_script() {
            let fx = fixture("echo started; exec sleep 30").await;
            write_script(&fx, "app = modal.App(\"svc\")\n");
            let app = insert_profile(&fx.storage, "test").await;
            let mut rx = fx.dispatcher.runner().events().subscribe();

            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.app_id = Some(app.id.clone());
            request.log = Some(LogMetadata {
                project_id: "p1".to_string(),
                project_name: "Service".to_string(),
                ..Default::default()
            });
            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            assert_eq!(temp_leftovers(&fx).len(), 1);

            loop {
                if let UiEvent::OutputLine { line, .. } = rx.recv().await.unwrap() {
                    if line == "started" {
                        break;
                    }
                }
            }
            assert!(fx.dispatcher.runner().cancel(&receipt.execution_id).await);
            let result = handle.wait().await;
            assert_eq!(result.status, TerminalStatus::Killed);

            let entry = fx
                .dispatcher
                .recorder()
                .get(&receipt.log_id.unwrap())
                .await
                .unwrap();
            assert_eq!(entry.status, LogStatus::Failed);
            assert_eq!(entry.output, "started\n");
            assert!(entry.end_time > 0);
            assert!(temp_leftovers(&fx).is_empty());
        }

        #[tokio::test]
        async fn dispatch_with_content_override_uses_temp_file() {
            let fx = fixture(ECHO_CLI).await;
            write_script(&fx, "on disk\n");

            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.content = Some("edited in memory\n".to_string());

            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            let result = handle.wait().await;
            let expected = format!("args=deploy _temp_{}_app.py", receipt.execution_id.short());
            assert!(result.output.contains(&expected));
            assert!(result.output.contains("edited in memory"));
        }

        #[tokio::test]
        async fn dispatch_with_log_records_outcome() {
            let fx = fixture("echo deployed; exit 0").await;
            write_script(&fx, "print('x')\n");

            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.log = Some(LogMetadata {
                project_id: "p1".to_string(),
                project_name: "Service".to_string(),
                ..Default::default()
            });

            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            let log_id = receipt.log_id.clone().unwrap();

            handle.wait().await;
            let entry = fx.dispatcher.recorder().get(&log_id).await.unwrap();
            assert_eq!(entry.status, LogStatus::Success);
            assert_eq!(entry.output, "deployed\n");
            assert_eq!(entry.script_name, "app.py");
            assert_eq!(entry.command, "deploy");
            assert!(entry.end_time > 0);
        }

        #[tokio::test]
        async fn failed_dispatch_marks_log_failed() {
            let fx = fixture("echo nope; exit 2").await;
            write_script(&fx, "print('x')\n");

            let mut request = ScriptRequest::new(ScriptCommand::Run, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.log = Some(LogMetadata::default());

            let (receipt, handle) = fx.dispatcher.dispatch_script(request).await.unwrap();
            let result = handle.wait().await;
            assert_eq!(result.status, TerminalStatus::Failed);

            let entry = fx
                .dispatcher
                .recorder()
                .get(&receipt.log_id.unwrap())
                .await
                .unwrap();
            assert_eq!(entry.status, LogStatus::Failed);
        }

        #[tokio::test]
        async fn dispatch_with_unknown_app_fails() {
            let fx = fixture(ECHO_CLI).await;
            write_script(&fx, "x\n");
            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "app.py");
            request.work_dir = Some(PathBuf::from("svc"));
            request.app_id = Some(Id::new());

            let err = fx.dispatcher.dispatch_script(request).await.unwrap_err();
            assert!(matches!(
                err,
                DispatchError::Storage(StorageError::AppNotFound(_))
            ));
        }

        #[tokio::test]
        async fn dispatch_missing_script_fails() {
            let fx = fixture(ECHO_CLI).await;
            let mut request = ScriptRequest::new(ScriptCommand::Deploy, "missing.py");
            request.work_dir = Some(PathBuf::from("svc"));
            let err = fx.dispatcher.dispatch_script(request).await.unwrap_err();
            assert!(matches!(err, DispatchError::ReadScript { .. }));
        }

        #[tokio::test]
        async fn run_command_line_splits_and_runs() {
            let fx = fixture(r#"echo "args=$*""#).await;
            let result = fx
                .dispatcher
                .run_command_line("modal app   list", None)
                .await
                .unwrap();
            assert!(result.succeeded);
            assert_eq!(result.output, "args=app list\n");
        }

        #[tokio::test]
        async fn check_installed_reflects_version_exit_code() {
            let fx = fixture(r#"[ "$1" = "--version" ] && echo "modal 0.64.0""#).await;
            let mut rx = fx.dispatcher.runner().events().subscribe();
            assert!(fx.dispatcher.check_installed().await);
            assert!(rx.try_recv().is_err());

            let fx = fixture("exit 1").await;
            assert!(!fx.dispatcher.check_installed().await);
        }
    }
}
