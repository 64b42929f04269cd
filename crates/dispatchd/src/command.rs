//! Command construction for the external `modal` CLI.
//!
//! Builds the argv, environment overrides, and working directory for one
//! invocation. No shell is involved; arguments are passed through verbatim.

use dispatch_core::{Config, Invocation};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Binary name looked up on PATH.
pub const CLI_NAME: &str = "modal";

/// Python versions whose per-user Scripts directories are probed on Windows.
const WINDOWS_PYTHON_VERSIONS: [&str; 3] = ["Python311", "Python310", "Python39"];

/// Resolve the CLI binary.
///
/// Order: configured path, PATH lookup, well-known install locations, and
/// finally the bare name so the OS gets the last word.
pub fn resolve_binary(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    if let Ok(path) = which::which(CLI_NAME) {
        return path;
    }

    if let Some(path) = known_locations(dirs::home_dir().as_deref())
        .into_iter()
        .find(|p| p.exists())
    {
        return path;
    }

    PathBuf::from(CLI_NAME)
}

/// Install locations checked when the CLI is not on PATH.
fn known_locations(home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = home {
        for root in [
            home.join("AppData").join("Local").join("Programs"),
            home.join("AppData").join("Roaming"),
        ] {
            for version in WINDOWS_PYTHON_VERSIONS {
                paths.push(
                    root.join("Python")
                        .join(version)
                        .join("Scripts")
                        .join("modal.exe"),
                );
            }
        }
        paths.push(home.join(".local").join("bin").join(CLI_NAME));
    }
    paths.push(PathBuf::from("/usr/local/bin").join(CLI_NAME));
    paths
}

/// Turns an [`Invocation`] into a ready-to-spawn process command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    binary: PathBuf,
    projects_dir: Option<PathBuf>,
    token_id_env: String,
    token_secret_env: String,
    encoding_env: String,
    encoding_value: String,
}

impl CommandBuilder {
    /// Builder using default environment variable names.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self {
            binary: binary.into(),
            projects_dir: None,
            token_id_env: defaults.token_id_env,
            token_secret_env: defaults.token_secret_env,
            encoding_env: defaults.encoding_env,
            encoding_value: defaults.encoding_value,
        }
    }

    /// Builder with the binary resolved and names taken from config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: resolve_binary(config.cli_bin.as_deref()),
            projects_dir: Some(config.projects_dir.clone()),
            token_id_env: config.token_id_env.clone(),
            token_secret_env: config.token_secret_env.clone(),
            encoding_env: config.encoding_env.clone(),
            encoding_value: config.encoding_value.clone(),
        }
    }

    /// Resolve relative working directories against this root.
    pub fn with_projects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.projects_dir = Some(dir.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Environment variables set on top of the inherited environment.
    ///
    /// Credentials are only included when both halves are non-empty.
    pub fn env_overrides(&self, invocation: &Invocation) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(3);
        if let Some(creds) = invocation.effective_credentials() {
            env.push((self.token_id_env.clone(), creds.token_id.clone()));
            env.push((self.token_secret_env.clone(), creds.token_secret.clone()));
        }
        env.push((self.encoding_env.clone(), self.encoding_value.clone()));
        env
    }

    /// Resolve a directory the way the child will see it.
    pub fn resolve_dir(&self, dir: &Path) -> PathBuf {
        match &self.projects_dir {
            Some(root) if dir.is_relative() => root.join(dir),
            _ => dir.to_path_buf(),
        }
    }

    /// Working directory the child will run in, if any.
    pub fn working_dir(&self, invocation: &Invocation) -> Option<PathBuf> {
        invocation
            .working_dir
            .as_deref()
            .map(|dir| self.resolve_dir(dir))
    }

    /// Build the process command with stdin closed and both outputs piped.
    pub fn build(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&invocation.subcommand)
            .args(&invocation.args)
            .envs(self.env_overrides(invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = self.working_dir(invocation) {
            cmd.current_dir(dir);
        }

        let credentials = invocation
            .effective_credentials()
            .map_or_else(|| "inherited".to_string(), |c| c.redacted_id());
        debug!(
            command = %self.display(invocation),
            credentials = %credentials,
            "built command"
        );

        cmd
    }

    /// Human-readable form for diagnostics, e.g. `modal deploy app.py`.
    pub fn display(&self, invocation: &Invocation) -> String {
        std::iter::once(CLI_NAME)
            .chain(invocation.argv())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
