//! dispatchd - local control plane for the `modal` CLI.
//!
//! Library components for the daemon process: command construction, process
//! supervision, execution logs, app profiles, and the HTTP/SSE surface.

pub mod command;
pub mod dispatch;
pub mod events;
pub mod recorder;
pub mod registry;
pub mod runner;
pub mod server;
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dispatch_core::Config;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use command::CommandBuilder;
use dispatch::Dispatcher;
use events::EventBus;
use recorder::Recorder;
use runner::{Runner, RunnerConfig};
use storage::Storage;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7700;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7700).
    pub port: u16,
    /// Bearer token required by the HTTP API, if set.
    pub auth_token: Option<String>,
    /// Optional `key=value` config file.
    pub config_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("DISPATCHD_AUTH_TOKEN").ok(),
            config_path: None,
        }
    }
}

/// Get the default database path (~/.local/share/dispatchd/dispatchd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("dispatchd").join("dispatchd.db")
}

/// Load the runtime config, resolving relative paths against the file's
/// directory. Without a file the defaults apply relative to the cwd.
pub fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let mut config = Config::from_file(path)
        .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    Ok(config)
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> eyre::Result<Self> {
        let settings = load_config(config.config_path.as_deref())?;

        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let storage = Storage::new(&config.db_path)
            .await
            .wrap_err("failed to open database")?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to apply schema")?;
        let storage = Arc::new(storage);

        let recorder = Recorder::from_config(Arc::clone(&storage), &settings);
        let events = EventBus::default();
        let builder = CommandBuilder::from_config(&settings);
        info!(binary = %builder.binary().display(), "resolved modal CLI");

        let runner = Runner::new(builder, RunnerConfig::from_config(&settings), events.clone())
            .with_recorder(recorder.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            runner,
            Arc::clone(&storage),
            recorder,
            &settings,
        ));

        Ok(Self {
            config,
            storage,
            dispatcher,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve HTTP until shutdown is requested, then cancel running children.
    pub async fn run(&self) -> eyre::Result<()> {
        info!("dispatchd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        if !self.dispatcher.check_installed().await {
            warn!("modal CLI not available; commands will fail until it is installed");
        }

        let state = Arc::new(server::AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            storage: Arc::clone(&self.storage),
            events: self.events.clone(),
            auth_token: self.config.auth_token.clone(),
        });
        let port = self.config.port;
        let http_shutdown = self.shutdown.clone();
        let mut http_handle = tokio::spawn(async move {
            if let Err(e) = server::start_server(state, port, http_shutdown).await {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            () = self.shutdown.cancelled() => {
                info!("shutdown signal received, exiting");
            }
            _ = &mut http_handle => {
                warn!("HTTP server exited");
            }
        }

        let cancelled = self.dispatcher.runner().registry().signal_all().await;
        if cancelled > 0 {
            info!(cancelled, "cancelled running commands");
        }
        http_handle.abort();

        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.projects_dir, PathBuf::from("data/projects"));
    }

    #[test]
    fn config_paths_resolve_against_file_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatchd.conf");
        std::fs::write(&path, "projects_dir=\"projects\"\nlog_retention=20\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.projects_dir, dir.path().join("projects"));
        assert_eq!(config.log_retention, 20);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.conf"))).is_err());
    }

    #[tokio::test]
    async fn daemon_builds_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(DaemonConfig {
            db_path: dir.path().join("nested").join("d.db"),
            port: 0,
            auth_token: None,
            config_path: None,
        })
        .await
        .unwrap();

        assert_eq!(daemon.storage().count_logs().await.unwrap(), 0);
        daemon.shutdown();
        daemon.run().await.unwrap();
    }
}
