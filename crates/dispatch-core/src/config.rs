//! Configuration parsing for the dispatch daemon.
//!
//! Plain `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default number of execution log entries kept.
pub const DEFAULT_LOG_RETENTION: usize = 500;

/// Default cap on output stored per execution log entry (50 KiB).
pub const DEFAULT_LOG_OUTPUT_MAX_BYTES: usize = 50 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("empty value for {0}")]
    EmptyValue(String),
}

/// Settings for invoking the external CLI and recording its runs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit path to the CLI binary; resolved from PATH when unset.
    pub cli_bin: Option<PathBuf>,
    /// Root that relative working directories are resolved against.
    pub projects_dir: PathBuf,

    // Environment overrides
    pub token_id_env: String,
    pub token_secret_env: String,
    pub encoding_env: String,
    pub encoding_value: String,

    /// Timeout for synchronous runs in seconds (0 = wait forever).
    pub run_timeout_sec: u32,

    // Execution log
    pub log_retention: usize,
    pub log_output_max_bytes: usize,

    /// Prefix for rewritten copies of scripts written next to the original.
    pub temp_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cli_bin: None,
            projects_dir: PathBuf::from("data/projects"),
            token_id_env: "MODAL_TOKEN_ID".to_string(),
            token_secret_env: "MODAL_TOKEN_SECRET".to_string(),
            encoding_env: "PYTHONIOENCODING".to_string(),
            encoding_value: "utf-8".to_string(),
            run_timeout_sec: 0,
            log_retention: DEFAULT_LOG_RETENTION,
            log_output_max_bytes: DEFAULT_LOG_OUTPUT_MAX_BYTES,
            // The CLI rejects module file names with more than one dot.
            temp_prefix: "_temp_".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "cli_bin" => {
                self.cli_bin = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "projects_dir" => self.projects_dir = PathBuf::from(value),
            "token_id_env" => self.token_id_env = Self::non_empty(key, value)?,
            "token_secret_env" => self.token_secret_env = Self::non_empty(key, value)?,
            "encoding_env" => self.encoding_env = Self::non_empty(key, value)?,
            "encoding_value" => self.encoding_value = value.to_string(),
            "run_timeout_sec" => self.run_timeout_sec = Self::parse_int(key, value)?,
            "log_retention" => self.log_retention = Self::parse_int(key, value)?,
            "log_output_max_bytes" => self.log_output_max_bytes = Self::parse_int(key, value)?,
            "temp_prefix" => self.temp_prefix = Self::non_empty(key, value)?,
            _ => {
                // Warn but don't fail, so older daemons accept newer files.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn non_empty(key: &str, value: &str) -> Result<String, ConfigError> {
        if value.is_empty() {
            Err(ConfigError::EmptyValue(key.to_string()))
        } else {
            Ok(value.to_string())
        }
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.projects_dir.is_relative() {
            self.projects_dir = base.join(&self.projects_dir);
        }
    }

    /// Resolve a working directory the way the CLI will see it.
    pub fn resolve_working_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.projects_dir.join(dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert!(config.cli_bin.is_none());
        assert_eq!(config.token_id_env, "MODAL_TOKEN_ID");
        assert_eq!(config.token_secret_env, "MODAL_TOKEN_SECRET");
        assert_eq!(config.encoding_env, "PYTHONIOENCODING");
        assert_eq!(config.encoding_value, "utf-8");
        assert_eq!(config.run_timeout_sec, 0);
        assert_eq!(config.log_retention, 500);
        assert_eq!(config.log_output_max_bytes, 51200);
        assert_eq!(config.temp_prefix, "_temp_");
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# dispatch settings
cli_bin="/opt/modal/bin/modal"
projects_dir=/srv/projects
run_timeout_sec=120
log_retention=50
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.cli_bin, Some(PathBuf::from("/opt/modal/bin/modal")));
        assert_eq!(config.projects_dir, PathBuf::from("/srv/projects"));
        assert_eq!(config.run_timeout_sec, 120);
        assert_eq!(config.log_retention, 50);
    }

    #[test]
    fn empty_cli_bin_clears_override() {
        let mut config = Config::default();
        config.parse_content("cli_bin=/usr/bin/modal\ncli_bin=\"\"").unwrap();
        assert!(config.cli_bin.is_none());
    }

    #[test]
    fn invalid_integer_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("log_retention=lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { ref key, .. } if key == "log_retention"));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("just some words"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn empty_env_name_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("token_id_env="),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
        assert_eq!(Config::unquote("\""), "\"");
    }

    #[test]
    fn relative_working_dirs_resolve_under_projects_dir() {
        let mut config = Config::default();
        config.resolve_paths(Path::new("/opt/app"));
        assert_eq!(config.projects_dir, PathBuf::from("/opt/app/data/projects"));
        assert_eq!(
            config.resolve_working_dir(Path::new("redis-server")),
            PathBuf::from("/opt/app/data/projects/redis-server")
        );
        assert_eq!(
            config.resolve_working_dir(Path::new("/tmp/elsewhere")),
            PathBuf::from("/tmp/elsewhere")
        );
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dispatch.conf");
        std::fs::write(&path, "temp_prefix=_env_\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.temp_prefix, "_env_");
    }
}
