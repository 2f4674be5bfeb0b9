//! Configuration for spawned task processes.
//!
//! Configuration can be set via environment variables:
//! - `CMDTASK_WORKING_DIR` - Optional. Working directory for spawned processes. Defaults to the caller's cwd.
//! - `CMDTASK_LOG_STDERR` - Optional. Forward child stderr lines to `tracing` at debug level. Defaults to `false`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How a [`ProcessRunner`](crate::runner::ProcessRunner) starts its child.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Working directory for the child (inherits the caller's when `None`)
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables set on the child
    pub envs: Vec<(String, String)>,

    /// Pipe stderr and log each line; otherwise stderr is discarded
    pub log_stderr: bool,
}

impl ProcessConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `CMDTASK_LOG_STDERR` is not a boolean.
    pub fn from_env() -> Result<Self, ConfigError> {
        let working_dir = std::env::var("CMDTASK_WORKING_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let log_stderr = match std::env::var("CMDTASK_LOG_STDERR") {
            Ok(value) => parse_flag("CMDTASK_LOG_STDERR", &value)?,
            Err(_) => false,
        };

        Ok(Self {
            working_dir,
            envs: Vec::new(),
            log_stderr,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_stderr_logging(mut self, enabled: bool) -> Self {
        self.log_stderr = enabled;
        self
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("expected a boolean, got '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_inherits_everything() {
        let config = ProcessConfig::default();
        assert!(config.working_dir.is_none());
        assert!(config.envs.is_empty());
        assert!(!config.log_stderr);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(parse_flag("X", " on ").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(!parse_flag("X", "").unwrap());

        let err = parse_flag("CMDTASK_LOG_STDERR", "maybe").unwrap_err();
        assert!(err.to_string().contains("CMDTASK_LOG_STDERR"));
    }

    // Tests touching process environment variables hold this lock
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env_vars<T>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (key, value) in vars {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
        let result = f();
        for (key, _) in vars {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_from_env_unset() {
        let config = with_env_vars(
            &[("CMDTASK_WORKING_DIR", None), ("CMDTASK_LOG_STDERR", None)],
            ProcessConfig::from_env,
        )
        .unwrap();
        assert!(config.working_dir.is_none());
        assert!(!config.log_stderr);
    }

    #[test]
    fn test_from_env_reads_values() {
        let config = with_env_vars(
            &[
                ("CMDTASK_WORKING_DIR", Some("/srv/build")),
                ("CMDTASK_LOG_STDERR", Some("yes")),
            ],
            ProcessConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.working_dir, Some(PathBuf::from("/srv/build")));
        assert!(config.log_stderr);
        assert!(config.envs.is_empty());
    }

    #[test]
    fn test_from_env_blank_working_dir_is_ignored() {
        let config = with_env_vars(
            &[("CMDTASK_WORKING_DIR", Some("   ")), ("CMDTASK_LOG_STDERR", None)],
            ProcessConfig::from_env,
        )
        .unwrap();
        assert!(config.working_dir.is_none());
    }

    #[test]
    fn test_from_env_rejects_bad_flag() {
        let err = with_env_vars(
            &[("CMDTASK_WORKING_DIR", None), ("CMDTASK_LOG_STDERR", Some("sometimes"))],
            ProcessConfig::from_env,
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidValue(var, reason) => {
                assert_eq!(var, "CMDTASK_LOG_STDERR");
                assert!(reason.contains("sometimes"));
            }
        }
    }

    #[test]
    fn test_builder_helpers() {
        let config = ProcessConfig::default()
            .with_working_dir("/tmp")
            .with_env("LANG", "C")
            .with_stderr_logging(true);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.envs, vec![("LANG".to_string(), "C".to_string())]);
        assert!(config.log_stderr);
    }
}
