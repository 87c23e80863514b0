use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read config file '{path}': {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Failed to parse config file '{path}': {source}")]
  Parse {
    path: PathBuf,
    source: toml::de::Error,
  },
}

/// Daemon configuration, parsed once at startup. Job entries are validated
/// individually when the corresponding [`crate::job::Job`] is built, so a
/// single bad job does not take the daemon down.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default)]
  pub borg: BorgConfig,
  #[serde(default)]
  pub log: LogConfig,
  #[serde(default)]
  pub stat: StatConfig,
  #[serde(default)]
  pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BorgConfig {
  /// Name or path of the backup binary.
  #[serde(default = "default_binary")]
  pub binary: String,
  /// Becomes BORG_BASE_DIR for every invocation; also holds the cache file.
  #[serde(default = "default_base_dir")]
  pub base_dir: PathBuf,
  /// Parent directory for per-job repository mounts.
  #[serde(default = "default_mount_dir")]
  pub mount_dir: PathBuf,
}

impl Default for BorgConfig {
  fn default() -> Self {
    return BorgConfig {
      binary: default_binary(),
      base_dir: default_base_dir(),
      mount_dir: default_mount_dir(),
    };
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
  /// Default env_logger filter; RUST_LOG overrides.
  #[serde(default = "default_log_level")]
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    return LogConfig {
      level: default_log_level(),
    };
  }
}

/// Settings for the companion stat service (`bsrvd statd`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatConfig {
  pub schedule: Option<String>,
  #[serde(default = "default_hook_timeout")]
  pub hook_timeout: u64,
  #[serde(default)]
  pub hook_satisfied: String,
  #[serde(default)]
  pub hook_failed: String,
}

impl Default for StatConfig {
  fn default() -> Self {
    return StatConfig {
      schedule: None,
      hook_timeout: default_hook_timeout(),
      hook_satisfied: String::new(),
      hook_failed: String::new(),
    };
  }
}

/// One `[jobs.<name>]` section. Fields required to actually run the job are
/// optional here and checked in `Job::from_config`, matching the daemon's
/// drop-the-job-keep-running policy for incomplete sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
  pub repo: Option<String>,
  pub passphrase: Option<String>,
  #[serde(default = "default_transport")]
  pub transport: String,
  #[serde(default = "default_archive_name_template")]
  pub archive_name_template: String,
  pub create_args: Option<Vec<String>>,
  pub prune_args: Option<Vec<String>>,
  pub schedule: Option<String>,
  #[serde(default = "default_retry_delay")]
  pub retry_delay: u64,
  #[serde(default = "default_retry_max")]
  pub retry_max: i32,
  /// Maximum archive age before the stat service reports the job failed,
  /// e.g. "2d" or "1w 12h". Enables stat tracking for this job.
  pub stat_maxage: Option<String>,
  #[serde(default = "default_hook_timeout")]
  pub hook_timeout: u64,
  /// User hook subprocesses are demoted to, when verifiable.
  pub run_as: Option<String>,
  #[serde(default)]
  pub hooks: HookCommands,
}

/// Operator-supplied commands fired on job lifecycle transitions. Empty
/// strings are no-ops.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookCommands {
  #[serde(default)]
  pub run_successful: String,
  #[serde(default)]
  pub run_failed: String,
  #[serde(default)]
  pub list_successful: String,
  #[serde(default)]
  pub list_failed: String,
  #[serde(default)]
  pub mount_successful: String,
  #[serde(default)]
  pub mount_failed: String,
  #[serde(default)]
  pub umount_successful: String,
  #[serde(default)]
  pub umount_failed: String,
  #[serde(default)]
  pub give_up: String,
}

fn default_binary() -> String {
  return "borg".to_string();
}

fn default_base_dir() -> PathBuf {
  return PathBuf::from("/var/cache/bsrvd");
}

fn default_mount_dir() -> PathBuf {
  return PathBuf::from("/tmp/bsrvd-mount");
}

fn default_log_level() -> String {
  return "info".to_string();
}

fn default_transport() -> String {
  return "ssh".to_string();
}

fn default_archive_name_template() -> String {
  return "%Y-%m-%d_%H-%M-%S".to_string();
}

fn default_retry_delay() -> u64 {
  return 60;
}

fn default_retry_max() -> i32 {
  return 3;
}

fn default_hook_timeout() -> u64 {
  return 60;
}

impl Config {
  pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = tokio::fs::read_to_string(path)
      .await
      .map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
      })?;
    return toml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.borg.binary, "borg");
    assert_eq!(config.borg.base_dir, PathBuf::from("/var/cache/bsrvd"));
    assert_eq!(config.log.level, "info");
    assert!(config.jobs.is_empty());
    assert!(config.stat.schedule.is_none());
  }

  #[test]
  fn test_full_job_section() {
    let config: Config = toml::from_str(
      r#"
        [borg]
        binary = "/usr/local/bin/borg"
        base_dir = "/srv/bsrvd"

        [jobs.etc]
        repo = "backup@host:etc"
        passphrase = "secret"
        create_args = ["/etc"]
        prune_args = ["--keep-daily=7"]
        schedule = "@daily"
        retry_delay = 120
        retry_max = 5
        stat_maxage = "2d"
        run_as = "backup"
        hooks.run_failed = "notify-send 'backup failed'"
      "#,
    )
    .unwrap();

    let job = config.jobs.get("etc").unwrap();
    assert_eq!(job.repo.as_deref(), Some("backup@host:etc"));
    assert_eq!(job.transport, "ssh");
    assert_eq!(job.archive_name_template, "%Y-%m-%d_%H-%M-%S");
    assert_eq!(job.retry_delay, 120);
    assert_eq!(job.retry_max, 5);
    assert_eq!(job.hooks.run_failed, "notify-send 'backup failed'");
    assert_eq!(job.hooks.run_successful, "");
  }

  #[test]
  fn test_unknown_keys_are_rejected() {
    assert!(toml::from_str::<Config>("[borg]\nbinry = \"borg\"\n").is_err());
  }
}
