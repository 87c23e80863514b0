use chrono::{DateTime, Local, NaiveDateTime, Utc};
use log::*;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;

use crate::cache::Cache;
use crate::config::{Config, JobConfig};
use crate::data_dir::BaseDir;
use crate::hook::Hook;
use crate::proc;
use crate::schedule::{Schedule, ScheduleParseError};

pub const JOB_ENV: &str = "BSRV_JOB";
pub const ERROR_ENV: &str = "BSRV_ERROR";

#[derive(Debug, Error)]
pub enum JobConfigError {
  #[error("Missing key '{0}'")]
  MissingKey(&'static str),
  #[error("Invalid schedule: {0}")]
  Schedule(#[from] ScheduleParseError),
  #[error("Invalid stat_maxage: {0}")]
  StatMaxage(ScheduleParseError),
}

/// The nine operator hooks of a job, fired on lifecycle transitions.
pub struct JobHooks {
  pub run_successful: Hook,
  pub run_failed: Hook,
  pub list_successful: Hook,
  pub list_failed: Hook,
  pub mount_successful: Hook,
  pub mount_failed: Hook,
  pub umount_successful: Hook,
  pub umount_failed: Hook,
  pub give_up: Hook,
}

struct JobState {
  /// 0: last attempt succeeded or never ran, >0: retries since the last
  /// success, -1: gave up until the next natural schedule slot.
  retry_count: i32,
  last_archive: Option<DateTime<Utc>>,
}

/// One configured backup target: the borg parameters, the schedule, the
/// retry policy, and the hook bundle. Mutable bookkeeping lives behind a
/// mutex so workers and the IPC surface can share the job.
pub struct Job {
  name: String,
  repo: String,
  transport: String,
  passphrase: String,
  archive_name_template: String,
  create_args: Vec<String>,
  prune_args: Vec<String>,
  schedule: Schedule,
  schedule_text: String,
  retry_delay: chrono::Duration,
  retry_max: i32,
  stat_maxage: Option<chrono::Duration>,
  /// False for status-only registration without create/prune arguments.
  runnable: bool,
  mount_dir: PathBuf,
  borg_binary: String,
  borg_base_dir: PathBuf,
  hooks: JobHooks,
  state: Mutex<JobState>,
}

impl PartialEq for Job {
  fn eq(&self, other: &Self) -> bool {
    return self.name == other.name;
  }
}

struct Invocation {
  success: bool,
  stdout: String,
  stderr: String,
}

impl Invocation {
  fn combined(&self) -> String {
    return format!("{}{}", self.stdout, self.stderr);
  }
}

impl Job {
  pub fn from_config(
    name: &str,
    cfg: &JobConfig,
    config: &Config,
    dirs: &BaseDir,
    cache: &Cache,
  ) -> Result<Job, JobConfigError> {
    let repo = cfg
      .repo
      .clone()
      .ok_or(JobConfigError::MissingKey("repo"))?;
    let passphrase = cfg
      .passphrase
      .clone()
      .ok_or(JobConfigError::MissingKey("passphrase"))?;
    let schedule_text = cfg
      .schedule
      .clone()
      .ok_or(JobConfigError::MissingKey("schedule"))?;
    let schedule: Schedule = schedule_text.parse()?;

    let stat_maxage = cfg
      .stat_maxage
      .as_deref()
      .map(Schedule::parse_interval)
      .transpose()
      .map_err(JobConfigError::StatMaxage)?;

    let runnable = cfg.create_args.is_some() && cfg.prune_args.is_some();
    let run_as = cfg.run_as.as_deref();
    let hook = |hook_name: &str, command: &str| {
      return Hook::new(hook_name, name, command, cfg.hook_timeout, run_as);
    };

    return Ok(Job {
      name: name.to_string(),
      repo,
      transport: cfg.transport.clone(),
      passphrase,
      archive_name_template: cfg.archive_name_template.clone(),
      create_args: cfg.create_args.clone().unwrap_or_default(),
      prune_args: cfg.prune_args.clone().unwrap_or_default(),
      schedule,
      schedule_text,
      retry_delay: chrono::Duration::seconds(cfg.retry_delay as i64),
      retry_max: cfg.retry_max,
      stat_maxage,
      runnable,
      mount_dir: dirs.mount_path(name),
      borg_binary: config.borg.binary.clone(),
      borg_base_dir: config.borg.base_dir.clone(),
      hooks: JobHooks {
        run_successful: hook("run_successful", &cfg.hooks.run_successful),
        run_failed: hook("run_failed", &cfg.hooks.run_failed),
        list_successful: hook("list_successful", &cfg.hooks.list_successful),
        list_failed: hook("list_failed", &cfg.hooks.list_failed),
        mount_successful: hook("mount_successful", &cfg.hooks.mount_successful),
        mount_failed: hook("mount_failed", &cfg.hooks.mount_failed),
        umount_successful: hook("umount_successful", &cfg.hooks.umount_successful),
        umount_failed: hook("umount_failed", &cfg.hooks.umount_failed),
        give_up: hook("give_up", &cfg.hooks.give_up),
      },
      state: Mutex::new(JobState {
        retry_count: 0,
        last_archive: cache.get_datetime(&Cache::cache_key_last_archive(name)),
      }),
    });
  }

  pub fn name(&self) -> &str {
    return &self.name;
  }

  pub fn runnable(&self) -> bool {
    return self.runnable;
  }

  pub fn schedule(&self) -> &Schedule {
    return &self.schedule;
  }

  pub fn schedule_text(&self) -> &str {
    return &self.schedule_text;
  }

  pub fn mount_dir(&self) -> &PathBuf {
    return &self.mount_dir;
  }

  pub fn retry_delay(&self) -> chrono::Duration {
    return self.retry_delay;
  }

  pub fn retry_max(&self) -> i32 {
    return self.retry_max;
  }

  pub fn stat_maxage(&self) -> Option<chrono::Duration> {
    return self.stat_maxage;
  }

  pub fn hooks(&self) -> &JobHooks {
    return &self.hooks;
  }

  pub fn retry_count(&self) -> i32 {
    return self.state.lock().retry_count;
  }

  pub(crate) fn store_retry_count(&self, count: i32) {
    self.state.lock().retry_count = count;
  }

  pub fn last_archive(&self) -> Option<DateTime<Utc>> {
    return self.state.lock().last_archive;
  }

  pub(crate) fn set_last_archive(&self, at: DateTime<Utc>) {
    self.state.lock().last_archive = Some(at);
  }

  /// Environment for hook subprocesses.
  pub fn hook_env(&self) -> HashMap<String, String> {
    return HashMap::from([(JOB_ENV.to_string(), self.name.clone())]);
  }

  fn failure_env(&self, output: &str) -> HashMap<String, String> {
    let mut env = self.hook_env();
    env.insert(ERROR_ENV.to_string(), proc::encode_newlines(output));
    return env;
  }

  fn borg_env(&self) -> [(&'static str, String); 4] {
    return [
      ("BORG_REPO", self.repo.clone()),
      ("BORG_RSH", self.transport.clone()),
      ("BORG_PASSPHRASE", self.passphrase.clone()),
      ("BORG_BASE_DIR", self.borg_base_dir.display().to_string()),
    ];
  }

  async fn invoke(&self, argv: Vec<String>) -> Invocation {
    info!("[JOB] Running '{}'", proc::render_command(&argv));

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).envs(self.borg_env());

    match command.output().await {
      Ok(output) => {
        return Invocation {
          success: output.status.success(),
          stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
          stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
      }
      Err(err) => {
        error!("[JOB] Could not spawn '{}': {err}", argv[0]);
        return Invocation {
          success: false,
          stdout: String::new(),
          stderr: err.to_string(),
        };
      }
    }
  }

  fn borg_argv(&self, subcommand: &str) -> Vec<String> {
    return vec![self.borg_binary.clone(), subcommand.to_string()];
  }

  /// Creates a new archive, then prunes the repository. Prune is skipped when
  /// create fails. Fires `run_successful`/`run_failed` and reports overall
  /// success.
  pub async fn run(&self) -> bool {
    assert!(
      self.runnable,
      "job '{}' has no create/prune arguments",
      self.name
    );

    let archive_name = format!("::{}", Local::now().format(&self.archive_name_template));
    let mut create_argv = self.borg_argv("create");
    create_argv.push(archive_name);
    create_argv.extend(self.create_args.iter().cloned());

    let create = self.invoke(create_argv).await;
    proc::log_output_lines("[JOB]", &create.combined(), create.success);
    if !create.success {
      error!(
        "[JOB] borg create for job '{}' returned with non-zero exit code",
        self.name
      );
      warn!(
        "[JOB] Skipping borg prune for job '{}' due to previous error",
        self.name
      );
      self
        .hooks
        .run_failed
        .trigger(self.failure_env(&create.combined()));
      return false;
    }

    let mut prune_argv = self.borg_argv("prune");
    prune_argv.extend(self.prune_args.iter().cloned());

    let prune = self.invoke(prune_argv).await;
    proc::log_output_lines("[JOB]", &prune.combined(), prune.success);
    if !prune.success {
      error!(
        "[JOB] borg prune for job '{}' returned with non-zero exit code",
        self.name
      );
      self
        .hooks
        .run_failed
        .trigger(self.failure_env(&prune.combined()));
      return false;
    }

    self.hooks.run_successful.trigger(self.hook_env());
    return true;
  }

  /// The repository's archives as reported by `list --json`, or none when
  /// listing or parsing fails.
  pub async fn list_archives(&self) -> Option<Vec<Value>> {
    let mut argv = self.borg_argv("list");
    argv.push("--json".to_string());

    let listing = self.invoke(argv).await;
    if !listing.success {
      error!(
        "[JOB] borg list for job '{}' returned with non-zero exit code",
        self.name
      );
      proc::log_output_lines("[JOB]", &listing.combined(), false);
      self
        .hooks
        .list_failed
        .trigger(self.failure_env(&listing.combined()));
      return None;
    }

    let archives = serde_json::from_str::<Value>(&listing.stdout)
      .ok()
      .and_then(|value| value.get("archives").and_then(Value::as_array).cloned());
    match archives {
      Some(archives) => {
        self.hooks.list_successful.trigger(self.hook_env());
        return Some(archives);
      }
      None => {
        error!(
          "[JOB] Unparseable borg list output for job '{}'",
          self.name
        );
        self
          .hooks
          .list_failed
          .trigger(self.failure_env(&listing.combined()));
        return None;
      }
    }
  }

  /// Repository info from `info --json` merged with the archive listing.
  /// Individual failures degrade to empty maps.
  pub async fn get_info(&self) -> Value {
    let mut argv = self.borg_argv("info");
    argv.push("--json".to_string());

    let outcome = self.invoke(argv).await;
    let mut info = if outcome.success {
      serde_json::from_str::<Value>(&outcome.stdout).unwrap_or_else(|err| {
        warn!("[JOB] Unparseable borg info output for job '{}': {err}", self.name);
        json!({})
      })
    } else {
      error!(
        "[JOB] borg info for job '{}' returned with non-zero exit code",
        self.name
      );
      proc::log_output_lines("[JOB]", &outcome.combined(), false);
      json!({})
    };
    if !info.is_object() {
      info = json!({});
    }

    let archives = self.list_archives().await.unwrap_or_default();
    if let Some(map) = info.as_object_mut() {
      map.insert("archives".to_string(), Value::Array(archives));
    }
    return info;
  }

  /// Mounts the repository below the configured mount directory.
  pub async fn mount(&self) -> bool {
    if let Err(err) = tokio::fs::create_dir_all(&self.mount_dir).await {
      error!(
        "[JOB] Could not create mount dir '{}': {err}",
        self.mount_dir.display()
      );
      self
        .hooks
        .mount_failed
        .trigger(self.failure_env(&err.to_string()));
      return false;
    }

    let mut argv = self.borg_argv("mount");
    argv.push(self.repo.clone());
    argv.push(self.mount_dir.display().to_string());

    let outcome = self.invoke(argv).await;
    if outcome.success {
      self.hooks.mount_successful.trigger(self.hook_env());
      return true;
    }

    error!(
      "[JOB] borg mount for job '{}' returned with non-zero exit code",
      self.name
    );
    proc::log_output_lines("[JOB]", &outcome.combined(), false);
    self
      .hooks
      .mount_failed
      .trigger(self.failure_env(&outcome.combined()));
    return false;
  }

  pub async fn umount(&self) -> bool {
    let mut argv = self.borg_argv("umount");
    argv.push(self.mount_dir.display().to_string());

    let outcome = self.invoke(argv).await;
    if outcome.success {
      self.hooks.umount_successful.trigger(self.hook_env());
      return true;
    }

    error!(
      "[JOB] borg umount for job '{}' returned with non-zero exit code",
      self.name
    );
    proc::log_output_lines("[JOB]", &outcome.combined(), false);
    self
      .hooks
      .umount_failed
      .trigger(self.failure_env(&outcome.combined()));
    return false;
  }

  /// The instant of the last successful archive: the tracked value when
  /// `use_cache` holds one, otherwise the newest `time` from the archive
  /// listing (epoch zero for an empty repository, none when listing fails).
  pub async fn get_last_archive_datetime(&self, use_cache: bool) -> Option<DateTime<Utc>> {
    if use_cache {
      if let Some(last) = self.state.lock().last_archive {
        return Some(last);
      }
    }

    let Some(archives) = self.list_archives().await else {
      warn!(
        "Could not determine last successful archive datetime for job '{}'",
        self.name
      );
      return None;
    };

    let newest = archives
      .iter()
      .filter_map(|archive| archive.get("time").and_then(Value::as_str))
      .filter_map(parse_archive_time)
      .max();
    return Some(newest.unwrap_or(DateTime::UNIX_EPOCH));
  }

  /// The next instant this job should fire, relative to `last` or to the
  /// last known successful archive. None when no reference time is known.
  pub async fn get_next_archive_datetime(
    &self,
    last: Option<DateTime<Utc>>,
  ) -> Option<DateTime<Utc>> {
    let reference = match last {
      Some(last) => Some(last),
      None => self.get_last_archive_datetime(true).await,
    };
    return reference.map(|dt| self.schedule.next(dt));
  }

  pub async fn status(&self) -> BTreeMap<String, String> {
    let last = self.get_last_archive_datetime(true).await;
    return BTreeMap::from([
      (
        "job_last_successful".to_string(),
        last.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| "none".to_string()),
      ),
      (
        "job_next_suggested".to_string(),
        last
          .map(|dt| self.schedule.next(dt).to_rfc3339())
          .unwrap_or_else(|| "none".to_string()),
      ),
      ("job_retry".to_string(), self.retry_count().to_string()),
    ]);
  }
}

/// Borg reports archive times as naive local timestamps; newer versions emit
/// an offset.
fn parse_archive_time(text: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
    return Some(dt.with_timezone(&Utc));
  }
  return NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
    .ok()
    .map(|naive| naive.and_utc());
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;

  /// A job shelling out to `binary` instead of borg, with empty hooks.
  pub(crate) fn job_with_binary(name: &str, schedule: &str, binary: &str) -> Job {
    return job_with_retry(name, schedule, binary, 60, 3);
  }

  pub(crate) fn job_with_retry(
    name: &str,
    schedule: &str,
    binary: &str,
    retry_delay: u64,
    retry_max: i32,
  ) -> Job {
    let cfg = JobConfig {
      repo: Some(format!("/tmp/{name}-repo")),
      passphrase: Some("test".to_string()),
      transport: "ssh".to_string(),
      archive_name_template: "%Y-%m-%d_%H-%M-%S".to_string(),
      create_args: Some(vec![]),
      prune_args: Some(vec![]),
      schedule: Some(schedule.to_string()),
      retry_delay,
      retry_max,
      hook_timeout: 10,
      ..JobConfig::default()
    };

    let mut config = Config::default();
    config.borg.binary = binary.to_string();

    let dirs = BaseDir::new("/tmp/bsrv-test-base", "/tmp/bsrv-test-mount");
    let cache = Cache::test_empty();

    return Job::from_config(name, &cfg, &config, &dirs, &cache).unwrap();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;

  fn write_stub(dir: &Path, body: &str) -> String {
    let path = dir.join("borg-stub");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    return path.display().to_string();
  }

  #[tokio::test]
  async fn test_run_success() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("calls");
    let stub = write_stub(
      tmp.path(),
      &format!("echo \"$1\" >> {}\nexit 0", log.display()),
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(job.run().await);

    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.lines().collect::<Vec<_>>(), ["create", "prune"]);
  }

  #[tokio::test]
  async fn test_run_create_failure_skips_prune() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("calls");
    let stub = write_stub(
      tmp.path(),
      &format!(
        "echo \"$1\" >> {}\nif [ \"$1\" = create ]; then exit 2; fi\nexit 0",
        log.display()
      ),
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(!job.run().await);

    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.lines().collect::<Vec<_>>(), ["create"]);
  }

  #[tokio::test]
  async fn test_run_prune_failure_fails_overall() {
    let tmp = tempfile::tempdir().unwrap();
    let stub = write_stub(
      tmp.path(),
      "if [ \"$1\" = prune ]; then exit 2; fi\nexit 0",
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(!job.run().await);
  }

  #[tokio::test]
  async fn test_create_archive_name_is_prefixed() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("archive");
    let stub = write_stub(
      tmp.path(),
      &format!("if [ \"$1\" = create ]; then echo \"$2\" > {}; fi\nexit 0", log.display()),
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(job.run().await);

    let archive = std::fs::read_to_string(&log).unwrap();
    assert!(archive.starts_with("::"));
  }

  #[tokio::test]
  async fn test_subprocess_environment() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("env");
    let stub = write_stub(
      tmp.path(),
      &format!(
        "echo \"$BORG_REPO:$BORG_RSH:$BORG_PASSPHRASE:$BORG_BASE_DIR\" > {}\nexit 0",
        log.display()
      ),
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(job.run().await);

    let env = std::fs::read_to_string(&log).unwrap();
    assert_eq!(env.trim(), "/tmp/etc-repo:ssh:test:/var/cache/bsrvd");
  }

  #[tokio::test]
  async fn test_list_archives_parses_json() {
    let tmp = tempfile::tempdir().unwrap();
    let stub = write_stub(
      tmp.path(),
      r#"echo '{"archives": [{"name": "a", "time": "2024-01-01T01:00:00.000000"}]}'"#,
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    let archives = job.list_archives().await.unwrap();
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0]["name"], "a");
  }

  #[tokio::test]
  async fn test_list_archives_failure_returns_none() {
    let job = testing::job_with_binary("etc", "@hourly", "false");
    assert!(job.list_archives().await.is_none());

    // Garbage output is a list failure as well.
    let tmp = tempfile::tempdir().unwrap();
    let stub = write_stub(tmp.path(), "echo not-json");
    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert!(job.list_archives().await.is_none());
  }

  #[tokio::test]
  async fn test_last_archive_falls_back_to_listing() {
    let tmp = tempfile::tempdir().unwrap();
    let stub = write_stub(
      tmp.path(),
      r#"echo '{"archives": [{"time": "2024-01-01T01:00:00"}, {"time": "2024-02-01T01:00:00"}]}'"#,
    );

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    let last = job.get_last_archive_datetime(true).await.unwrap();
    assert_eq!(last.to_rfc3339(), "2024-02-01T01:00:00+00:00");
  }

  #[tokio::test]
  async fn test_empty_listing_yields_epoch_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let stub = write_stub(tmp.path(), r#"echo '{"archives": []}'"#);

    let job = testing::job_with_binary("etc", "@hourly", &stub);
    assert_eq!(
      job.get_last_archive_datetime(true).await,
      Some(DateTime::UNIX_EPOCH)
    );
  }

  #[tokio::test]
  async fn test_tracked_last_archive_wins_over_listing() {
    let job = testing::job_with_binary("etc", "@hourly", "false");
    let stamp = "2024-03-01T00:00:00+00:00".parse().unwrap();
    job.set_last_archive(stamp);

    assert_eq!(job.get_last_archive_datetime(true).await, Some(stamp));
    // Bypassing the tracked value consults the (failing) listing.
    assert_eq!(job.get_last_archive_datetime(false).await, None);
  }

  #[tokio::test]
  async fn test_get_info_degrades_to_empty_maps() {
    let job = testing::job_with_binary("etc", "@hourly", "false");
    let info = job.get_info().await;
    assert_eq!(info["archives"], json!([]));
  }

  #[tokio::test]
  async fn test_status_map() {
    let job = testing::job_with_binary("etc", "@hourly", "false");
    job.set_last_archive("2024-01-01T00:00:00+00:00".parse().unwrap());

    let status = job.status().await;
    assert_eq!(status["job_last_successful"], "2024-01-01T00:00:00+00:00");
    assert_eq!(status["job_next_suggested"], "2024-01-01T01:00:00+00:00");
    assert_eq!(status["job_retry"], "0");
  }

  #[test]
  fn test_missing_required_key_is_rejected() {
    let cfg = JobConfig {
      passphrase: Some("x".to_string()),
      schedule: Some("@daily".to_string()),
      ..JobConfig::default()
    };
    let dirs = BaseDir::new("/tmp/base", "/tmp/mount");
    let cache = Cache::test_empty();

    let result = Job::from_config("etc", &cfg, &Config::default(), &dirs, &cache);
    assert!(matches!(result, Err(JobConfigError::MissingKey("repo"))));
  }
}
