use chrono::Utc;
use log::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::config::StatConfig;
use crate::hook::Hook;
use crate::job::Job;
use crate::schedule::Schedule;

pub const STAT_DT_KEY: &str = "stat_dt";
pub const INFO_JSON_ENV: &str = "BSRV_INFO_JSON";

/// Periodic freshness audit over the jobs carrying a `stat_maxage`: on its
/// own schedule, fetch every job's actual last archive time (bypassing the
/// daemon cache) and fire the satisfied or failed hook with a JSON report in
/// the environment.
pub struct StatService {
  jobs: Vec<Arc<Job>>,
  schedule: Schedule,
  cache: Arc<Cache>,
  hook_satisfied: Hook,
  hook_failed: Hook,
}

impl StatService {
  pub fn new(
    jobs: Vec<Arc<Job>>,
    schedule: Schedule,
    cache: Arc<Cache>,
    cfg: &StatConfig,
  ) -> StatService {
    let parent = "stat";
    return StatService {
      jobs,
      schedule,
      cache,
      hook_satisfied: Hook::new(
        "hook_satisfied",
        parent,
        &cfg.hook_satisfied,
        cfg.hook_timeout,
        None,
      ),
      hook_failed: Hook::new("hook_failed", parent, &cfg.hook_failed, cfg.hook_timeout, None),
    };
  }

  /// Runs until `shutdown` yields.
  pub async fn run(&self, shutdown: &mut mpsc::UnboundedReceiver<()>) {
    let mut last_stat = self.cache.get_datetime(STAT_DT_KEY);
    debug!("Loaded last stat datetime: {last_stat:?}");

    loop {
      let next_stat = self.schedule.next(last_stat.unwrap_or_else(Utc::now));
      let delay = (next_stat - Utc::now()).to_std().unwrap_or_default();
      debug!("Determined next stat at {next_stat}, waiting for {delay:?}");

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.recv() => {
          info!("Exiting");
          return;
        }
      }

      self.audit().await;

      let now = Utc::now();
      self.cache.set_datetime(STAT_DT_KEY, now).await;
      last_stat = Some(now);
    }
  }

  /// One audit round: classify every job and fire the matching hook.
  pub(crate) async fn audit(&self) {
    let now = Utc::now();
    let mut satisfied = true;
    let mut report = serde_json::Map::new();

    for job in &self.jobs {
      let Some(maxage) = job.stat_maxage() else {
        continue;
      };
      let last = job.get_last_archive_datetime(false).await;

      let status = match last {
        Some(last) if now - last > maxage => {
          satisfied = false;
          "failed"
        }
        Some(_) => "satisfied",
        None => {
          satisfied = false;
          "unknown"
        }
      };
      info!("[STAT] Job '{}': {status}", job.name());

      report.insert(
        job.name().to_string(),
        json!({
          "status": status,
          "last": last.map(|dt| dt.to_rfc3339()),
          "age": last.map(|dt| (now - dt).num_seconds()),
          "maxage": maxage.num_seconds(),
        }),
      );
    }

    let env = HashMap::from([(
      INFO_JSON_ENV.to_string(),
      Value::Object(report).to_string(),
    )]);
    if satisfied {
      self.hook_satisfied.trigger(env);
    } else {
      self.hook_failed.trigger(env);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, JobConfig};
  use crate::data_dir::BaseDir;
  use std::os::unix::fs::PermissionsExt;
  use std::path::Path;
  use std::time::Duration as StdDuration;

  fn write_stub(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    return path.display().to_string();
  }

  fn stat_job(name: &str, binary: &str, maxage: &str) -> Arc<Job> {
    let cfg = JobConfig {
      repo: Some(format!("/tmp/{name}-repo")),
      passphrase: Some("test".to_string()),
      transport: "ssh".to_string(),
      schedule: Some("@daily".to_string()),
      stat_maxage: Some(maxage.to_string()),
      hook_timeout: 10,
      ..JobConfig::default()
    };
    let mut config = Config::default();
    config.borg.binary = binary.to_string();
    let dirs = BaseDir::new("/tmp/bsrv-test-base", "/tmp/bsrv-test-mount");
    return Arc::new(Job::from_config(name, &cfg, &config, &dirs, &Cache::test_empty()).unwrap());
  }

  async fn wait_for_file(path: &Path) -> String {
    for _ in 0..100 {
      if let Ok(contents) = tokio::fs::read_to_string(path).await {
        return contents;
      }
      tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    panic!("hook never wrote {}", path.display());
  }

  #[tokio::test]
  async fn test_stale_job_fires_failed_hook_with_report() {
    let tmp = tempfile::tempdir().unwrap();
    let listing = write_stub(
      tmp.path(),
      "borg-stub",
      r#"echo '{"archives": [{"time": "2000-01-01T00:00:00"}]}'"#,
    );
    let report_file = tmp.path().join("report");

    let mut cfg = StatConfig::default();
    cfg.hook_failed = format!("sh -c 'echo $BSRV_INFO_JSON > {}'", report_file.display());

    let service = StatService::new(
      vec![stat_job("old", &listing, "2d")],
      "@daily".parse().unwrap(),
      Arc::new(Cache::test_empty()),
      &cfg,
    );

    service.audit().await;

    let report: Value = serde_json::from_str(&wait_for_file(&report_file).await).unwrap();
    assert_eq!(report["old"]["status"], "failed");
    assert_eq!(report["old"]["maxage"], 2 * 24 * 3600);
    assert!(report["old"]["age"].as_i64().unwrap() > 2 * 24 * 3600);
  }

  #[tokio::test]
  async fn test_fresh_jobs_fire_satisfied_hook() {
    let tmp = tempfile::tempdir().unwrap();
    let now = Utc::now().to_rfc3339();
    let listing = write_stub(
      tmp.path(),
      "borg-stub",
      &format!(r#"echo '{{"archives": [{{"time": "{now}"}}]}}'"#),
    );
    let report_file = tmp.path().join("report");

    let mut cfg = StatConfig::default();
    cfg.hook_satisfied = format!("sh -c 'echo $BSRV_INFO_JSON > {}'", report_file.display());
    cfg.hook_failed = "sh -c 'exit 1'".to_string();

    let service = StatService::new(
      vec![stat_job("fresh", &listing, "2d")],
      "@daily".parse().unwrap(),
      Arc::new(Cache::test_empty()),
      &cfg,
    );

    service.audit().await;

    let report: Value = serde_json::from_str(&wait_for_file(&report_file).await).unwrap();
    assert_eq!(report["fresh"]["status"], "satisfied");
  }

  #[tokio::test]
  async fn test_unlistable_job_is_unknown() {
    let tmp = tempfile::tempdir().unwrap();
    let report_file = tmp.path().join("report");

    let mut cfg = StatConfig::default();
    cfg.hook_failed = format!("sh -c 'echo $BSRV_INFO_JSON > {}'", report_file.display());

    let service = StatService::new(
      vec![stat_job("gone", "false", "2d")],
      "@daily".parse().unwrap(),
      Arc::new(Cache::test_empty()),
      &cfg,
    );

    service.audit().await;

    let report: Value = serde_json::from_str(&wait_for_file(&report_file).await).unwrap();
    assert_eq!(report["gone"]["status"], "unknown");
    assert!(report["gone"]["last"].is_null());
  }
}
