//! End-to-end exercise of the HTTP adapter: a daemon wired from a TOML
//! config with a stubbed backup binary, driven through the router.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use bsrv::{BaseDir, Cache, Config, IpcSurface, Job, Scheduler};

fn write_stub(dir: &Path, body: &str) -> String {
  let path = dir.join("borg-stub");
  std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
  let mut perms = std::fs::metadata(&path).unwrap().permissions();
  perms.set_mode(0o755);
  std::fs::set_permissions(&path, perms).unwrap();
  return path.display().to_string();
}

async fn daemon(tmp: &Path) -> (Router, mpsc::UnboundedReceiver<()>) {
  let stub = write_stub(
    tmp,
    r#"if [ "$1" = list ]; then echo '{"archives": [{"name": "a", "time": "2024-01-01T00:00:00"}]}'; fi
exit 0"#,
  );

  let config: Config = toml::from_str(&format!(
    r#"
      [borg]
      binary = "{stub}"
      base_dir = "{base}"
      mount_dir = "{mount}"

      [jobs.etc]
      repo = "backup@host:etc"
      passphrase = "secret"
      create_args = ["/etc"]
      prune_args = ["--keep-daily=7"]
      schedule = "@daily"
    "#,
    base = tmp.join("base").display(),
    mount = tmp.join("mount").display(),
  ))
  .unwrap();

  let dirs = BaseDir::new(&config.borg.base_dir, &config.borg.mount_dir);
  dirs.ensure_directory_structure().await.unwrap();

  let cache = Arc::new(Cache::open(dirs.cache_path("bsrvd.cache")).await);
  let scheduler = Arc::new(Scheduler::new(cache.clone()));
  for (name, job_cfg) in &config.jobs {
    let job = Job::from_config(name, job_cfg, &config, &dirs, &cache).unwrap();
    scheduler.register(Arc::new(job)).await;
  }

  let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
  let surface = IpcSurface::new(scheduler, shutdown_tx);
  return (bsrv::api::router(surface), shutdown_rx);
}

async fn get_json(router: &Router, uri: &str) -> serde_json::Value {
  let response = router
    .clone()
    .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  return serde_json::from_slice(&bytes).unwrap();
}

async fn post_json(router: &Router, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
  let mut builder = Request::builder().method("POST").uri(uri);
  let body = match body {
    Some(contents) => {
      builder = builder.header("content-type", "application/json");
      Body::from(contents.to_string())
    }
    None => Body::empty(),
  };
  let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
  let status = response.status();
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  return (status, bytes.to_vec());
}

#[tokio::test]
async fn test_job_listing_and_status() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, _shutdown) = daemon(tmp.path()).await;

  let jobs = get_json(&router, "/api/jobs").await;
  assert_eq!(jobs["jobs"], serde_json::json!(["etc"]));

  let status = get_json(&router, "/api/jobs/etc/status").await;
  assert_eq!(status["schedule_status"], "wait");
  assert_eq!(status["job_retry"], "0");
  // Reference time came from the stubbed archive listing.
  assert_eq!(status["job_last_successful"], "2024-01-01T00:00:00+00:00");

  // Unknown names yield an empty map, not an error.
  let unknown = get_json(&router, "/api/jobs/ghost/status").await;
  assert_eq!(unknown, serde_json::json!({}));
}

#[tokio::test]
async fn test_job_info_merges_scheduler_and_archives() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, _shutdown) = daemon(tmp.path()).await;

  let info = get_json(&router, "/api/jobs/etc/info").await;
  assert_eq!(info["scheduler"]["schedule_status"], "wait");
  assert_eq!(info["archives"][0]["name"], "a");
}

#[tokio::test]
async fn test_run_job_round_trip() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, _shutdown) = daemon(tmp.path()).await;

  let (status, body) = post_json(&router, "/api/jobs/etc/run", None).await;
  assert_eq!(status, StatusCode::OK);
  let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(body["ok"], serde_json::json!(true));

  let (_, body) = post_json(&router, "/api/jobs/ghost/run", None).await;
  let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(body["ok"], serde_json::json!(false));
}

#[tokio::test]
async fn test_pause_round_trip() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, _shutdown) = daemon(tmp.path()).await;

  let paused = get_json(&router, "/api/pause").await;
  assert_eq!(paused["paused"], serde_json::json!(false));

  let (status, body) = post_json(&router, "/api/pause", Some(r#"{"paused": true}"#)).await;
  assert_eq!(status, StatusCode::OK);
  let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(body["paused"], serde_json::json!(true));

  let paused = get_json(&router, "/api/pause").await;
  assert_eq!(paused["paused"], serde_json::json!(true));
}

#[tokio::test]
async fn test_shutdown_signals_daemon() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, mut shutdown) = daemon(tmp.path()).await;

  let (status, _) = post_json(&router, "/api/shutdown", None).await;
  assert_eq!(status, StatusCode::ACCEPTED);
  assert_eq!(shutdown.recv().await, Some(()));
}

#[tokio::test]
async fn test_events_endpoint_is_a_stream() {
  let tmp = tempfile::tempdir().unwrap();
  let (router, _shutdown) = daemon(tmp.path()).await;

  let response = router
    .clone()
    .oneshot(
      Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .unwrap(),
    )
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()["content-type"].to_str().unwrap(),
    "text/event-stream"
  );
}
