//! HTTP shell around the IPC surface: one route per method, signals over
//! server-sent events. The wire shapes here are an adapter detail; clients
//! of the daemon talk to [`crate::ipc::IpcSurface`] semantics.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::ipc::IpcSurface;

pub fn router(surface: Arc<IpcSurface>) -> Router {
  return Router::new()
    .route("/api/jobs", get(list_jobs_handler))
    .route("/api/jobs/{name}/status", get(job_status_handler))
    .route("/api/jobs/{name}/info", get(job_info_handler))
    .route("/api/jobs/{name}/run", post(run_job_handler))
    .route("/api/jobs/{name}/mount", post(mount_handler))
    .route("/api/jobs/{name}/umount", post(umount_handler))
    .route("/api/pause", get(get_pause_handler).post(set_pause_handler))
    .route("/api/shutdown", post(shutdown_handler))
    .route("/api/events", get(events_handler))
    .with_state(surface);
}

#[derive(Debug, Serialize)]
struct ListJobsResponse {
  jobs: Vec<String>,
}

async fn list_jobs_handler(State(surface): State<Arc<IpcSurface>>) -> Json<ListJobsResponse> {
  return Json(ListJobsResponse {
    jobs: surface.get_loaded_jobs(),
  });
}

async fn job_status_handler(
  State(surface): State<Arc<IpcSurface>>,
  Path(name): Path<String>,
) -> Json<BTreeMap<String, String>> {
  return Json(surface.get_job_status(&name).await);
}

async fn job_info_handler(
  State(surface): State<Arc<IpcSurface>>,
  Path(name): Path<String>,
) -> Json<serde_json::Value> {
  return Json(surface.get_job_info(&name).await);
}

#[derive(Debug, Serialize)]
struct OkResponse {
  ok: bool,
}

async fn run_job_handler(
  State(surface): State<Arc<IpcSurface>>,
  Path(name): Path<String>,
) -> Json<OkResponse> {
  return Json(OkResponse {
    ok: surface.run_job(&name),
  });
}

#[derive(Debug, Serialize)]
struct MountResponse {
  /// Empty when mounting failed or the job is unknown.
  mount_dir: String,
}

async fn mount_handler(
  State(surface): State<Arc<IpcSurface>>,
  Path(name): Path<String>,
) -> Json<MountResponse> {
  return Json(MountResponse {
    mount_dir: surface.mount_repo(&name).await,
  });
}

async fn umount_handler(
  State(surface): State<Arc<IpcSurface>>,
  Path(name): Path<String>,
) -> Json<OkResponse> {
  return Json(OkResponse {
    ok: surface.umount_repo(&name).await,
  });
}

#[derive(Debug, Deserialize, Serialize)]
struct PauseState {
  paused: bool,
}

async fn get_pause_handler(State(surface): State<Arc<IpcSurface>>) -> Json<PauseState> {
  return Json(PauseState {
    paused: surface.get_pause(),
  });
}

async fn set_pause_handler(
  State(surface): State<Arc<IpcSurface>>,
  Json(request): Json<PauseState>,
) -> Json<PauseState> {
  surface.set_pause(request.paused);
  return Json(PauseState {
    paused: surface.get_pause(),
  });
}

async fn shutdown_handler(State(surface): State<Arc<IpcSurface>>) -> StatusCode {
  surface.shutdown();
  return StatusCode::ACCEPTED;
}

async fn events_handler(
  State(surface): State<Arc<IpcSurface>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
  let stream = BroadcastStream::new(surface.subscribe())
    .filter_map(|signal| signal.ok())
    .map(|signal| Event::default().json_data(&signal));
  return Sse::new(stream).keep_alive(KeepAlive::default());
}
