use log::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::scheduler::Scheduler;

/// The two signals the daemon emits towards IPC clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
  StatusUpdate {
    job: String,
    status: String,
    retry: i32,
  },
  PauseChanged {
    paused: bool,
  },
}

/// Protocol-agnostic IPC surface over the scheduler: the method table
/// clients call and the signal feed they subscribe to. The HTTP adapter in
/// [`crate::api`] is one shell around this object.
pub struct IpcSurface {
  scheduler: Arc<Scheduler>,
  signals: broadcast::Sender<Signal>,
  shutdown_tx: mpsc::UnboundedSender<()>,
}

impl IpcSurface {
  /// Wires the scheduler's observer callbacks into the signal feed.
  pub fn new(scheduler: Arc<Scheduler>, shutdown_tx: mpsc::UnboundedSender<()>) -> Arc<IpcSurface> {
    let (signals, _) = broadcast::channel(64);

    {
      let signals = signals.clone();
      scheduler.set_status_callback(move |job, status, retry| {
        let _ = signals.send(Signal::StatusUpdate {
          job: job.to_string(),
          status: status.as_str().to_string(),
          retry,
        });
      });
    }
    {
      let signals = signals.clone();
      scheduler.set_pause_callback(move |paused| {
        let _ = signals.send(Signal::PauseChanged { paused });
      });
    }

    return Arc::new(IpcSurface {
      scheduler,
      signals,
      shutdown_tx,
    });
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
    return self.signals.subscribe();
  }

  pub fn get_loaded_jobs(&self) -> Vec<String> {
    return self.scheduler.loaded_jobs();
  }

  /// Status map of the named job; empty for unknown names.
  pub async fn get_job_status(&self, job_name: &str) -> BTreeMap<String, String> {
    let Some(job) = self.scheduler.find_job_by_name(job_name) else {
      return BTreeMap::new();
    };
    return self.scheduler.get_job_status(&job).await;
  }

  /// Scheduler status, archive listing and repository info of the named job.
  pub async fn get_job_info(&self, job_name: &str) -> serde_json::Value {
    let Some(job) = self.scheduler.find_job_by_name(job_name) else {
      return serde_json::json!({});
    };
    return self.scheduler.get_job_info(&job).await;
  }

  /// Advances the named job to fire immediately. False for unknown names.
  pub fn run_job(&self, job_name: &str) -> bool {
    let Some(job) = self.scheduler.find_job_by_name(job_name) else {
      return false;
    };
    if self.scheduler.advance_to_now(&job) {
      return true;
    }
    // Not queued anywhere (e.g. registration never found a reference time).
    return self.scheduler.schedule(&job, chrono::Utc::now());
  }

  /// Mounts the repository and reports the mount path, empty on failure.
  pub async fn mount_repo(&self, job_name: &str) -> String {
    let Some(job) = self.scheduler.find_job_by_name(job_name) else {
      return String::new();
    };
    if job.mount().await {
      return job.mount_dir().display().to_string();
    }
    return String::new();
  }

  pub async fn umount_repo(&self, job_name: &str) -> bool {
    let Some(job) = self.scheduler.find_job_by_name(job_name) else {
      return false;
    };
    return job.umount().await;
  }

  pub fn set_pause(&self, paused: bool) {
    if paused {
      self.scheduler.pause();
    } else {
      self.scheduler.unpause();
    }
  }

  pub fn get_pause(&self) -> bool {
    return self.scheduler.paused();
  }

  /// Requests daemon termination.
  pub fn shutdown(&self) {
    info!("Received shutdown command over IPC");
    let _ = self.shutdown_tx.send(());
  }
}
