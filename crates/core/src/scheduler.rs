use chrono::{DateTime, Utc};
use log::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::job::Job;
use crate::queue::WaitQueue;

/// Scheduling state of a job as published to observers: a job is `Running`
/// in a worker, claimed as `Next` by the control task, `Wait`ing in the
/// queue, or `None` of those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
  Running,
  Next,
  Wait,
  None,
}

impl ScheduleStatus {
  pub fn as_str(&self) -> &'static str {
    return match self {
      ScheduleStatus::Running => "running",
      ScheduleStatus::Next => "next",
      ScheduleStatus::Wait => "wait",
      ScheduleStatus::None => "none",
    };
  }
}

/// Why the control task woke up. `Timer` is produced by the elapsed deadline
/// arm, everything else arrives over the wakeup channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
  Timer,
  Update,
  Pause(bool),
  Shutdown,
}

type StatusCallback = Box<dyn Fn(&str, ScheduleStatus, i32) + Send + Sync>;
type PauseCallback = Box<dyn Fn(bool) + Send + Sync>;

/// The bucket most recently popped by the control task: jobs that are past
/// the queue but not yet handed to workers.
#[derive(Default)]
struct Claimed {
  at: Option<DateTime<Utc>>,
  jobs: Vec<Arc<Job>>,
}

struct Shared {
  claimed: Mutex<Claimed>,
  running: Mutex<HashSet<String>>,
  paused: Mutex<bool>,
  status_callback: Mutex<Option<StatusCallback>>,
  pause_callback: Mutex<Option<PauseCallback>>,
}

impl Shared {
  fn observe(&self, name: &str, status: ScheduleStatus, retry: i32) {
    if let Some(ref callback) = *self.status_callback.lock() {
      callback(name, status, retry);
    }
  }

  fn emit_pause(&self, paused: bool) {
    if let Some(ref callback) = *self.pause_callback.lock() {
      callback(paused);
    }
  }
}

/// The shareable half of the scheduler: everything the control task and the
/// workers touch. Cheap to clone into spawned tasks.
#[derive(Clone)]
struct Core {
  jobs: Arc<Mutex<Vec<Arc<Job>>>>,
  queue: Arc<WaitQueue>,
  cache: Arc<Cache>,
  shared: Arc<Shared>,
}

/// Owns the job registry, the wait queue, one control task, and a transient
/// worker task per firing. Publishes per-job status transitions and pause
/// edges through registered callbacks.
pub struct Scheduler {
  core: Core,
  wakeup_tx: mpsc::UnboundedSender<Wakeup>,
  wakeup_rx: Mutex<Option<mpsc::UnboundedReceiver<Wakeup>>>,
  control: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
  pub fn new(cache: Arc<Cache>) -> Scheduler {
    let queue = Arc::new(WaitQueue::new());
    let (wakeup_tx, wakeup_rx) = mpsc::unbounded_channel();

    {
      let wakeup_tx = wakeup_tx.clone();
      queue.set_update_callback(move || {
        let _ = wakeup_tx.send(Wakeup::Update);
      });
    }

    return Scheduler {
      core: Core {
        jobs: Arc::new(Mutex::new(Vec::new())),
        queue,
        cache,
        shared: Arc::new(Shared {
          claimed: Mutex::new(Claimed::default()),
          running: Mutex::new(HashSet::new()),
          paused: Mutex::new(false),
          status_callback: Mutex::new(None),
          pause_callback: Mutex::new(None),
        }),
      },
      wakeup_tx,
      wakeup_rx: Mutex::new(Some(wakeup_rx)),
      control: Mutex::new(None),
    };
  }

  pub fn set_status_callback(
    &self,
    callback: impl Fn(&str, ScheduleStatus, i32) + Send + Sync + 'static,
  ) {
    *self.core.shared.status_callback.lock() = Some(Box::new(callback));
  }

  pub fn set_pause_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
    *self.core.shared.pause_callback.lock() = Some(Box::new(callback));
  }

  /// Appends `job` to the registry and enqueues it at its next natural slot,
  /// computed from the last known successful archive. A job with no known
  /// reference time stays registered but unscheduled.
  pub async fn register(&self, job: Arc<Job>) {
    self.core.jobs.lock().push(job.clone());

    match job.get_next_archive_datetime(None).await {
      Some(next) => {
        self.core.queue.put(job.clone(), next, false);
        info!("[Scheduler] Registered job '{}'", job.name());
      }
      None => {
        error!(
          "[Scheduler] Could not register job '{}', no last backup date",
          job.name()
        );
      }
    }
  }

  fn is_registered(&self, job: &Job) -> bool {
    return self.core.jobs.lock().iter().any(|j| j.name() == job.name());
  }

  /// Enqueues a registered job at `at`. False for unknown jobs.
  pub fn schedule(&self, job: &Arc<Job>, at: DateTime<Utc>) -> bool {
    if !self.is_registered(job) {
      return false;
    }
    self.core.queue.put(job.clone(), at, true);
    return true;
  }

  pub fn unschedule(&self, job: &Arc<Job>) -> bool {
    if !self.is_registered(job) {
      return false;
    }
    return self.core.queue.delete(job, true);
  }

  /// Moves `job` to fire immediately: out of the claimed bucket if the
  /// control task already popped it, otherwise out of the queue. The control
  /// task notices through the update wakeup before the old deadline elapses.
  pub fn advance_to_now(&self, job: &Arc<Job>) -> bool {
    let was_claimed = {
      let mut claimed = self.core.shared.claimed.lock();
      match claimed.jobs.iter().position(|j| j.name() == job.name()) {
        Some(index) => {
          claimed.jobs.remove(index);
          true
        }
        None => false,
      }
    };

    if was_claimed {
      self.core.queue.put(job.clone(), Utc::now(), true);
      return true;
    }
    return self.core.queue.move_to(job, Utc::now());
  }

  pub fn pause(&self) {
    *self.core.shared.paused.lock() = true;
    let _ = self.wakeup_tx.send(Wakeup::Pause(true));
  }

  pub fn unpause(&self) {
    *self.core.shared.paused.lock() = false;
    let _ = self.wakeup_tx.send(Wakeup::Pause(false));
  }

  pub fn paused(&self) -> bool {
    return *self.core.shared.paused.lock();
  }

  pub fn find_job_by_name(&self, name: &str) -> Option<Arc<Job>> {
    return self
      .core
      .jobs
      .lock()
      .iter()
      .find(|j| j.name() == name)
      .cloned();
  }

  pub fn loaded_jobs(&self) -> Vec<String> {
    return self
      .core
      .jobs
      .lock()
      .iter()
      .map(|j| j.name().to_string())
      .collect();
  }

  /// Status map for one job, resolving the scheduling state with strict
  /// priority running > next > wait > none.
  pub async fn get_job_status(&self, job: &Arc<Job>) -> BTreeMap<String, String> {
    let mut status = job.status().await;

    let (schedule_status, schedule_dt) = self.schedule_state(job);
    status.insert(
      "schedule_status".to_string(),
      schedule_status.as_str().to_string(),
    );
    status.insert("schedule_dt".to_string(), schedule_dt);
    return status;
  }

  fn schedule_state(&self, job: &Job) -> (ScheduleStatus, String) {
    if self.core.shared.running.lock().contains(job.name()) {
      return (ScheduleStatus::Running, "now".to_string());
    }

    {
      let claimed = self.core.shared.claimed.lock();
      if claimed.jobs.iter().any(|j| j.name() == job.name()) {
        let at = claimed
          .at
          .map(|at| at.to_rfc3339())
          .unwrap_or_else(|| "none".to_string());
        return (ScheduleStatus::Next, at);
      }
    }

    if let Some(at) = self.core.queue.when(job) {
      return (ScheduleStatus::Wait, at.to_rfc3339());
    }
    return (ScheduleStatus::None, "none".to_string());
  }

  /// Scheduler status merged with repository info and the archive listing.
  pub async fn get_job_info(&self, job: &Arc<Job>) -> serde_json::Value {
    let mut info = job.get_info().await;
    let status = self.get_job_status(job).await;
    if let Some(map) = info.as_object_mut() {
      map.insert(
        "scheduler".to_string(),
        serde_json::to_value(status).unwrap_or_else(|_| json!({})),
      );
    }
    return info;
  }

  /// Spawns the control task. Only the first call has an effect.
  pub fn start(&self) {
    let Some(wakeup_rx) = self.wakeup_rx.lock().take() else {
      warn!("[Scheduler] Already started");
      return;
    };

    let core = self.core.clone();
    *self.control.lock() = Some(tokio::spawn(core.control_loop(wakeup_rx)));
  }

  /// Requests shutdown and joins the control task. Workers already running
  /// are not cancelled; their backup subprocesses finish naturally.
  pub async fn stop(&self) {
    let _ = self.wakeup_tx.send(Wakeup::Shutdown);
    let control = self.control.lock().take();
    if let Some(handle) = control {
      let _ = handle.await;
    }
  }

  #[cfg(test)]
  pub(crate) fn queue(&self) -> &WaitQueue {
    return &self.core.queue;
  }
}

impl Core {
  async fn control_loop(self, mut wakeup_rx: mpsc::UnboundedReceiver<Wakeup>) {
    debug!("[Scheduler] Launched control task");

    loop {
      if self.jobs.lock().is_empty() {
        warn!("No jobs registered, nothing to do");
        break;
      }

      let (next_at, next_jobs) = self.queue.pop_next();
      {
        let mut claimed = self.shared.claimed.lock();
        claimed.at = next_at;
        claimed.jobs = next_jobs.clone();
      }
      for job in &next_jobs {
        self
          .shared
          .observe(job.name(), ScheduleStatus::Next, job.retry_count());
      }

      let wakeup = match next_at {
        Some(at) => {
          let delay = (at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
          debug!("[Scheduler] Determined next action at {at}, waiting for {delay:?}");
          tokio::select! {
            _ = tokio::time::sleep(delay) => Wakeup::Timer,
            received = wakeup_rx.recv() => received.unwrap_or(Wakeup::Shutdown),
          }
        }
        None => {
          debug!("[Scheduler] All jobs currently running, waiting for one to finish");
          wakeup_rx.recv().await.unwrap_or(Wakeup::Shutdown)
        }
      };

      match wakeup {
        Wakeup::Shutdown => break,
        Wakeup::Update | Wakeup::Pause(false) => {
          debug!("[Scheduler] Wakeup due to update, re-evaluating queue");
          self.requeue_claimed();
        }
        Wakeup::Pause(true) => {
          self.shared.emit_pause(true);
          loop {
            match wakeup_rx.recv().await.unwrap_or(Wakeup::Shutdown) {
              Wakeup::Shutdown => {
                debug!("[Scheduler] Exit control task");
                return;
              }
              Wakeup::Pause(false) => break,
              // Nothing is dispatched while paused.
              Wakeup::Timer | Wakeup::Update | Wakeup::Pause(true) => continue,
            }
          }
          self.shared.emit_pause(false);
          self.requeue_claimed();
        }
        Wakeup::Timer => {
          debug!("[Scheduler] Wakeup due to timer, launching jobs");
          let due = {
            let mut claimed = self.shared.claimed.lock();
            claimed.at = None;
            std::mem::take(&mut claimed.jobs)
          };
          for job in due {
            self.spawn_worker(job);
          }
        }
      }
    }

    debug!("[Scheduler] Exit control task");
  }

  /// Puts the claimed bucket back into the queue, notifications suppressed
  /// (the control task re-pops immediately afterwards).
  fn requeue_claimed(&self) {
    let (at, jobs) = {
      let mut claimed = self.shared.claimed.lock();
      (claimed.at.take(), std::mem::take(&mut claimed.jobs))
    };
    let Some(at) = at else {
      return;
    };

    for job in jobs {
      self.queue.put(job.clone(), at, false);
      self
        .shared
        .observe(job.name(), ScheduleStatus::Wait, job.retry_count());
    }
  }

  fn spawn_worker(&self, job: Arc<Job>) {
    self.shared.running.lock().insert(job.name().to_string());
    self
      .shared
      .observe(job.name(), ScheduleStatus::Running, job.retry_count());

    let core = self.clone();
    tokio::spawn(async move {
      core.worker(job).await;
    });
  }

  /// One firing of one job: run it, then route the outcome through the
  /// retry state machine and re-queue.
  async fn worker(&self, job: Arc<Job>) {
    let retry = job.retry_count();
    if retry > 0 {
      info!("[JOB] Launching retry {retry} for job '{}'", job.name());
    } else {
      info!("[JOB] Launching job '{}'", job.name());
    }

    let successful = job.run().await;

    if successful {
      if retry > 0 {
        info!(
          "[JOB] Retry {retry} for job '{}' completed successfully",
          job.name()
        );
      } else {
        info!("[JOB] Job '{}' completed successfully", job.name());
      }

      job.store_retry_count(0);
      let now = Utc::now();
      job.set_last_archive(now);
      self
        .cache
        .set_datetime(&Cache::cache_key_last_archive(job.name()), now)
        .await;

      self.shared.running.lock().remove(job.name());
      self.queue.put(job.clone(), job.schedule().next(now), true);
      self.shared.observe(job.name(), ScheduleStatus::Wait, 0);
      return;
    }

    let give_up = retry >= job.retry_max();
    if give_up {
      error!("[JOB] Job '{}' failed. Giving up.", job.name());
      job.store_retry_count(-1);
      job.hooks().give_up.trigger(job.hook_env());

      self.shared.running.lock().remove(job.name());
      // Back to the natural schedule slot, not a retry slot.
      self
        .queue
        .put(job.clone(), job.schedule().next(Utc::now()), true);
    } else {
      warn!("[JOB] Job '{}' failed", job.name());
      // A post-give-up failure starts counting from zero again.
      job.store_retry_count(retry.max(0) + 1);

      self.shared.running.lock().remove(job.name());
      let retry_at = Utc::now() + job.retry_delay();
      debug!(
        "[JOB] Retry for job '{}' scheduled in {} s",
        job.name(),
        job.retry_delay().num_seconds()
      );
      self.queue.put(job.clone(), retry_at, true);
    }

    self
      .shared
      .observe(job.name(), ScheduleStatus::Wait, job.retry_count());
  }
}
