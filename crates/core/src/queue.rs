use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::job::Job;

type UpdateCallback = Box<dyn Fn() + Send + Sync>;

/// Time-ordered wake queue: instants mapped to the jobs due at them, mutated
/// concurrently by the control loop, workers, and the IPC surface.
///
/// All mutations run under one mutex; the update callback is invoked after
/// the lock is released and must not re-enter the queue synchronously on a
/// path that could recurse (the scheduler only signals its control task).
pub struct WaitQueue {
  buckets: Mutex<BTreeMap<DateTime<Utc>, Vec<Arc<Job>>>>,
  on_update: Mutex<Option<UpdateCallback>>,
}

impl WaitQueue {
  pub fn new() -> WaitQueue {
    return WaitQueue {
      buckets: Mutex::new(BTreeMap::new()),
      on_update: Mutex::new(None),
    };
  }

  pub fn set_update_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
    *self.on_update.lock() = Some(Box::new(callback));
  }

  fn notify(&self) {
    if let Some(ref callback) = *self.on_update.lock() {
      callback();
    }
  }

  /// Appends `job` to the bucket at `at`, creating the bucket if absent.
  pub fn put(&self, job: Arc<Job>, at: DateTime<Utc>, notify: bool) {
    {
      let mut buckets = self.buckets.lock();
      buckets.entry(at).or_default().push(job);
    }
    if notify {
      self.notify();
    }
  }

  /// Removes the first queued occurrence of `job` (name equality). Empty
  /// buckets are dropped. Returns whether the job was found.
  pub fn delete(&self, job: &Job, notify: bool) -> bool {
    let found = {
      let mut buckets = self.buckets.lock();
      let hit = buckets.iter_mut().find_map(|(at, jobs)| {
        return jobs
          .iter()
          .position(|queued| queued.name() == job.name())
          .map(|index| (*at, index));
      });

      match hit {
        Some((at, index)) => {
          let bucket = buckets.get_mut(&at).expect("bucket just found");
          bucket.remove(index);
          if bucket.is_empty() {
            buckets.remove(&at);
          }
          true
        }
        None => false,
      }
    };

    if found && notify {
      self.notify();
    }
    return found;
  }

  /// Re-schedules a queued `job` to `at` with a single notification. Not
  /// finding the job leaves the queue untouched.
  pub fn move_to(&self, job: &Arc<Job>, at: DateTime<Utc>) -> bool {
    if !self.delete(job, false) {
      return false;
    }
    self.put(job.clone(), at, false);
    self.notify();
    return true;
  }

  /// The first instant `job` is queued at, if any.
  pub fn when(&self, job: &Job) -> Option<DateTime<Utc>> {
    let buckets = self.buckets.lock();
    return buckets.iter().find_map(|(at, jobs)| {
      return jobs
        .iter()
        .any(|queued| queued.name() == job.name())
        .then_some(*at);
    });
  }

  /// Removes and returns the earliest bucket, or `(None, [])` when empty.
  pub fn pop_next(&self) -> (Option<DateTime<Utc>>, Vec<Arc<Job>>) {
    let mut buckets = self.buckets.lock();
    return match buckets.pop_first() {
      Some((at, jobs)) => (Some(at), jobs),
      None => (None, vec![]),
    };
  }

  /// Non-destructive variant of [`WaitQueue::pop_next`], for status
  /// assembly.
  pub fn peek_next(&self) -> Option<DateTime<Utc>> {
    return self.buckets.lock().keys().next().copied();
  }

  pub fn is_empty(&self) -> bool {
    return self.buckets.lock().is_empty();
  }
}
