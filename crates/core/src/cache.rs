use chrono::{DateTime, Utc};
use log::*;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Small persistent key/value store, one JSON object per file, living in the
/// borg base directory. Survives daemon restarts; losing a write after a
/// crash is acceptable because the next archive listing recovers the truth.
pub struct Cache {
  path: PathBuf,
  data: Mutex<Map<String, Value>>,
}

impl Cache {
  /// Loads the cache file, treating a missing or unreadable file as empty.
  pub async fn open(path: PathBuf) -> Cache {
    let data = match tokio::fs::read_to_string(&path).await {
      Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
        Ok(data) => data,
        Err(err) => {
          warn!("Ignoring malformed cache file '{}': {err}", path.display());
          Map::new()
        }
      },
      Err(_) => Map::new(),
    };

    return Cache {
      path,
      data: Mutex::new(data),
    };
  }

  pub fn cache_key_last_archive(job_name: &str) -> String {
    return format!("job_{job_name}_last_dt");
  }

  pub fn get_datetime(&self, key: &str) -> Option<DateTime<Utc>> {
    let data = self.data.lock();
    let text = data.get(key)?.as_str()?;
    return DateTime::parse_from_rfc3339(text)
      .ok()
      .map(|dt| dt.with_timezone(&Utc));
  }

  #[cfg(test)]
  pub(crate) fn test_empty() -> Cache {
    return Cache {
      path: PathBuf::from("/dev/null"),
      data: Mutex::new(Map::new()),
    };
  }

  /// Stores `value` under `key` and flushes the whole map to disk. Write
  /// failures are logged, not propagated.
  pub async fn set_datetime(&self, key: &str, value: DateTime<Utc>) {
    let serialized = {
      let mut data = self.data.lock();
      data.insert(key.to_string(), Value::String(value.to_rfc3339()));
      serde_json::to_string(&*data)
    };

    match serialized {
      Ok(contents) => {
        if let Err(err) = tokio::fs::write(&self.path, contents).await {
          error!("Could not write cache file '{}': {err}", self.path.display());
        }
      }
      Err(err) => {
        error!("Could not serialize cache: {err}");
      }
    }
  }
}
