use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum DirError {
  #[error("Failed to create directory '{path}': {source}")]
  Create {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Cannot write to '{0}'")]
  NotWritable(PathBuf),
}

/// The working directories of the daemon: the borg base directory (passed as
/// BORG_BASE_DIR, also holding the persistent cache) and the parent directory
/// for repository mounts.
#[derive(Debug, Clone)]
pub struct BaseDir {
  base: PathBuf,
  mount: PathBuf,
}

impl BaseDir {
  pub fn new(base: impl Into<PathBuf>, mount: impl Into<PathBuf>) -> Self {
    return BaseDir {
      base: base.into(),
      mount: mount.into(),
    };
  }

  pub fn base(&self) -> &Path {
    return &self.base;
  }

  pub fn cache_path(&self, file_name: &str) -> PathBuf {
    return self.base.join(file_name);
  }

  pub fn mount_path(&self, job_name: &str) -> PathBuf {
    return self.mount.join(job_name);
  }

  /// Creates the base and mount directories and verifies both are writable.
  /// A failure here maps to the daemon's directory-permission exit code.
  pub async fn ensure_directory_structure(&self) -> Result<(), DirError> {
    for dir in [&self.base, &self.mount] {
      if !fs::try_exists(dir).await.unwrap_or(false) {
        fs::create_dir_all(dir).await.map_err(|source| DirError::Create {
          path: dir.clone(),
          source,
        })?;
      }

      probe_writable(dir).await?;
    }

    return Ok(());
  }
}

async fn probe_writable(dir: &Path) -> Result<(), DirError> {
  let probe = dir.join(".bsrvd-write-probe");
  if fs::write(&probe, b"").await.is_err() {
    return Err(DirError::NotWritable(dir.to_path_buf()));
  }
  let _ = fs::remove_file(&probe).await;
  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_creates_missing_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = BaseDir::new(tmp.path().join("base"), tmp.path().join("mnt"));

    dirs.ensure_directory_structure().await.unwrap();

    assert!(dirs.base().is_dir());
    assert!(dirs.mount_path("etc").parent().unwrap().is_dir());
    assert_eq!(dirs.cache_path("bsrvd.cache"), tmp.path().join("base/bsrvd.cache"));
  }

  #[tokio::test]
  async fn test_unwritable_directory_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let read_only = tmp.path().join("ro");
    fs::create_dir(&read_only).await.unwrap();
    let mut perms = std::fs::metadata(&read_only).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o500);
    std::fs::set_permissions(&read_only, perms).unwrap();

    let dirs = BaseDir::new(&read_only, tmp.path().join("mnt"));
    assert!(matches!(
      dirs.ensure_directory_structure().await,
      Err(DirError::NotWritable(_))
    ));
  }
}
