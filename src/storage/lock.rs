//! Lock file guarding against two pipeline runs touching the store at once.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::LockError;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: i64,
}

/// Exclusive run marker backed by a `create_new` file.
///
/// The file is removed when the guard is dropped. A lock whose timestamp is
/// older than the configured staleness window is assumed abandoned (crashed
/// process) and taken over. A lock whose body can't be read is aged by its
/// file modification time instead, so a holder that has created the file but
/// not yet written it is still respected.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Derive the lock path for a store file (`state.json` -> `state.json.lock`).
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(path: &Path, stale_after: Duration, now_ms: i64) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::try_create(path, now_ms) {
            Ok(lock) => Ok(lock),
            Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
                let (pid, age_ms) = match read_info(path) {
                    Some(info) => (info.pid, now_ms.saturating_sub(info.acquired_at)),
                    // Empty between create_new and write_all, or mangled:
                    // fall back to how long ago the file was touched
                    None => match file_age_ms(path) {
                        Ok(age) => (0, age),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            return Self::try_create(path, now_ms);
                        }
                        Err(e) => return Err(e.into()),
                    },
                };

                if age_ms < stale_ms {
                    return Err(LockError::Held {
                        pid,
                        age_secs: age_ms / 1000,
                    });
                }

                tracing::warn!(
                    path = %path.display(),
                    pid,
                    age_secs = age_ms / 1000,
                    "Taking over stale run lock"
                );
                std::fs::remove_file(path)?;
                Self::try_create(path, now_ms)
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path, now_ms: i64) -> Result<Self, LockError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: now_ms,
        };
        let body = serde_json::to_vec(&info)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Wall-clock time since the lock file was last modified.
fn file_age_ms(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let age = modified.elapsed().unwrap_or_default();
    Ok(i64::try_from(age.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_lock_path_for_store() {
        let path = RunLock::path_for(Path::new("/data/state.json"));
        assert_eq!(path, PathBuf::from("/data/state.json.lock"));
    }

    #[test]
    fn test_second_acquire_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let _held = RunLock::acquire(&path, HOUR, 1_000).unwrap();
        let second = RunLock::acquire(&path, HOUR, 2_000);
        assert!(matches!(second, Err(LockError::Held { .. })));
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        {
            let _held = RunLock::acquire(&path, HOUR, 1_000).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        assert!(RunLock::acquire(&path, HOUR, 2_000).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        std::fs::write(&path, r#"{"pid":1,"acquired_at":0}"#).unwrap();

        let now = 2 * 3_600_000;
        assert!(RunLock::acquire(&path, HOUR, now).is_ok());
    }

    #[test]
    fn test_fresh_unreadable_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        std::fs::write(&path, "").unwrap();

        let result = RunLock::acquire(&path, HOUR, 10);
        assert!(matches!(result, Err(LockError::Held { pid: 0, .. })));
        // The other run's file is left alone
        assert!(path.exists());
    }

    #[test]
    fn test_old_unreadable_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        std::fs::write(&path, "garbage").unwrap();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - 2 * HOUR)
            .unwrap();

        let lock = RunLock::acquire(&path, HOUR, 10).unwrap();
        let info = read_info(&path).unwrap();
        assert_eq!(info.pid, std::process::id());
        drop(lock);
    }
}
