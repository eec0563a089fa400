use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_FILE_NAME: &str = ".nightlist.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock: {holder}")]
    Held { holder: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Mutual exclusion for runs sharing a data directory.
///
/// Runs in one process serialize on an in-memory mutex; separate processes on a lock
/// file created with `create_new`. A lock file older than `stale_after` is taken over.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
    local: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    run_id: Uuid,
    _local: OwnedMutexGuard<()>,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
            local: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_dir(dir: &Path, stale_after: Duration) -> Self {
        Self::new(dir.join(LOCK_FILE_NAME), stale_after)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self, run_id: Uuid) -> Result<RunLockGuard, LockError> {
        let local = Arc::clone(&self.local)
            .try_lock_owned()
            .map_err(|_| LockError::Held {
                holder: "a run in this process".to_string(),
            })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| self.io(source))?;
        }

        let mut took_over = false;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await
            {
                Ok(mut file) => {
                    let stamp = format!(
                        "pid={} run_id={} started_at={}\n",
                        std::process::id(),
                        run_id,
                        Utc::now().to_rfc3339()
                    );
                    file.write_all(stamp.as_bytes())
                        .await
                        .map_err(|source| self.io(source))?;
                    debug!(path = %self.path.display(), %run_id, "run lock acquired");
                    return Ok(RunLockGuard {
                        path: self.path.clone(),
                        run_id,
                        _local: local,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && !took_over => {
                    let holder = read_holder(&self.path).await;
                    if !self.is_stale().await {
                        return Err(LockError::Held { holder });
                    }
                    self.take_over(&holder).await?;
                    took_over = true;
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(LockError::Held {
                        holder: read_holder(&self.path).await,
                    });
                }
                Err(err) => return Err(self.io(err)),
            }
        }
    }

    /// Move a stale lock aside. The rename is atomic, so only one contender gets the
    /// file; if what it got is not the stale lock it inspected, someone else has
    /// refreshed the lock in between and it is put back.
    async fn take_over(&self, stale_holder: &str) -> Result<(), LockError> {
        let aside = self
            .path
            .with_file_name(format!("{LOCK_FILE_NAME}.{}.stale", Uuid::new_v4()));
        match fs::rename(&self.path, &aside).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io(err)),
        }

        let moved = read_holder(&aside).await;
        if moved != stale_holder {
            // Restore without clobbering a lock created since the rename.
            let restored = fs::hard_link(&aside, &self.path).await;
            let _ = fs::remove_file(&aside).await;
            return Err(match restored {
                Ok(()) => LockError::Held { holder: moved },
                Err(_) => LockError::Held {
                    holder: read_holder(&self.path).await,
                },
            });
        }

        warn!(path = %self.path.display(), holder = %stale_holder, "taking over stale run lock");
        if let Err(err) = fs::remove_file(&aside).await {
            debug!(path = %aside.display(), error = %err, "could not remove stale lock copy");
        }
        Ok(())
    }

    async fn is_stale(&self) -> bool {
        let modified = match fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.stale_after)
            .unwrap_or(false)
    }

    fn io(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RunLockGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        // Only release a lock file that still carries this run's id.
        let owned = std::fs::read_to_string(&self.path)
            .map(|contents| contents.contains(&format!("run_id={}", self.run_id)))
            .unwrap_or(false);
        if !owned {
            debug!(path = %self.path.display(), run_id = %self.run_id, "run lock no longer ours; leaving it");
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to release run lock");
            }
        }
    }
}

async fn read_holder(path: &Path) -> String {
    fs::read_to_string(path)
        .await
        .unwrap_or_default()
        .trim()
        .to_string()
}
