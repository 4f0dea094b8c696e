//! Advisory lock on the data root.
//!
//! Exactly one core instance may own a data directory. The lock is a file
//! holding the owner's pid; a stale lock (owner no longer alive) is taken
//! over, a live conflict fails fast.

use std::path::{Path, PathBuf};

use thiserror::Error;

const LOCK_FILE: &str = "agentd.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("data directory '{dir}' is locked by live process {pid}")]
    Held { dir: String, pid: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Held for the process lifetime; dropping releases the lock file.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the advisory lock for `data_dir`.
    pub fn acquire(data_dir: &Path) -> Result<Self, LockError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE);

        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                // A live owner conflicts even when it is this process: two
                // cores must never share one data directory.
                if is_process_alive(pid) {
                    return Err(LockError::Held {
                        dir: data_dir.to_string_lossy().to_string(),
                        pid,
                    });
                }
                tracing::warn!(pid, "stale lock from dead process — taking over");
            }
        }

        std::fs::write(&path, std::process::id().to_string())?;
        tracing::debug!(path = %path.display(), "data directory locked");
        Ok(Self { path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // POSIX: kill(pid, 0) probes without signaling. EPERM still means the
    // process exists.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Conservative on non-Unix platforms.
    true
}
