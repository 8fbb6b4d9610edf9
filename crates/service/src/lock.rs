//! Instance lock for the timer service
//!
//! The service removes whatever file sits at its socket path before binding.
//! Taking an exclusive `flock` on `<socket>.lock` first guarantees that the
//! file being removed is really stale and not a live service's socket.
//!
//! The lock file itself is never unlinked. Every contender must lock the
//! same inode, otherwise two services could each hold a lock on a different
//! file at once.

use crate::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive lock held for the lifetime of a running service
#[derive(Debug)]
pub struct ServiceLock {
    path: PathBuf,
    file: File,
}

/// Lock file content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: u64,
}

/// Lock file path for a socket path (`<socket>.lock`)
pub fn lock_path_for(socket_path: &Path) -> PathBuf {
    let mut name = OsString::from(socket_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

impl ServiceLock {
    /// Acquire the lock for `socket_path`
    ///
    /// Fails with [`ServiceError::AlreadyRunning`] when another process holds it.
    pub fn acquire(socket_path: &Path) -> Result<Self> {
        let path = lock_path_for(socket_path);
        let lock_err = |source: io::Error| ServiceError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;

        if !try_flock_exclusive(&file).map_err(lock_err)? {
            let pid = read_lock_content(&mut file).ok().map(|info| info.pid);
            return Err(ServiceError::AlreadyRunning {
                path: socket_path.to_path_buf(),
                pid,
            });
        }

        write_lock_content(&mut file).map_err(lock_err)?;
        tracing::debug!("Acquired service lock {}", path.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether some process currently holds the lock for `socket_path`
    pub fn is_held(socket_path: &Path) -> bool {
        let path = lock_path_for(socket_path);
        match OpenOptions::new().read(true).write(true).open(&path) {
            // Dropping `file` releases a lock we may have just taken
            Ok(file) => matches!(try_flock_exclusive(&file), Ok(false)),
            Err(_) => false,
        }
    }

    /// Lock file content, if present and readable
    pub fn read_info(socket_path: &Path) -> Option<LockInfo> {
        let mut file = File::open(lock_path_for(socket_path)).ok()?;
        read_lock_content(&mut file).ok()
    }
}

impl Drop for ServiceLock {
    /// Clear our pid while still locked; closing the file releases the lock
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
    }
}

/// Try to acquire an exclusive file lock without blocking
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn write_lock_content(file: &mut File) -> io::Result<()> {
    let info = LockInfo {
        pid: std::process::id(),
        started_at: current_timestamp_ms(),
    };
    let serialized = serde_json::to_vec(&info)?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&serialized)?;
    file.sync_all()
}

fn read_lock_content(file: &mut File) -> io::Result<LockInfo> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(serde_json::from_str(&contents)?)
}

fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
