use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::error::DaemonError;

/// Exclusive hold on the pidfile for the lifetime of the daemon.
///
/// Only the lock counts: a leftover file naming a live but unrelated process
/// (the pid was reused) does not block startup. The file itself outlives the
/// daemon, emptied on release, so every holder locks the same inode.
pub struct PidFile {
    path: PathBuf,
    lock: Flock<File>,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // no truncate before the lock is held, the holder's pid must survive a failed attempt
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(DaemonError::AlreadyRunning {
                    pidfile: path.to_path_buf(),
                });
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        let mut previous = String::new();
        if lock.read_to_string(&mut previous).is_ok() && !previous.trim().is_empty() {
            warn!(
                pidfile = %path.display(),
                stale_pid = %previous.trim(),
                "overwriting stale pidfile"
            );
        }

        lock.set_len(0)?;
        lock.seek(SeekFrom::Start(0))?;
        writeln!(lock, "{}", std::process::id())?;
        lock.sync_all()?;
        debug!(pidfile = %path.display(), "pidfile locked");

        Ok(PidFile {
            path: path.to_path_buf(),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pid recorded in a pidfile, whoever holds it.
    pub fn read_pid(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // never unlinked: a waiter may already hold an open handle to this inode
        if let Err(e) = self.lock.set_len(0) {
            debug!(pidfile = %self.path.display(), error = %e, "failed to clear pidfile");
        }
        let _ = self.lock.sync_all();
    }
}
